// src/metadata/resolver.rs

//! Identity resolution, authentication binding, and metadata construction
//!
//! Resolution order (first match wins): certificate CN against known names
//! and UUIDs, claimed name as UUID, reverse DNS of the peer address against
//! names then aliases, peer address against declared addresses, and finally
//! dynamic registration against the default profile. Reverse DNS is the
//! only network I/O on this path and runs under a short budget, falling
//! back to unresolved on expiry.
//!
//! Built metadata snapshots are memoized per client and keyed to the
//! repository snapshot generation; probe ingestion invalidates a single
//! client, a snapshot swap invalidates everything implicitly.

use super::{ClientMetadata, ClientRecord, ClientStore, ClientsDoc, GroupGraph, GroupRef};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::plugin::Connector;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Credentials presented with a request
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthInfo<'a> {
    /// CN of a verified client certificate, when the fronting TLS
    /// terminator supplied one
    pub cert_cn: Option<&'a str>,
    pub password: Option<&'a str>,
}

/// Suppression window for repeated authentication failure logs
const AUTH_LOG_WINDOW: Duration = Duration::from_secs(60);
const AUTH_LOG_BURST: u32 = 3;

pub struct MetadataResolver {
    options: Arc<Options>,
    store: Arc<ClientStore>,
    memo: DashMap<String, (u64, Arc<ClientMetadata>)>,
    auth_failures: DashMap<String, (Instant, u32)>,
}

impl MetadataResolver {
    pub fn new(options: Arc<Options>, store: Arc<ClientStore>) -> Self {
        Self {
            options,
            store,
            memo: DashMap::new(),
            auth_failures: DashMap::new(),
        }
    }

    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    /// Drop the memoized snapshot for one client (probe data changed)
    pub fn invalidate(&self, client: &str) {
        self.memo.remove(client);
    }

    /// Resolve the canonical client name for a request.
    ///
    /// `claimed` is the name the client asserts about itself (if any);
    /// `peer` is the connection source address.
    pub async fn resolve_identity(
        &self,
        clients: &ClientsDoc,
        graph: &GroupGraph,
        claimed: Option<&str>,
        peer: IpAddr,
        auth: &AuthInfo<'_>,
    ) -> Result<String> {
        // 1. Certificate CN against known client names and UUIDs
        if let Some(cn) = auth.cert_cn {
            if self.store.contains(cn) || clients.get(cn).is_some() {
                return self.authenticate(cn, peer, auth, true);
            }
            if let Ok(uuid) = cn.parse::<Uuid>() {
                if let Some(record) = self.lookup_uuid(clients, &uuid) {
                    return self.authenticate(&record.name, peer, auth, true);
                }
            }
        }

        // 2. Claimed name as UUID
        if let Some(uuid) = claimed.and_then(|c| c.parse::<Uuid>().ok()) {
            if let Some(record) = self.lookup_uuid(clients, &uuid) {
                return self.authenticate(&record.name, peer, auth, false);
            }
        }

        // 3. Reverse DNS, canonical name then aliases
        let resolved = self.reverse_lookup(peer).await;
        if let Some(hostname) = resolved.as_deref() {
            if let Some(record) = clients.get_by_hostname(hostname) {
                let name = record.name.clone();
                return self.authenticate(&name, peer, auth, false);
            }
            if self.store.contains(hostname) {
                return self.authenticate(hostname, peer, auth, false);
            }
        }

        // 4. Peer address against declared addresses
        if let Some(record) = clients.get_by_address(&peer) {
            let name = record.name.clone();
            return self.authenticate(&name, peer, auth, false);
        }

        // 5. Dynamic registration against the default profile
        if self.options.metadata.dynamic_registration {
            if let Some(profile) = graph.default_profile() {
                let name = resolved
                    .or_else(|| claimed.map(str::to_string))
                    .unwrap_or_else(|| peer.to_string());
                let authenticated = self.authenticate(&name, peer, auth, false)?;
                if !self.store.contains(&name) {
                    let mut record = ClientRecord::new(&name);
                    record.profile = Some(profile.to_string());
                    record.addresses.insert(peer);
                    debug!(client = name.as_str(), profile, "registering new client");
                    self.store.register(record)?;
                }
                return Ok(authenticated);
            }
        }

        Err(Error::MetadataConsistency(format!(
            "cannot resolve client identity for peer {peer}"
        )))
    }

    fn lookup_uuid(&self, clients: &ClientsDoc, uuid: &Uuid) -> Option<ClientRecord> {
        clients
            .get_by_uuid(uuid)
            .cloned()
            .or_else(|| self.store.find_by_uuid(uuid))
    }

    /// Bind credentials and source address to a resolved client
    fn authenticate(
        &self,
        name: &str,
        peer: IpAddr,
        auth: &AuthInfo<'_>,
        cert_matched: bool,
    ) -> Result<String> {
        let record = self.store.get(name).unwrap_or_else(|| ClientRecord::new(name));

        let password_ok = match (auth.password, record.password.as_deref()) {
            (Some(given), Some(own)) => given == own,
            (Some(given), None) => {
                // secure clients accept only their own password
                !record.secure
                    && !self.options.server.password.is_empty()
                    && given == self.options.server.password
            }
            (None, _) => false,
        };
        if record.secure && !password_ok {
            return Err(self.auth_failure(name, "secure client requires its own password"));
        }
        if !password_ok && !cert_matched {
            return Err(self.auth_failure(name, "password rejected"));
        }

        // Address pinning: non-floating clients must connect from a known
        // address unless a certificate vouches for them
        if !record.floating && !cert_matched && !record.addresses.is_empty() {
            if !record.addresses.contains(&peer) {
                return Err(self.auth_failure(
                    name,
                    &format!("address {peer} not registered for non-floating client"),
                ));
            }
        }

        self.auth_failures.remove(name);
        Ok(name.to_string())
    }

    fn auth_failure(&self, client: &str, reason: &str) -> Error {
        let mut entry = self
            .auth_failures
            .entry(client.to_string())
            .or_insert((Instant::now(), 0));
        if entry.0.elapsed() > AUTH_LOG_WINDOW {
            *entry = (Instant::now(), 0);
        }
        entry.1 += 1;
        if entry.1 <= AUTH_LOG_BURST {
            warn!(client, reason, "authentication failed");
        }
        Error::MetadataAuth {
            client: client.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn reverse_lookup(&self, peer: IpAddr) -> Option<String> {
        let budget = self.options.dns_timeout();
        let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&peer));
        match tokio::time::timeout(budget, lookup).await {
            Ok(Ok(Ok(name))) => Some(name),
            Ok(Ok(Err(err))) => {
                debug!(peer = %peer, error = %err, "reverse DNS failed");
                None
            }
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(peer = %peer, "reverse DNS timed out");
                None
            }
        }
    }

    /// Build (or return the memoized) metadata snapshot for a client
    pub fn build(
        &self,
        generation: u64,
        graph: &GroupGraph,
        client: &str,
        connectors: &[Arc<dyn Connector>],
    ) -> Result<Arc<ClientMetadata>> {
        if let Some(cached) = self.memo.get(client) {
            if cached.0 == generation {
                return Ok(cached.1.clone());
            }
        }

        let record = self.store.get(client).ok_or_else(|| {
            Error::MetadataRuntime(format!("metadata requested for unknown client {client}"))
        })?;

        let profile = match record.profile.clone().or_else(|| {
            graph.default_profile().map(str::to_string)
        }) {
            Some(profile) => profile,
            None => {
                return Err(Error::MetadataConsistency(format!(
                    "client {client} has no profile and no default group is declared"
                )))
            }
        };
        if !graph.is_profile(&profile) {
            warn!(client, profile = profile.as_str(), "profile group is not marked profile");
        }

        let mut seeds = vec![GroupRef::assert(profile.clone())];
        seeds.extend(record.groups.iter().cloned());
        let mut connector_blobs = std::collections::BTreeMap::new();
        for connector in connectors {
            for group in connector.additional_groups(client) {
                seeds.push(GroupRef::assert(group));
            }
            if let Some(data) = connector.additional_data(client) {
                connector_blobs.insert(connector.name().to_string(), data);
            }
        }

        let expansion = graph.expand(client, &seeds);

        let metadata = Arc::new(ClientMetadata {
            hostname: client.to_string(),
            profile,
            groups: expansion.groups,
            categories: expansion.categories,
            aliases: record.aliases.keys().cloned().collect(),
            addresses: record.addresses.clone(),
            uuid: record.uuid,
            password: record.password.clone(),
            bundles: expansion.bundles,
            connectors: connector_blobs,
            version: record.version.clone(),
        });

        self.memo
            .insert(client.to_string(), (generation, metadata.clone()));
        Ok(metadata)
    }
}
