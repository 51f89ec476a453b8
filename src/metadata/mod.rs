// src/metadata/mod.rs
//! Client metadata: documents, group graph, and the resolver
//!
//! The metadata subsystem turns a client identity into an immutable
//! [`ClientMetadata`] snapshot: the fully expanded group membership, the
//! category map, the ordered bundle list, and per-client connector data.
//! Everything downstream (assembly, binding, decisions) reads only the
//! snapshot.

pub mod db;
pub mod graph;
mod resolver;

pub use db::ClientStore;
pub use graph::{Expansion, GroupGraph, GroupRef};
pub use resolver::{AuthInfo, MetadataResolver};

use crate::error::{Error, Result};
use crate::xml::Element;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use uuid::Uuid;

/// Immutable per-client metadata snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMetadata {
    pub hostname: String,
    pub profile: String,
    pub groups: BTreeSet<String>,
    pub categories: BTreeMap<String, String>,
    pub aliases: BTreeSet<String>,
    pub addresses: BTreeSet<IpAddr>,
    pub uuid: Option<Uuid>,
    pub password: Option<String>,
    pub bundles: Vec<String>,
    /// Opaque per-plugin data blobs, keyed by connector name
    pub connectors: BTreeMap<String, serde_json::Value>,
    pub version: Option<String>,
}

impl ClientMetadata {
    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains(name)
    }

    /// The active group in a category, if any
    pub fn group_in_category(&self, category: &str) -> Option<&str> {
        self.categories.get(category).map(String::as_str)
    }
}

/// One `<Client>` record from the clients document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientRecord {
    pub name: String,
    pub profile: Option<String>,
    pub uuid: Option<Uuid>,
    pub password: Option<String>,
    /// Only the per-client password authenticates this client
    pub secure: bool,
    /// May connect from any address
    pub floating: bool,
    pub addresses: BTreeSet<IpAddr>,
    /// Alias name -> optional pinned address
    pub aliases: BTreeMap<String, Option<IpAddr>>,
    /// Declared memberships and negations
    pub groups: Vec<GroupRef>,
    pub version: Option<String>,
}

impl ClientRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn from_element(elem: &Element) -> Result<Self> {
        let name = elem
            .attr("name")
            .ok_or_else(|| Error::MetadataConsistency("Client element without name".to_string()))?;

        let mut record = ClientRecord::new(name);
        record.profile = elem.attr("profile").map(str::to_string);
        record.password = elem.attr("password").map(str::to_string);
        record.secure = elem.bool_attr("secure");
        record.floating = elem.bool_attr("floating");

        if let Some(uuid) = elem.attr("uuid") {
            record.uuid = Some(uuid.parse().map_err(|_| {
                Error::MetadataConsistency(format!("client {name} has malformed uuid {uuid}"))
            })?);
        }
        if let Some(address) = elem.attr("address") {
            record.addresses.insert(parse_addr(name, address)?);
        }

        for child in &elem.children {
            match child.name.as_str() {
                "Alias" => {
                    let alias = child.attr("name").ok_or_else(|| {
                        Error::MetadataConsistency(format!("client {name} has Alias without name"))
                    })?;
                    let address = match child.attr("address") {
                        Some(a) => {
                            let addr = parse_addr(name, a)?;
                            record.addresses.insert(addr);
                            Some(addr)
                        }
                        None => None,
                    };
                    record.aliases.insert(alias.to_string(), address);
                }
                "Address" => {
                    if let Some(a) = child.attr("address") {
                        record.addresses.insert(parse_addr(name, a)?);
                    }
                }
                "Group" => {
                    if let Some(group) = child.attr("name") {
                        record.groups.push(GroupRef {
                            name: group.to_string(),
                            negate: child.bool_attr("negate"),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(record)
    }
}

fn parse_addr(client: &str, value: &str) -> Result<IpAddr> {
    value.parse().map_err(|_| {
        Error::MetadataConsistency(format!("client {client} has malformed address {value}"))
    })
}

/// Parsed clients document with identity lookup indices
#[derive(Debug, Default)]
pub struct ClientsDoc {
    records: Vec<ClientRecord>,
    by_name: HashMap<String, usize>,
    by_uuid: HashMap<Uuid, usize>,
    by_alias: HashMap<String, usize>,
    by_address: HashMap<IpAddr, usize>,
}

impl ClientsDoc {
    /// Build from a `<Clients>` document
    pub fn from_document(doc: &Element) -> Result<Self> {
        if doc.name != "Clients" {
            return Err(Error::MetadataConsistency(format!(
                "expected <Clients> document, found <{}>",
                doc.name
            )));
        }

        let mut clients = ClientsDoc::default();
        for child in doc.children_named("Client") {
            let record = ClientRecord::from_element(child)?;
            let idx = clients.records.len();
            if clients
                .by_name
                .insert(record.name.clone(), idx)
                .is_some()
            {
                return Err(Error::MetadataConsistency(format!(
                    "duplicate client declaration: {}",
                    record.name
                )));
            }
            if let Some(uuid) = record.uuid {
                clients.by_uuid.insert(uuid, idx);
            }
            for alias in record.aliases.keys() {
                clients.by_alias.insert(alias.clone(), idx);
            }
            for address in &record.addresses {
                clients.by_address.insert(*address, idx);
            }
            clients.records.push(record);
        }
        Ok(clients)
    }

    pub fn get(&self, name: &str) -> Option<&ClientRecord> {
        self.by_name.get(name).map(|&idx| &self.records[idx])
    }

    pub fn get_by_uuid(&self, uuid: &Uuid) -> Option<&ClientRecord> {
        self.by_uuid.get(uuid).map(|&idx| &self.records[idx])
    }

    /// Match a resolved hostname against canonical names, then aliases
    pub fn get_by_hostname(&self, hostname: &str) -> Option<&ClientRecord> {
        self.get(hostname)
            .or_else(|| self.by_alias.get(hostname).map(|&idx| &self.records[idx]))
    }

    pub fn get_by_address(&self, address: &IpAddr) -> Option<&ClientRecord> {
        self.by_address.get(address).map(|&idx| &self.records[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(xml: &str) -> ClientsDoc {
        ClientsDoc::from_document(&Element::parse(xml).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_clients() {
        let clients = doc(
            r#"<Clients version="3.0">
                 <Client name="web1.example.com" profile="web"
                         uuid="8d1b3d62-2f04-44f9-9e2c-1a3a41d4e93b"
                         address="192.0.2.10" secure="true">
                   <Alias name="www" address="192.0.2.11"/>
                   <Group name="dmz"/>
                   <Group name="selinux-enabled" negate="true"/>
                 </Client>
                 <Client name="db1.example.com" profile="db" floating="true"/>
               </Clients>"#,
        );

        let web = clients.get("web1.example.com").unwrap();
        assert_eq!(web.profile.as_deref(), Some("web"));
        assert!(web.secure);
        assert!(!web.floating);
        assert_eq!(web.addresses.len(), 2);
        assert_eq!(web.groups.len(), 2);
        assert!(web.groups[1].negate);

        let db = clients.get("db1.example.com").unwrap();
        assert!(db.floating);
    }

    #[test]
    fn test_identity_indices() {
        let clients = doc(
            r#"<Clients>
                 <Client name="web1" uuid="8d1b3d62-2f04-44f9-9e2c-1a3a41d4e93b"
                         address="192.0.2.10">
                   <Alias name="www"/>
                 </Client>
               </Clients>"#,
        );

        let uuid: Uuid = "8d1b3d62-2f04-44f9-9e2c-1a3a41d4e93b".parse().unwrap();
        assert!(clients.get_by_uuid(&uuid).is_some());
        assert!(clients.get_by_hostname("www").is_some());
        assert!(clients
            .get_by_address(&"192.0.2.10".parse().unwrap())
            .is_some());
        assert!(clients.get_by_hostname("unknown").is_none());
    }

    #[test]
    fn test_duplicate_client_rejected() {
        let result = ClientsDoc::from_document(
            &Element::parse(
                r#"<Clients>
                     <Client name="dup"/>
                     <Client name="dup"/>
                   </Clients>"#,
            )
            .unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_address_rejected() {
        let result = ClientsDoc::from_document(
            &Element::parse(r#"<Clients><Client name="c" address="not-an-ip"/></Clients>"#)
                .unwrap(),
        );
        assert!(result.is_err());
    }
}
