// src/probes.rs

//! Probe engine: declaration, ingestion, and metadata fold-in
//!
//! Probes are scripts the client runs on the server's behalf; their output
//! feeds back into group membership and connector data. The engine
//! harvests probe declarations from every [`ProbeProducer`] plugin, hands
//! responses back to the originating plugin, and exposes the accumulated
//! yields to the metadata resolver through the [`Connector`] capability.
//!
//! Ingestion failures are contained: a bad response is logged and skipped,
//! and the client serves from stale metadata on its next run.

use crate::error::{Error, Result};
use crate::metadata::{ClientStore, MetadataResolver};
use crate::plugin::{Connector, Plugin, PluginRegistry, ProbeProducer};
use crate::xml::Element;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// A server-issued probe declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub name: String,
    /// Originating plugin; responses are routed back by this name
    pub source: String,
    pub interpreter: Option<String>,
    pub script: String,
}

impl Probe {
    pub fn to_element(&self) -> Element {
        let mut elem = Element::new("probe")
            .with_attr("name", &self.name)
            .with_attr("source", &self.source)
            .with_text(&self.script);
        if let Some(interpreter) = &self.interpreter {
            elem.set_attr("interpreter", interpreter);
        }
        elem
    }
}

/// What a plugin extracted from one probe response
#[derive(Debug, Clone, Default)]
pub struct ProbeYield {
    pub groups: Vec<String>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct StoredResponse {
    groups: Vec<String>,
    data: Option<serde_json::Value>,
    raw: String,
}

/// Accumulated probe state for all clients
#[derive(Default)]
pub struct ProbeEngine {
    /// client -> probe name -> latest response
    cache: DashMap<String, BTreeMap<String, StoredResponse>>,
}

impl ProbeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// All probes the registry declares for this client, in plugin order
    pub fn probes_for(
        &self,
        registry: &PluginRegistry,
        metadata: &crate::metadata::ClientMetadata,
    ) -> Vec<Probe> {
        let mut probes = Vec::new();
        for producer in &registry.probes {
            probes.extend(producer.probes(metadata));
        }
        probes
    }

    /// Serialize probes into the `GetProbes` response document
    pub fn probes_document(probes: &[Probe]) -> Element {
        let mut doc = Element::new("probes");
        for probe in probes {
            doc.children.push(probe.to_element());
        }
        doc
    }

    /// Ingest a `<ProbeData>` response document for one client.
    ///
    /// Returns the names of the probes that were accepted. Individual
    /// failures are logged and skipped; the whole document is rejected only
    /// when its shape is wrong.
    pub fn ingest(
        &self,
        registry: &PluginRegistry,
        resolver: &MetadataResolver,
        store: &ClientStore,
        client: &str,
        doc: &Element,
    ) -> Result<Vec<String>> {
        if doc.name != "ProbeData" {
            return Err(Error::Xml(format!(
                "expected <ProbeData> document, found <{}>",
                doc.name
            )));
        }

        let mut accepted = Vec::new();
        for response in doc.children_named("probe-data") {
            let Some(name) = response.attr("name") else {
                warn!(client, "probe response without name; skipped");
                continue;
            };
            let Some(source) = response.attr("source") else {
                warn!(client, probe = name, "probe response without source; skipped");
                continue;
            };
            match self.dispatch(registry, client, source, response) {
                Ok(yield_) => {
                    if let Err(err) = store.save_probe(client, name, source, &response.text) {
                        warn!(client, probe = name, error = %err,
                              "failed to persist probe response");
                    }
                    self.cache.entry(client.to_string()).or_default().insert(
                        name.to_string(),
                        StoredResponse {
                            groups: yield_.groups,
                            data: yield_.data,
                            raw: response.text.clone(),
                        },
                    );
                    accepted.push(name.to_string());
                }
                Err(err) => {
                    warn!(client, probe = name, error = %err, "probe ingestion failed");
                }
            }
        }

        if !accepted.is_empty() {
            resolver.invalidate(client);
            debug!(client, probes = accepted.len(), "probe data ingested");
        }
        Ok(accepted)
    }

    fn dispatch(
        &self,
        registry: &PluginRegistry,
        client: &str,
        source: &str,
        response: &Element,
    ) -> Result<ProbeYield> {
        let producer = registry
            .probes
            .iter()
            .find(|p| p.name() == source)
            .ok_or_else(|| Error::plugin(source, "no such probe source"))?;
        producer.receive_data(client, response)
    }

    /// Reload persisted probe responses at startup (database mode)
    pub fn load_persisted(&self, registry: &PluginRegistry, store: &ClientStore) -> Result<()> {
        let rows = store.load_probes()?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut restored = 0;
        for (client, probe, source, output) in rows {
            let response = Element::new("probe-data")
                .with_attr("name", &probe)
                .with_attr("source", &source)
                .with_text(&output);
            match self.dispatch(registry, &client, &source, &response) {
                Ok(yield_) => {
                    self.cache.entry(client.clone()).or_default().insert(
                        probe,
                        StoredResponse {
                            groups: yield_.groups,
                            data: yield_.data,
                            raw: output,
                        },
                    );
                    restored += 1;
                }
                Err(err) => {
                    warn!(client = client.as_str(), probe = probe.as_str(), error = %err,
                          "persisted probe response no longer ingestible");
                }
            }
        }
        info!(responses = restored, "restored persisted probe data");
        Ok(())
    }
}

impl Plugin for ProbeEngine {
    fn name(&self) -> &str {
        "probes"
    }
}

impl Connector for ProbeEngine {
    fn additional_groups(&self, client: &str) -> Vec<String> {
        let Some(responses) = self.cache.get(client) else {
            return Vec::new();
        };
        let mut groups: Vec<String> = responses
            .values()
            .flat_map(|r| r.groups.iter().cloned())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    fn additional_data(&self, client: &str) -> Option<serde_json::Value> {
        let responses = self.cache.get(client)?;
        if responses.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = responses
            .iter()
            .map(|(name, r)| {
                let value = r
                    .data
                    .clone()
                    .unwrap_or_else(|| serde_json::Value::String(r.raw.clone()));
                (name.clone(), value)
            })
            .collect();
        Some(serde_json::Value::Object(map))
    }
}

/// Built-in probe source: one probe per file under `Probes/`
pub struct ProbesPlugin {
    probes: Vec<Probe>,
}

impl ProbesPlugin {
    /// Load probe scripts from the repository's `Probes/` directory
    pub fn load(dir: &Path) -> Result<Self> {
        let mut probes = Vec::new();
        if dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(dir)?
                .collect::<std::io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file()
                        && !p
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with('.'))
                            .unwrap_or(true)
                })
                .collect();
            entries.sort();

            for path in entries {
                let script = std::fs::read_to_string(&path).map_err(|e| Error::RepoLoad {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let interpreter = script
                    .lines()
                    .next()
                    .and_then(|line| line.strip_prefix("#!"))
                    .map(|i| i.trim().to_string());
                probes.push(Probe {
                    name,
                    source: "probes".to_string(),
                    interpreter,
                    script,
                });
            }
        }
        Ok(Self { probes })
    }

    #[cfg(test)]
    pub fn from_probes(probes: Vec<Probe>) -> Self {
        Self { probes }
    }
}

impl Plugin for ProbesPlugin {
    fn name(&self) -> &str {
        "probes"
    }
}

impl ProbeProducer for ProbesPlugin {
    fn probes(&self, _metadata: &crate::metadata::ClientMetadata) -> Vec<Probe> {
        self.probes.clone()
    }

    fn receive_data(&self, _client: &str, response: &Element) -> Result<ProbeYield> {
        let mut yield_ = ProbeYield::default();
        let mut data_lines = Vec::new();
        for line in response.text.lines() {
            if let Some(group) = line.trim().strip_prefix("group:") {
                let group = group.trim();
                if !group.is_empty() {
                    yield_.groups.push(group.to_string());
                }
            } else {
                data_lines.push(line);
            }
        }
        let data = data_lines.join("\n");
        let trimmed = data.trim();
        if !trimmed.is_empty() {
            yield_.data = Some(serde_json::Value::String(trimmed.to_string()));
        }
        Ok(yield_)
    }
}
