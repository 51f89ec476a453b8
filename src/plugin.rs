// src/plugin.rs
//! Plugin capability traits and the typed registry
//!
//! Plugins are values implementing one or more capabilities from a closed
//! set; the registry holds a typed slot per capability. Registration order
//! is load order and is semantically meaningful: generator ties at equal
//! priority break toward the later registration, and validators run in
//! registration order.

use crate::error::Result;
use crate::metadata::ClientMetadata;
use crate::options::DecisionMode;
use crate::probes::{Probe, ProbeYield};
use crate::xml::Element;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Base capability: every plugin has a stable name
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
}

/// One rule a generator offers for an abstract entry.
///
/// `handle` is opaque to the binder and passed back to
/// [`Generator::bind_entry`] on selection.
#[derive(Debug, Clone)]
pub struct EntryCandidate {
    pub handle: usize,
    pub priority: i32,
    /// Literal name match (as opposed to a regex match)
    pub exact: bool,
    /// Positive group conditions scoping this candidate
    pub groups: BTreeSet<String>,
    /// Within-plugin registration order
    pub registration: usize,
    /// Diagnostic origin, e.g. the rules document stem
    pub origin: String,
}

/// Maps abstract entries to literal entries
pub trait Generator: Plugin {
    /// All rules matching `(kind, name)` for this client
    fn candidates(&self, kind: &str, name: &str, metadata: &ClientMetadata) -> Vec<EntryCandidate>;

    /// Produce the literal entry for a previously returned candidate
    fn bind_entry(
        &self,
        handle: usize,
        entry: &Element,
        metadata: &ClientMetadata,
    ) -> Result<Element>;
}

/// Produces abstract structures (bundles) from metadata
pub trait StructureSource: Plugin {
    /// Build the named bundle, or `None` if this source does not own it
    fn build_bundle(&self, bundle: &str, metadata: &ClientMetadata) -> Option<Result<Element>>;
}

/// Renders a templated bundle document against frozen metadata
pub trait BundleTemplate: Send + Sync {
    fn render(&self, source: &Element, metadata: &ClientMetadata) -> Result<Element>;
}

/// Declares probes and ingests their responses
pub trait ProbeProducer: Plugin {
    fn probes(&self, metadata: &ClientMetadata) -> Vec<Probe>;

    /// Ingest one `<probe-data>` response addressed to this plugin
    fn receive_data(&self, client: &str, response: &Element) -> Result<ProbeYield>;
}

/// Supplies additional groups and opaque per-client data to metadata
pub trait Connector: Plugin {
    fn additional_groups(&self, client: &str) -> Vec<String>;

    fn additional_data(&self, client: &str) -> Option<serde_json::Value> {
        let _ = client;
        None
    }
}

/// Inspects or amends assembled abstract structures before binding
pub trait StructureValidator: Plugin {
    fn validate_structures(
        &self,
        metadata: &ClientMetadata,
        structures: &mut Vec<Element>,
    ) -> Result<()>;
}

/// Inspects or amends fully bound bundles after binding
pub trait GoalValidator: Plugin {
    fn validate_goals(&self, metadata: &ClientMetadata, bundles: &mut Vec<Element>) -> Result<()>;
}

/// Supplies whitelist/blacklist decision entries
pub trait DecisionProvider: Plugin {
    fn decisions(&self, mode: DecisionMode, metadata: &ClientMetadata) -> Vec<(String, String)>;
}

/// Receives client statistics documents
pub trait StatisticsSink: Send + Sync {
    fn process_statistics(
        &self,
        client: &str,
        version: Option<&str>,
        document: &Element,
    ) -> Result<()>;
}

/// Session lifecycle notifications
pub trait ClientRunHooks: Send + Sync {
    fn start_client_run(&self, metadata: &ClientMetadata) {
        let _ = metadata;
    }
    fn end_client_run(&self, metadata: &ClientMetadata) {
        let _ = metadata;
    }
    fn end_statistics(&self, metadata: &ClientMetadata) {
        let _ = metadata;
    }
}

/// Typed capability slots, populated at snapshot build time
#[derive(Default, Clone)]
pub struct PluginRegistry {
    pub generators: Vec<Arc<dyn Generator>>,
    pub structures: Vec<Arc<dyn StructureSource>>,
    pub probes: Vec<Arc<dyn ProbeProducer>>,
    pub connectors: Vec<Arc<dyn Connector>>,
    pub structure_validators: Vec<Arc<dyn StructureValidator>>,
    pub goal_validators: Vec<Arc<dyn GoalValidator>>,
    pub decisions: Vec<Arc<dyn DecisionProvider>>,
    pub run_hooks: Vec<Arc<dyn ClientRunHooks>>,
}

impl PluginRegistry {
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .generators
            .iter()
            .map(|p| p.name().to_string())
            .chain(self.structures.iter().map(|p| p.name().to_string()))
            .chain(self.probes.iter().map(|p| p.name().to_string()))
            .chain(self.connectors.iter().map(|p| p.name().to_string()))
            .chain(self.decisions.iter().map(|p| p.name().to_string()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
