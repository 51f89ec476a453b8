// src/lib.rs

//! Tailor Configuration-Management Server
//!
//! Tailor computes per-host literal configurations from a declarative XML
//! repository. A client identity resolves to a fully expanded group
//! membership (the metadata), the membership selects bundles of abstract
//! entries (the structures), and prioritized generator plugins fill in the
//! concrete attributes (the binding). Clients fetch their configuration
//! over a small XML-RPC surface, run server-issued probes that feed back
//! into their metadata, and upload statistics about what they applied.
//!
//! # Architecture
//!
//! - Snapshot-first: the parsed repository is immutable and swapped
//!   atomically on reload; a failed reload degrades to the previous
//!   snapshot
//! - Deterministic synthesis: for a fixed snapshot and fixed probe data,
//!   binding output is byte-identical across runs
//! - Contained failure: a single unbindable entry becomes an in-place
//!   error entry, never a failed session

pub mod bind;
pub mod core;
pub mod decision;
mod error;
pub mod metadata;
pub mod options;
pub mod plugin;
pub mod probes;
pub mod repo;
pub mod rules;
pub mod server;
pub mod stats;
pub mod structures;
pub mod xml;

pub use crate::core::{Core, Deadline};
pub use bind::Binder;
pub use error::{Error, Result};
pub use metadata::{ClientMetadata, ClientStore, GroupGraph, MetadataResolver};
pub use options::{DecisionMode, Options};
pub use plugin::PluginRegistry;
pub use probes::{Probe, ProbeEngine};
pub use repo::{Repository, Snapshot};
pub use xml::Element;
