// src/error.rs
//! Central error taxonomy for the configuration synthesis pipeline
//!
//! Errors cross plugin boundaries only as structured data; nothing here
//! carries stack traces onto the wire. Session-fatal kinds map to XML-RPC
//! fault codes via [`Error::fault_code`].

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the synthesis pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Repository document failed to load; the previous snapshot stays live
    #[error("failed to load repository document {path}: {reason}")]
    RepoLoad { path: PathBuf, reason: String },

    /// Client identity cannot be resolved or the metadata graph is inconsistent
    #[error("metadata consistency error: {0}")]
    MetadataConsistency(String),

    /// Credentials rejected for a resolved client
    #[error("authentication failed for {client}: {reason}")]
    MetadataAuth { client: String, reason: String },

    /// Transient metadata failure (e.g. DNS timeout); the client may retry
    #[error("transient metadata error: {0}")]
    MetadataRuntime(String),

    /// Configuration requested while issued probes are still outstanding
    #[error("client {client} has unanswered probes: {outstanding:?}")]
    ProbeOrder {
        client: String,
        outstanding: Vec<String>,
    },

    /// A declared bundle could not be assembled
    #[error("structure error in bundle {bundle}: {reason}")]
    Structure { bundle: String, reason: String },

    /// A single abstract entry failed to bind
    #[error("failed to bind {kind} {name}: {reason}")]
    Bind {
        kind: String,
        name: String,
        reason: String,
    },

    /// Failure contained within a plugin boundary
    #[error("plugin {plugin} failed: {reason}")]
    PluginExecution { plugin: String, reason: String },

    /// Malformed XML in a repository document or RPC body
    #[error("XML error: {0}")]
    Xml(String),

    /// Malformed or unknown XML-RPC request
    #[error("unknown RPC method: {0}")]
    UnknownMethod(String),

    /// Server configuration problem, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client/statistics store error
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Invalid rule-name pattern
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// XML-RPC fault code for this error (spec'd wire contract:
    /// 1 = auth, 2 = consistency, 3 = runtime, 7 = unknown method)
    pub fn fault_code(&self) -> i32 {
        match self {
            Error::MetadataAuth { .. } => 1,
            Error::MetadataConsistency(_) | Error::ProbeOrder { .. } => 2,
            Error::UnknownMethod(_) => 7,
            _ => 3,
        }
    }

    /// Convenience constructor for plugin-contained failures
    pub fn plugin(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PluginExecution {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_codes() {
        let auth = Error::MetadataAuth {
            client: "c1".to_string(),
            reason: "bad password".to_string(),
        };
        assert_eq!(auth.fault_code(), 1);

        let consistency = Error::MetadataConsistency("no identity".to_string());
        assert_eq!(consistency.fault_code(), 2);

        let order = Error::ProbeOrder {
            client: "c1".to_string(),
            outstanding: vec!["arch".to_string()],
        };
        assert_eq!(order.fault_code(), 2);

        let runtime = Error::MetadataRuntime("dns timeout".to_string());
        assert_eq!(runtime.fault_code(), 3);

        assert_eq!(Error::UnknownMethod("Bogus".to_string()).fault_code(), 7);
    }
}
