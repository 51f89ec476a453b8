// src/options.rs
//! Server options file parsing
//!
//! Supports TOML configuration with the following sections:
//! - [server] - Bind address, global password, decision mode, worker pool
//! - [metadata] - Client store backend, dynamic registration, DNS budget
//! - [rules] - Rule-name matching behavior
//! - [stats] - Statistics intake sizing and sink selection
//!
//! The parsed value is immutable and threaded into each component at
//! construction; nothing reads configuration from process-global state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level options file structure
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    /// Repository root directory
    #[serde(default = "default_repository")]
    pub repository: PathBuf,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub metadata: MetadataSection,

    #[serde(default)]
    pub rules: RulesSection,

    #[serde(default)]
    pub stats: StatsSection,
}

fn default_repository() -> PathBuf {
    PathBuf::from("/var/lib/tailor/repo")
}

impl Default for Options {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            server: ServerSection::default(),
            metadata: MetadataSection::default(),
            rules: RulesSection::default(),
            stats: StatsSection::default(),
        }
    }
}

/// Decision list mode applied to the literal tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    #[default]
    Off,
    Whitelist,
    Blacklist,
}

impl DecisionMode {
    /// Parse the wire form used by `GetDecisionList`
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "whitelist" => Some(DecisionMode::Whitelist),
            "blacklist" => Some(DecisionMode::Blacklist),
            "off" | "none" => Some(DecisionMode::Off),
            _ => None,
        }
    }
}

/// Server section
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Bind address for the RPC listener
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Global password accepted for non-secure clients (empty = disabled)
    #[serde(default)]
    pub password: String,

    /// Wire protocol name, recorded for clients (only xmlrpc/1 today)
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// TLS material paths, consumed by the fronting terminator
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub ca: Option<PathBuf>,

    /// Decision list mode
    #[serde(default)]
    pub decision: DecisionMode,

    /// Filesystem monitor backend (`none` or `poll`)
    #[serde(default = "default_filemonitor")]
    pub filemonitor: String,

    /// Size of the bounded synthesis worker pool (0 = number of CPUs)
    #[serde(default)]
    pub workers: usize,

    /// Per-request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            password: String::new(),
            protocol: default_protocol(),
            key: None,
            cert: None,
            ca: None,
            decision: DecisionMode::Off,
            filemonitor: default_filemonitor(),
            workers: 0,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:6789".to_string()
}

fn default_protocol() -> String {
    "xmlrpc/1".to_string()
}

fn default_filemonitor() -> String {
    "poll".to_string()
}

fn default_request_timeout() -> u64 {
    90
}

/// Metadata section
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSection {
    /// Store clients in a database instead of clients.xml alone
    #[serde(default)]
    pub use_database: bool,

    /// Path of the clients/statistics database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Create unknown clients on first authenticated contact
    #[serde(default = "default_true")]
    pub dynamic_registration: bool,

    /// Reverse-DNS budget for identity resolution
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            use_database: false,
            database_path: default_database_path(),
            dynamic_registration: true,
            dns_timeout_ms: default_dns_timeout_ms(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/tailor/tailor.db")
}

fn default_true() -> bool {
    true
}

fn default_dns_timeout_ms() -> u64 {
    750
}

/// Rules section
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RulesSection {
    /// Treat rule entry names as anchored regular expressions
    #[serde(default)]
    pub regex: bool,
}

/// Statistics section
#[derive(Debug, Clone, Deserialize)]
pub struct StatsSection {
    /// Bounded intake queue depth; overflow drops the oldest record
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Sink backend: `database` or `log`
    #[serde(default = "default_sink")]
    pub sink: String,

    /// Budget the intake may spend on the response path
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            sink: default_sink(),
            budget_ms: default_budget_ms(),
        }
    }
}

fn default_queue_depth() -> usize {
    256
}

fn default_sink() -> String {
    "database".to_string()
}

fn default_budget_ms() -> u64 {
    50
}

impl Options {
    /// Load options from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read options file {}", path.display()))?;
        let options: Options = toml::from_str(&data)
            .with_context(|| format!("failed to parse options file {}", path.display()))?;
        Ok(options)
    }

    /// Load from a file if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Effective synthesis pool size
    pub fn worker_count(&self) -> usize {
        if self.server.workers > 0 {
            self.server.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    /// Per-request deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Reverse-DNS budget
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata.dns_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.server.listen, "0.0.0.0:6789");
        assert_eq!(options.server.decision, DecisionMode::Off);
        assert!(!options.metadata.use_database);
        assert!(options.metadata.dynamic_registration);
        assert!(!options.rules.regex);
        assert_eq!(options.stats.queue_depth, 256);
    }

    #[test]
    fn test_parse_sections() {
        let options: Options = toml::from_str(
            r#"
            repository = "/srv/tailor"

            [server]
            listen = "127.0.0.1:9000"
            password = "s3cret"
            decision = "blacklist"
            workers = 8

            [metadata]
            use_database = true
            dynamic_registration = false

            [rules]
            regex = true

            [stats]
            queue_depth = 16
            sink = "log"
            "#,
        )
        .unwrap();

        assert_eq!(options.repository, PathBuf::from("/srv/tailor"));
        assert_eq!(options.server.password, "s3cret");
        assert_eq!(options.server.decision, DecisionMode::Blacklist);
        assert_eq!(options.worker_count(), 8);
        assert!(options.metadata.use_database);
        assert!(!options.metadata.dynamic_registration);
        assert!(options.rules.regex);
        assert_eq!(options.stats.queue_depth, 16);
        assert_eq!(options.stats.sink, "log");
    }

    #[test]
    fn test_decision_mode_wire() {
        assert_eq!(
            DecisionMode::from_wire("whitelist"),
            Some(DecisionMode::Whitelist)
        );
        assert_eq!(
            DecisionMode::from_wire("blacklist"),
            Some(DecisionMode::Blacklist)
        );
        assert_eq!(DecisionMode::from_wire("bogus"), None);
    }
}
