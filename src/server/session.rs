// src/server/session.rs
//! Per-client session state machine
//!
//! Sessions are stateless on the wire; the server keys state by client
//! identity and enforces the protocol ordering, most importantly that a
//! client which was handed probes answers them before asking for its
//! configuration. Stale sessions restart transparently.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// Where a client currently stands in its run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Authenticated,
    /// Probes were issued; the set holds the ones still unanswered
    ProbesSent(BTreeSet<String>),
    Probed,
    Served,
}

struct SessionEntry {
    phase: SessionPhase,
    touched: Instant,
}

/// In-memory session tracking with transparent restart of stale sessions
pub struct SessionTracker {
    sessions: DashMap<String, SessionEntry>,
    ttl: Duration,
}

impl SessionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Record a successful authentication, restarting stale sessions
    pub fn touch(&self, client: &str) {
        let mut entry = self
            .sessions
            .entry(client.to_string())
            .or_insert_with(|| SessionEntry {
                phase: SessionPhase::Authenticated,
                touched: Instant::now(),
            });
        if entry.touched.elapsed() > self.ttl {
            debug!(client, "stale session restarted");
            entry.phase = SessionPhase::Authenticated;
        }
        entry.touched = Instant::now();
    }

    pub fn phase(&self, client: &str) -> SessionPhase {
        self.sessions
            .get(client)
            .map(|e| e.phase.clone())
            .unwrap_or(SessionPhase::Authenticated)
    }

    /// Probes were handed to the client
    pub fn probes_sent(&self, client: &str, probes: BTreeSet<String>) {
        self.set_phase(client, SessionPhase::ProbesSent(probes));
    }

    /// Probe responses arrived; once all outstanding probes are answered
    /// the session advances to `Probed`
    pub fn probe_data_received(&self, client: &str, answered: &[String]) {
        let mut entry = self
            .sessions
            .entry(client.to_string())
            .or_insert_with(|| SessionEntry {
                phase: SessionPhase::Authenticated,
                touched: Instant::now(),
            });
        entry.touched = Instant::now();
        if let SessionPhase::ProbesSent(outstanding) = &mut entry.phase {
            for name in answered {
                outstanding.remove(name);
            }
            if outstanding.is_empty() {
                entry.phase = SessionPhase::Probed;
            }
        } else {
            // Responses without a preceding GetProbes still advance the
            // session; the data itself was already ingested
            entry.phase = SessionPhase::Probed;
        }
    }

    /// Enforce the probe ordering contract for `GetConfig`
    pub fn config_allowed(&self, client: &str) -> Result<()> {
        match self.phase(client) {
            SessionPhase::ProbesSent(outstanding) if !outstanding.is_empty() => {
                Err(Error::ProbeOrder {
                    client: client.to_string(),
                    outstanding: outstanding.into_iter().collect(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn served(&self, client: &str) {
        self.set_phase(client, SessionPhase::Served);
    }

    fn set_phase(&self, client: &str, phase: SessionPhase) {
        self.sessions.insert(
            client.to_string(),
            SessionEntry {
                phase,
                touched: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_config_without_probes_allowed() {
        let tracker = SessionTracker::new(Duration::from_secs(300));
        tracker.touch("c1");
        assert!(tracker.config_allowed("c1").is_ok());
    }

    #[test]
    fn test_probe_ordering_enforced() {
        let tracker = SessionTracker::new(Duration::from_secs(300));
        tracker.touch("c1");
        tracker.probes_sent("c1", probe_set(&["arch", "os"]));

        let err = tracker.config_allowed("c1").unwrap_err();
        assert!(matches!(err, Error::ProbeOrder { .. }));
        assert_eq!(err.fault_code(), 2);

        // Partial answers keep the gate closed
        tracker.probe_data_received("c1", &["arch".to_string()]);
        assert!(tracker.config_allowed("c1").is_err());

        tracker.probe_data_received("c1", &["os".to_string()]);
        assert!(tracker.config_allowed("c1").is_ok());
        assert_eq!(tracker.phase("c1"), SessionPhase::Probed);

        tracker.served("c1");
        assert_eq!(tracker.phase("c1"), SessionPhase::Served);
    }

    #[test]
    fn test_stale_session_restarts() {
        let tracker = SessionTracker::new(Duration::from_millis(0));
        tracker.touch("c1");
        tracker.probes_sent("c1", probe_set(&["arch"]));

        // TTL of zero: the next touch restarts the session
        tracker.touch("c1");
        assert_eq!(tracker.phase("c1"), SessionPhase::Authenticated);
        assert!(tracker.config_allowed("c1").is_ok());
    }

    #[test]
    fn test_unsolicited_probe_data_advances() {
        let tracker = SessionTracker::new(Duration::from_secs(300));
        tracker.touch("c1");
        tracker.probe_data_received("c1", &["arch".to_string()]);
        assert_eq!(tracker.phase("c1"), SessionPhase::Probed);
    }
}
