// src/stats.rs

//! Statistics intake: bounded queue, background drain, pluggable sinks
//!
//! `RecvStats` must not stall the session response path, so submission
//! only enqueues: a bounded in-memory queue with a drop-oldest overflow
//! policy and a counter for what was shed. A background worker drains the
//! queue into the configured sinks (reports database or the log).

use crate::error::Result;
use crate::metadata::ClientMetadata;
use crate::plugin::{ClientRunHooks, StatisticsSink};
use crate::xml::Element;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Per-entry outcome counts extracted from a statistics document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub state: Option<String>,
    pub good: u64,
    pub bad: u64,
    pub modified: u64,
    pub extra: u64,
}

/// Count entry outcomes: container elements (`<Bad>`, `<Modified>`, ...)
/// carry their children, loose entries carry a `state` attribute.
pub fn summarize(doc: &Element) -> StatsSummary {
    fn walk(elem: &Element, summary: &mut StatsSummary) {
        for child in &elem.children {
            match child.name.as_str() {
                "Good" => summary.good += child.children.len() as u64,
                "Bad" => summary.bad += child.children.len() as u64,
                "Modified" => summary.modified += child.children.len() as u64,
                "Extra" => summary.extra += child.children.len() as u64,
                _ => {
                    match child.attr("state") {
                        Some("good") => summary.good += 1,
                        Some("bad") => summary.bad += 1,
                        Some("modified") => summary.modified += 1,
                        Some("extra") => summary.extra += 1,
                        _ => {}
                    }
                    walk(child, summary);
                }
            }
        }
    }

    let mut summary = StatsSummary {
        state: doc.attr("state").map(str::to_string),
        ..Default::default()
    };
    walk(doc, &mut summary);
    summary
}

struct StatsRecord {
    client: String,
    version: Option<String>,
    document: Element,
}

/// Bounded statistics intake with drop-oldest overflow
pub struct StatsIntake {
    queue: Mutex<VecDeque<StatsRecord>>,
    notify: Notify,
    depth: usize,
    /// Time submission may spend on the response path
    budget: std::time::Duration,
    dropped: AtomicU64,
    sinks: Vec<Arc<dyn StatisticsSink>>,
}

impl StatsIntake {
    pub fn new(
        depth: usize,
        budget: std::time::Duration,
        sinks: Vec<Arc<dyn StatisticsSink>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            depth: depth.max(1),
            budget,
            dropped: AtomicU64::new(0),
            sinks,
        })
    }

    /// Enqueue one statistics document; never blocks on sink I/O
    pub fn submit(&self, client: &str, version: Option<&str>, document: Element) {
        let started = std::time::Instant::now();
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.depth {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "statistics queue full; oldest record dropped");
        }
        queue.push_back(StatsRecord {
            client: client.to_string(),
            version: version.map(str::to_string),
            document,
        });
        drop(queue);
        self.notify.notify_one();

        let elapsed = started.elapsed();
        if elapsed > self.budget {
            warn!(
                client,
                elapsed_ms = elapsed.as_millis() as u64,
                "statistics submission exceeded its budget"
            );
        }
    }

    /// Records shed by the overflow policy since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Drain everything queued into the sinks; returns records processed
    pub fn drain(&self) -> usize {
        let mut processed = 0;
        loop {
            let record = self.queue.lock().unwrap().pop_front();
            let Some(record) = record else { break };
            for sink in &self.sinks {
                if let Err(err) = sink.process_statistics(
                    &record.client,
                    record.version.as_deref(),
                    &record.document,
                ) {
                    warn!(client = record.client.as_str(), error = %err,
                          "statistics sink failed");
                }
            }
            processed += 1;
        }
        processed
    }

    /// Run the drain loop until the intake is dropped by all submitters
    pub fn spawn_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let intake = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                intake.notify.notified().await;
                let processed = intake.drain();
                if processed > 0 {
                    debug!(processed, "statistics drained");
                }
            }
        })
    }
}

impl ClientRunHooks for StatsIntake {
    fn start_client_run(&self, metadata: &ClientMetadata) {
        debug!(client = metadata.hostname.as_str(), "client run started");
    }

    fn end_client_run(&self, metadata: &ClientMetadata) {
        debug!(client = metadata.hostname.as_str(), "client run finished");
    }

    fn end_statistics(&self, metadata: &ClientMetadata) {
        debug!(client = metadata.hostname.as_str(), "statistics complete");
    }
}

/// Reports-database sink: one row per client interaction
pub struct SqliteStatsSink {
    conn: Mutex<Connection>,
}

impl SqliteStatsSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS interactions (
                 id        INTEGER PRIMARY KEY AUTOINCREMENT,
                 client    TEXT NOT NULL,
                 version   TEXT,
                 timestamp TEXT NOT NULL,
                 state     TEXT,
                 good      INTEGER NOT NULL DEFAULT 0,
                 bad       INTEGER NOT NULL DEFAULT 0,
                 modified  INTEGER NOT NULL DEFAULT 0,
                 extra     INTEGER NOT NULL DEFAULT 0,
                 raw       TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_interactions_client
                 ON interactions (client, timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of interactions recorded for a client
    pub fn interaction_count(&self, client: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM interactions WHERE client = ?1",
            [client],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl StatisticsSink for SqliteStatsSink {
    fn process_statistics(
        &self,
        client: &str,
        version: Option<&str>,
        document: &Element,
    ) -> Result<()> {
        let summary = summarize(document);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO interactions (client, version, timestamp, state, good, bad, modified, extra, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                client,
                version,
                Utc::now().to_rfc3339(),
                summary.state,
                summary.good as i64,
                summary.bad as i64,
                summary.modified as i64,
                summary.extra as i64,
                document.to_xml(),
            ],
        )?;
        Ok(())
    }
}

/// Flat-log sink
pub struct LogStatsSink;

impl StatisticsSink for LogStatsSink {
    fn process_statistics(
        &self,
        client: &str,
        version: Option<&str>,
        document: &Element,
    ) -> Result<()> {
        let summary = summarize(document);
        info!(
            client,
            version = version.unwrap_or("unknown"),
            state = summary.state.as_deref().unwrap_or(""),
            good = summary.good,
            bad = summary.bad,
            modified = summary.modified,
            extra = summary.extra,
            "client statistics"
        );
        Ok(())
    }
}
