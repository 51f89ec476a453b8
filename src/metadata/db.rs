// src/metadata/db.rs

//! Runtime client store
//!
//! Holds the mutable per-client state the repository documents cannot:
//! dynamically registered clients, asserted profiles, declared versions,
//! and (in database mode) probe responses that survive a restart. The
//! in-memory map is authoritative while the server runs; the database is
//! the durable mirror when `metadata.use_database` is on.

use super::{ClientRecord, ClientsDoc};
use crate::error::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Thread-safe client state store, optionally database-backed
pub struct ClientStore {
    inner: Mutex<HashMap<String, ClientRecord>>,
    conn: Option<Mutex<Connection>>,
}

impl ClientStore {
    /// Purely in-memory store (file-based client declarations)
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            conn: None,
        }
    }

    /// Database-backed store; creates the schema and loads persisted clients
    pub fn with_database(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS clients (
                 name      TEXT PRIMARY KEY,
                 profile   TEXT,
                 uuid      TEXT,
                 password  TEXT,
                 secure    INTEGER NOT NULL DEFAULT 0,
                 floating  INTEGER NOT NULL DEFAULT 0,
                 version   TEXT,
                 created_at TEXT DEFAULT CURRENT_TIMESTAMP
             );
             CREATE TABLE IF NOT EXISTS probe_data (
                 client      TEXT NOT NULL,
                 probe       TEXT NOT NULL,
                 source      TEXT NOT NULL,
                 output      TEXT NOT NULL,
                 received_at TEXT DEFAULT CURRENT_TIMESTAMP,
                 PRIMARY KEY (client, probe)
             );",
        )?;

        let store = Self {
            inner: Mutex::new(HashMap::new()),
            conn: Some(Mutex::new(conn)),
        };
        let loaded = store.load_persisted()?;
        info!(clients = loaded, "loaded client store from database");
        Ok(store)
    }

    fn load_persisted(&self) -> Result<usize> {
        let conn = self.conn.as_ref().expect("database store").lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, profile, uuid, password, secure, floating, version FROM clients",
        )?;
        let rows = stmt.query_map([], |row| {
            let mut record = ClientRecord::new(row.get::<_, String>(0)?);
            record.profile = row.get(1)?;
            record.uuid = row
                .get::<_, Option<String>>(2)?
                .and_then(|u| u.parse().ok());
            record.password = row.get(3)?;
            record.secure = row.get::<_, i64>(4)? != 0;
            record.floating = row.get::<_, i64>(5)? != 0;
            record.version = row.get(6)?;
            Ok(record)
        })?;

        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for record in rows {
            let record = record?;
            inner.insert(record.name.clone(), record);
            count += 1;
        }
        Ok(count)
    }

    /// Whether clients are persisted to a database
    pub fn database_backed(&self) -> bool {
        self.conn.is_some()
    }

    /// Merge declared client records from a freshly loaded snapshot.
    ///
    /// Declared fields win over runtime state; runtime-only fields
    /// (asserted profile on a dynamic client, version) are retained.
    /// `implied` carries clients whose existence the groups document
    /// implies in file-based mode.
    pub fn sync_from(&self, doc: &ClientsDoc, implied: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        for declared in doc.iter() {
            let entry = inner
                .entry(declared.name.clone())
                .or_insert_with(|| ClientRecord::new(declared.name.clone()));
            let version = entry.version.take();
            let asserted = if declared.profile.is_none() {
                entry.profile.take()
            } else {
                None
            };
            *entry = declared.clone();
            entry.version = version;
            if entry.profile.is_none() {
                entry.profile = asserted;
            }
        }
        for name in implied {
            inner
                .entry(name.clone())
                .or_insert_with(|| ClientRecord::new(name.clone()));
        }
        debug!(clients = inner.len(), "client store synced from snapshot");
    }

    pub fn get(&self, name: &str) -> Option<ClientRecord> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<ClientRecord> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .find(|r| r.uuid.as_ref() == Some(uuid))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a new client (dynamic registration path)
    pub fn register(&self, record: ClientRecord) -> Result<()> {
        if let Some(conn) = &self.conn {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO clients (name, profile, uuid, password, secure, floating, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.name,
                    record.profile,
                    record.uuid.map(|u| u.to_string()),
                    record.password,
                    record.secure as i64,
                    record.floating as i64,
                    record.version,
                ],
            )?;
        }
        self.inner
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
        Ok(())
    }

    /// Record an asserted profile
    pub fn set_profile(&self, name: &str, profile: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            let record = inner
                .entry(name.to_string())
                .or_insert_with(|| ClientRecord::new(name));
            record.profile = Some(profile.to_string());
        }
        if let Some(conn) = &self.conn {
            conn.lock().unwrap().execute(
                "UPDATE clients SET profile = ?2 WHERE name = ?1",
                params![name, profile],
            )?;
        }
        Ok(())
    }

    /// Record a declared client version
    pub fn set_version(&self, name: &str, version: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(record) = inner.get_mut(name) {
                record.version = Some(version.to_string());
            }
        }
        if let Some(conn) = &self.conn {
            conn.lock().unwrap().execute(
                "UPDATE clients SET version = ?2 WHERE name = ?1",
                params![name, version],
            )?;
        }
        Ok(())
    }

    /// Persist one probe response (database mode only)
    pub fn save_probe(&self, client: &str, probe: &str, source: &str, output: &str) -> Result<()> {
        if let Some(conn) = &self.conn {
            conn.lock().unwrap().execute(
                "INSERT OR REPLACE INTO probe_data (client, probe, source, output)
                 VALUES (?1, ?2, ?3, ?4)",
                params![client, probe, source, output],
            )?;
        }
        Ok(())
    }

    /// Load all persisted probe responses as (client, probe, source, output)
    pub fn load_probes(&self) -> Result<Vec<(String, String, String, String)>> {
        let Some(conn) = &self.conn else {
            return Ok(Vec::new());
        };
        let conn = conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT client, probe, source, output FROM probe_data ORDER BY client")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Version string recorded for a client, if any
    pub fn version_of(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .get(name)
            .and_then(|r| r.version.clone())
    }

    #[cfg(test)]
    fn raw_profile(&self, name: &str) -> Option<String> {
        use rusqlite::OptionalExtension;

        let Some(conn) = &self.conn else { return None };
        let conn = conn.lock().unwrap();
        conn.query_row(
            "SELECT profile FROM clients WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()
        .unwrap()
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::Element;

    fn clients_doc(xml: &str) -> ClientsDoc {
        ClientsDoc::from_document(&Element::parse(xml).unwrap()).unwrap()
    }

    #[test]
    fn test_sync_preserves_runtime_state() {
        let store = ClientStore::in_memory();
        let doc = clients_doc(r#"<Clients><Client name="c1"/></Clients>"#);
        store.sync_from(&doc, &[]);

        store.set_version("c1", "2.1").unwrap();
        store.set_profile("c1", "web").unwrap();

        // Re-sync with the same declaration: version and asserted profile stay
        store.sync_from(&doc, &[]);
        let record = store.get("c1").unwrap();
        assert_eq!(record.version.as_deref(), Some("2.1"));
        assert_eq!(record.profile.as_deref(), Some("web"));

        // A declared profile overrides the asserted one
        let doc2 = clients_doc(r#"<Clients><Client name="c1" profile="db"/></Clients>"#);
        store.sync_from(&doc2, &[]);
        assert_eq!(store.get("c1").unwrap().profile.as_deref(), Some("db"));
    }

    #[test]
    fn test_implied_clients() {
        let store = ClientStore::in_memory();
        let doc = clients_doc("<Clients/>");
        store.sync_from(&doc, &["ghost.example.com".to_string()]);
        assert!(store.contains("ghost.example.com"));
    }

    #[test]
    fn test_database_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tailor.db");

        {
            let store = ClientStore::with_database(&db_path).unwrap();
            let mut record = ClientRecord::new("dyn1");
            record.profile = Some("basic".to_string());
            store.register(record).unwrap();
            store.set_profile("dyn1", "web").unwrap();
            store.save_probe("dyn1", "arch", "probes", "x86_64").unwrap();
            assert_eq!(store.raw_profile("dyn1").as_deref(), Some("web"));
        }

        // Reopen: clients and probe data survive
        let store = ClientStore::with_database(&db_path).unwrap();
        assert_eq!(store.get("dyn1").unwrap().profile.as_deref(), Some("web"));
        let probes = store.load_probes().unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].3, "x86_64");
    }

    #[test]
    fn test_find_by_uuid() {
        let store = ClientStore::in_memory();
        let mut record = ClientRecord::new("u1");
        let uuid = Uuid::new_v4();
        record.uuid = Some(uuid);
        store.register(record).unwrap();
        assert_eq!(store.find_by_uuid(&uuid).unwrap().name, "u1");
    }
}
