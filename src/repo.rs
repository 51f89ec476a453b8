// src/repo.rs

//! Repository loading, snapshotting, and change monitoring
//!
//! The parsed repository lives in an immutable [`Snapshot`] behind an
//! atomically swapped pointer. Readers clone the `Arc` and finish their
//! request on whatever snapshot they started with; a reload builds the
//! next snapshot off-line and publishes it only on success. A failed
//! reload degrades: the previous good snapshot keeps serving and the
//! failure is logged.

use crate::error::{Error, Result};
use crate::metadata::{ClientStore, ClientsDoc, GroupGraph};
use crate::options::Options;
use crate::plugin::PluginRegistry;
use crate::probes::{ProbeEngine, ProbesPlugin};
use crate::rules::RulesPlugin;
use crate::stats::StatsIntake;
use crate::structures::{BundlerPlugin, ServiceModeCompat};
use crate::xml::load_with_includes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// One immutable view of the parsed repository
pub struct Snapshot {
    pub generation: u64,
    pub graph: GroupGraph,
    pub clients: ClientsDoc,
    pub registry: PluginRegistry,
}

/// Well-known repository subdirectories
pub struct RepoLayout<'a> {
    root: &'a Path,
}

impl<'a> RepoLayout<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    pub fn groups_file(&self) -> PathBuf {
        self.root.join("Metadata").join("groups.xml")
    }

    pub fn clients_file(&self) -> PathBuf {
        self.root.join("Metadata").join("clients.xml")
    }

    pub fn bundler_dir(&self) -> PathBuf {
        self.root.join("Bundler")
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.root.join("Rules")
    }

    pub fn probes_dir(&self) -> PathBuf {
        self.root.join("Probes")
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.root.join("Decisions")
    }
}

/// Owner of the current snapshot and the reload path
pub struct Repository {
    options: Arc<Options>,
    store: Arc<ClientStore>,
    engine: Arc<ProbeEngine>,
    intake: Arc<StatsIntake>,
    current: RwLock<Arc<Snapshot>>,
    generation: AtomicU64,
}

impl Repository {
    /// Load the repository for the first time; failure here is fatal
    pub fn load(
        options: Arc<Options>,
        store: Arc<ClientStore>,
        engine: Arc<ProbeEngine>,
        intake: Arc<StatsIntake>,
    ) -> Result<Self> {
        let repo = Self {
            options,
            store,
            engine,
            intake,
            current: RwLock::new(Arc::new(Snapshot {
                generation: 0,
                graph: GroupGraph::default(),
                clients: ClientsDoc::default(),
                registry: PluginRegistry::default(),
            })),
            generation: AtomicU64::new(0),
        };

        let snapshot = repo.build_snapshot()?;
        info!(
            root = %repo.options.repository.display(),
            plugins = ?snapshot.registry.plugin_names(),
            "repository loaded"
        );
        *repo.current.write().unwrap() = Arc::new(snapshot);
        Ok(repo)
    }

    /// The current snapshot; callers keep serving from it even across swaps
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().unwrap().clone()
    }

    /// Rebuild off-line and swap on success; degrade on failure
    pub fn reload(&self) -> Result<()> {
        match self.build_snapshot() {
            Ok(snapshot) => {
                let generation = snapshot.generation;
                *self.current.write().unwrap() = Arc::new(snapshot);
                info!(generation, "repository snapshot swapped");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "repository degraded; keeping previous snapshot");
                Err(err)
            }
        }
    }

    fn build_snapshot(&self) -> Result<Snapshot> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let layout = RepoLayout::new(&self.options.repository);

        let groups_path = layout.groups_file();
        if !groups_path.is_file() {
            return Err(Error::RepoLoad {
                path: groups_path,
                reason: "groups document is required".to_string(),
            });
        }
        let graph = GroupGraph::from_document(&load_with_includes(&groups_path)?)?;

        let clients = if layout.clients_file().is_file() {
            ClientsDoc::from_document(&load_with_includes(&layout.clients_file())?)?
        } else {
            ClientsDoc::default()
        };

        let mut registry = PluginRegistry::default();
        registry
            .generators
            .push(Arc::new(RulesPlugin::load(&layout.rules_dir(), self.options.rules.regex)?));
        registry
            .structures
            .push(Arc::new(BundlerPlugin::load(&layout.bundler_dir())?));
        registry
            .probes
            .push(Arc::new(ProbesPlugin::load(&layout.probes_dir())?));
        registry.connectors.push(self.engine.clone());
        registry
            .structure_validators
            .push(Arc::new(ServiceModeCompat));
        registry
            .decisions
            .push(Arc::new(crate::decision::DecisionsPlugin::load(&layout.decisions_dir())?));
        registry.run_hooks.push(self.intake.clone());

        // Client declarations from the groups document imply existence only
        // in file-based mode; with the database on they merely annotate
        let implied: Vec<String> = if self.options.metadata.use_database {
            Vec::new()
        } else {
            graph.declared_clients().to_vec()
        };
        self.store.sync_from(&clients, &implied);

        debug!(generation, clients = clients.len(), "snapshot built");
        Ok(Snapshot {
            generation,
            graph,
            clients,
            registry,
        })
    }
}

/// Filesystem change notification backend
pub trait FileMonitor: Send + Sync {
    /// Begin watching `root`; deliver a unit on every observed change
    fn watch(&self, root: PathBuf, tx: tokio::sync::mpsc::Sender<()>) -> Result<()>;
}

/// No-op backend: reloads happen only by administrative request
pub struct NullMonitor;

impl FileMonitor for NullMonitor {
    fn watch(&self, _root: PathBuf, _tx: tokio::sync::mpsc::Sender<()>) -> Result<()> {
        Ok(())
    }
}

/// mtime-scanning backend on a dedicated thread
pub struct PollMonitor {
    pub interval: Duration,
}

impl Default for PollMonitor {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

impl PollMonitor {
    fn fingerprint(root: &Path) -> (u64, SystemTime) {
        let mut files = 0u64;
        let mut newest = SystemTime::UNIX_EPOCH;
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(meta) = entry.metadata() {
                    files += 1;
                    if let Ok(mtime) = meta.modified() {
                        newest = newest.max(mtime);
                    }
                }
            }
        }
        (files, newest)
    }
}

impl FileMonitor for PollMonitor {
    fn watch(&self, root: PathBuf, tx: tokio::sync::mpsc::Sender<()>) -> Result<()> {
        let interval = self.interval;
        std::thread::Builder::new()
            .name("tailor-fmon".to_string())
            .spawn(move || {
                let mut last = Self::fingerprint(&root);
                loop {
                    std::thread::sleep(interval);
                    let next = Self::fingerprint(&root);
                    if next != last {
                        last = next;
                        if tx.blocking_send(()).is_err() {
                            return;
                        }
                    }
                }
            })?;
        Ok(())
    }
}

/// Construct the configured monitor backend
pub fn monitor_for(options: &Options) -> Result<Box<dyn FileMonitor>> {
    match options.server.filemonitor.as_str() {
        "none" => Ok(Box::new(NullMonitor)),
        "poll" => Ok(Box::new(PollMonitor::default())),
        other => {
            error!(backend = other, "unknown filemonitor backend");
            Err(Error::Config(format!("unknown filemonitor backend {other:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_repo(root: &Path) {
        std::fs::create_dir_all(root.join("Metadata")).unwrap();
        std::fs::create_dir_all(root.join("Bundler")).unwrap();
        std::fs::create_dir_all(root.join("Rules")).unwrap();
        std::fs::write(
            root.join("Metadata/groups.xml"),
            r#"<Groups>
                 <Group name="web" profile="true" public="true">
                   <Bundle name="nginx"/>
                 </Group>
               </Groups>"#,
        )
        .unwrap();
        std::fs::write(
            root.join("Metadata/clients.xml"),
            r#"<Clients><Client name="web1" profile="web"/></Clients>"#,
        )
        .unwrap();
        std::fs::write(
            root.join("Bundler/nginx.xml"),
            r#"<Bundle name="nginx"><Service name="nginx"/></Bundle>"#,
        )
        .unwrap();
        std::fs::write(
            root.join("Rules/services.xml"),
            r#"<Rules priority="0"><Service name="nginx" type="systemd" status="on"/></Rules>"#,
        )
        .unwrap();
    }

    fn repository(root: &Path) -> Repository {
        let options = Arc::new(Options {
            repository: root.to_path_buf(),
            ..Default::default()
        });
        let store = Arc::new(ClientStore::in_memory());
        let engine = Arc::new(ProbeEngine::new());
        let intake = StatsIntake::new(8, std::time::Duration::from_millis(50), vec![]);
        Repository::load(options, store, engine, intake).unwrap()
    }

    #[test]
    fn test_load_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());
        let repo = repository(dir.path());

        let snapshot = repo.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert!(snapshot.graph.is_profile("web"));
        assert!(snapshot.clients.get("web1").is_some());
        assert!(!snapshot.registry.generators.is_empty());
    }

    #[test]
    fn test_degrade_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());
        let repo = repository(dir.path());
        let before = repo.snapshot();

        // Break the groups document, then reload
        std::fs::write(dir.path().join("Metadata/groups.xml"), "<Groups>broken").unwrap();
        assert!(repo.reload().is_err());

        let after = repo.snapshot();
        assert_eq!(after.generation, before.generation);
        assert!(after.graph.is_profile("web"));

        // Fix it: the next reload swaps
        std::fs::write(dir.path().join("Metadata/groups.xml"), "<Groups/>").unwrap();
        repo.reload().unwrap();
        assert!(repo.snapshot().generation > before.generation);
    }

    #[test]
    fn test_missing_groups_is_fatal_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let options = Arc::new(Options {
            repository: dir.path().to_path_buf(),
            ..Default::default()
        });
        let store = Arc::new(ClientStore::in_memory());
        let engine = Arc::new(ProbeEngine::new());
        let intake = StatsIntake::new(8, std::time::Duration::from_millis(50), vec![]);
        assert!(Repository::load(options, store, engine, intake).is_err());
    }

    #[test]
    fn test_monitor_selection() {
        let mut options = Options::default();
        assert!(monitor_for(&options).is_ok());
        options.server.filemonitor = "none".to_string();
        assert!(monitor_for(&options).is_ok());
        options.server.filemonitor = "inotify".to_string();
        assert!(monitor_for(&options).is_err());
    }
}
