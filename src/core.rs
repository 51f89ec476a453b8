// src/core.rs

//! The synthesis pipeline
//!
//! One place owns the end-to-end flow: resolve metadata, assemble
//! structures, bind entries, filter by decision list, serialize. The
//! server façade and the `check` command both drive requests through
//! here, so the pipeline's ordering and failure behavior is identical
//! for both.

use crate::bind::Binder;
use crate::decision;
use crate::error::{Error, Result};
use crate::metadata::{ClientMetadata, ClientStore, MetadataResolver};
use crate::options::{DecisionMode, Options};
use crate::plugin::StatisticsSink;
use crate::probes::{Probe, ProbeEngine};
use crate::repo::{Repository, Snapshot};
use crate::stats::{LogStatsSink, SqliteStatsSink, StatsIntake};
use crate::structures;
use crate::xml::Element;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Per-request cancellation point, checked between bundles and entries
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline (administrative paths)
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn within(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.at {
            Some(at) if Instant::now() >= at => Err(Error::MetadataRuntime(
                "request deadline exceeded".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// The assembled core: repository, resolver, probe engine, binder, stats
pub struct Core {
    pub options: Arc<Options>,
    repo: Repository,
    resolver: MetadataResolver,
    engine: Arc<ProbeEngine>,
    binder: Binder,
    intake: Arc<StatsIntake>,
    store: Arc<ClientStore>,
}

impl Core {
    /// Construct every component from options and load the repository
    pub fn open(options: Arc<Options>) -> Result<Arc<Self>> {
        let store = Arc::new(if options.metadata.use_database {
            ClientStore::with_database(&options.metadata.database_path)?
        } else {
            ClientStore::in_memory()
        });

        let sinks: Vec<Arc<dyn StatisticsSink>> = match options.stats.sink.as_str() {
            "database" => vec![Arc::new(SqliteStatsSink::open(
                &options.metadata.database_path,
            )?)],
            "log" => vec![Arc::new(LogStatsSink)],
            other => {
                return Err(Error::Config(format!("unknown stats sink {other:?}")));
            }
        };
        let intake = StatsIntake::new(
            options.stats.queue_depth,
            Duration::from_millis(options.stats.budget_ms),
            sinks,
        );

        let engine = Arc::new(ProbeEngine::new());
        let repo = Repository::load(
            options.clone(),
            store.clone(),
            engine.clone(),
            intake.clone(),
        )?;
        engine.load_persisted(&repo.snapshot().registry, &store)?;

        let resolver = MetadataResolver::new(options.clone(), store.clone());

        info!("core initialized");
        Ok(Arc::new(Self {
            options,
            repo,
            resolver,
            engine,
            binder: Binder::new(),
            intake,
            store,
        }))
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn resolver(&self) -> &MetadataResolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<ClientStore> {
        &self.store
    }

    pub fn intake(&self) -> &Arc<StatsIntake> {
        &self.intake
    }

    /// Metadata snapshot for a client on a given repository snapshot
    pub fn metadata_for(
        &self,
        snapshot: &Snapshot,
        client: &str,
    ) -> Result<Arc<ClientMetadata>> {
        self.resolver.build(
            snapshot.generation,
            &snapshot.graph,
            client,
            &snapshot.registry.connectors,
        )
    }

    /// Probes declared for a client, in plugin order
    pub fn probes_for(&self, client: &str) -> Result<Vec<Probe>> {
        let snapshot = self.repo.snapshot();
        let metadata = self.metadata_for(&snapshot, client)?;
        Ok(self.engine.probes_for(&snapshot.registry, &metadata))
    }

    /// Ingest a probe response document; returns accepted probe names
    pub fn recv_probe_data(&self, client: &str, doc: &Element) -> Result<Vec<String>> {
        let snapshot = self.repo.snapshot();
        self.engine
            .ingest(&snapshot.registry, &self.resolver, &self.store, client, doc)
    }

    /// Synthesize the literal configuration document for a client
    pub fn build_config(&self, client: &str, deadline: &Deadline) -> Result<Element> {
        let snapshot = self.repo.snapshot();
        let metadata = self.metadata_for(&snapshot, client)?;

        for hook in &snapshot.registry.run_hooks {
            hook.start_client_run(&metadata);
        }

        let result = self.synthesize(&snapshot, &metadata, deadline);

        for hook in &snapshot.registry.run_hooks {
            hook.end_client_run(&metadata);
        }
        result
    }

    fn synthesize(
        &self,
        snapshot: &Snapshot,
        metadata: &ClientMetadata,
        deadline: &Deadline,
    ) -> Result<Element> {
        let structures = structures::assemble(&snapshot.registry, metadata, deadline)?;
        let mut bundles =
            self.binder
                .bind_structures(&snapshot.registry, metadata, structures, deadline)?;

        let mode = self.options.server.decision;
        if mode != DecisionMode::Off {
            let list = decision::decision_list(&snapshot.registry, mode, metadata);
            decision::apply(mode, &list, &mut bundles);
        }

        let mut doc = Element::new("Configuration").with_attr("version", "2.0");
        doc.children = bundles;
        debug!(
            client = metadata.hostname.as_str(),
            bundles = doc.children.len(),
            "configuration synthesized"
        );
        Ok(doc)
    }

    /// The decision list for an explicitly requested mode
    pub fn decision_list(
        &self,
        client: &str,
        mode: DecisionMode,
    ) -> Result<Vec<(String, String)>> {
        let snapshot = self.repo.snapshot();
        let metadata = self.metadata_for(&snapshot, client)?;
        Ok(decision::decision_list(&snapshot.registry, mode, &metadata))
    }

    /// Accept a statistics document; enqueue and return immediately
    pub fn recv_stats(&self, client: &str, doc: Element) -> Result<()> {
        let version = self.store.version_of(client);
        self.intake.submit(client, version.as_deref(), doc);

        let snapshot = self.repo.snapshot();
        if let Ok(metadata) = self.metadata_for(&snapshot, client) {
            for hook in &snapshot.registry.run_hooks {
                hook.end_statistics(&metadata);
            }
        }
        Ok(())
    }

    /// Load-and-validate pass over every known client (`tailor check`)
    pub fn check_all(&self) -> Vec<(String, Option<String>)> {
        let mut results = Vec::new();
        for client in self.store.names() {
            let outcome = self
                .build_config(&client, &Deadline::none())
                .err()
                .map(|e| e.to_string());
            results.push((client, outcome));
        }
        results
    }
}
