// src/server/mod.rs
//! The request façade: XML-RPC over HTTP
//!
//! Serves the protocol surface (`AssertProfile`, `DeclareVersion`,
//! `GetProbes`, `RecvProbeData`, `GetConfig`, `GetDecisionList`,
//! `RecvStats`) on top of the synthesis core. Configuration synthesis
//! runs synchronously on a bounded worker pool; the repository is
//! re-snapshotted when the filesystem monitor reports changes.

mod metrics;
pub mod rpc;
mod routes;
mod session;

pub use metrics::ServerMetrics;
pub use routes::create_router;
pub use session::{SessionPhase, SessionTracker};

use crate::core::Core;
use crate::options::Options;
use crate::repo::monitor_for;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Sessions idle longer than this restart transparently
const SESSION_TTL: Duration = Duration::from_secs(600);

/// Shared server state
pub struct ServerState {
    pub core: Arc<Core>,
    pub sessions: SessionTracker,
    pub metrics: ServerMetrics,
    /// Bounded synthesis worker pool
    pub synthesis: Semaphore,
}

impl ServerState {
    pub fn new(core: Arc<Core>) -> Self {
        let workers = core.options.worker_count();
        Self {
            core,
            sessions: SessionTracker::new(SESSION_TTL),
            metrics: ServerMetrics::new(),
            synthesis: Semaphore::new(workers),
        }
    }
}

/// Start the server and serve until shutdown
pub async fn run_server(options: Options) -> Result<()> {
    let bind_addr: SocketAddr = options
        .server
        .listen
        .parse()
        .with_context(|| format!("bad listen address {:?}", options.server.listen))?;

    let options = Arc::new(options);
    let core = Core::open(options.clone()).context("failed to initialize core")?;

    info!(listen = %bind_addr, repository = %options.repository.display(), "starting tailor server");
    info!(workers = options.worker_count(), "synthesis pool sized");

    // Statistics drain worker
    core.intake().spawn_worker();

    // Filesystem monitor drives snapshot reloads
    let (fs_tx, mut fs_rx) = tokio::sync::mpsc::channel(16);
    monitor_for(&options)?.watch(options.repository.clone(), fs_tx)?;
    {
        let core = core.clone();
        tokio::spawn(async move {
            while fs_rx.recv().await.is_some() {
                // Errors degrade to the previous snapshot and are logged
                // at the reload site
                if core.repo().reload().is_err() {
                    warn!("reload failed; still serving previous snapshot");
                }
            }
        });
    }

    let state = Arc::new(ServerState::new(core));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("tailor is ready to serve");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
