//! Serve mode: open the store, wire the orchestrator, run the API.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fedlab_core::FedlabConfig;
use fedlab_orchestrator::Orchestrator;
use fedlab_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};

/// Load `fedlab.toml` (or defaults) and apply CLI overrides.
pub fn load_config(
    path: Option<&Path>,
    port: Option<u16>,
    data_dir: Option<&Path>,
) -> anyhow::Result<FedlabConfig> {
    let mut config = match path {
        Some(path) => FedlabConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FedlabConfig::default(),
    };
    if let Some(dir) = data_dir {
        let scaffold = FedlabConfig::scaffold(dir);
        config.store = scaffold.store;
        config.paths = scaffold.paths;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate()?;
    Ok(config)
}

/// Render a scaffold config to `output`, or stdout.
pub fn write_scaffold(data_dir: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let rendered = FedlabConfig::scaffold(data_dir).to_toml_string()?;
    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "config scaffold written");
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

/// Create the directories the daemon and its workers write into.
fn prepare_dirs(config: &FedlabConfig) -> anyhow::Result<()> {
    if let Some(parent) = config.store.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    for dir in [&config.paths.checkpoints, &config.paths.uploads] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}

pub async fn run(config: FedlabConfig) -> anyhow::Result<()> {
    info!("fedlab daemon starting");

    prepare_dirs(&config)?;

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "record store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Arc::new(Orchestrator::from_config(&config, store, shutdown_rx)?);
    info!(
        program = %config.worker.program,
        script = ?config.worker.script,
        venv = ?config.worker.venv,
        "worker supervisor configured"
    );
    info!(poll_interval = %config.feed.poll_interval, "progress feed initialized");

    // ── Start API server ───────────────────────────────────────

    let router = fedlab_api::build_router(orchestrator);
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.server.bind))?;

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C; open progress streams are closed first.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    info!("fedlab daemon stopped");
    Ok(())
}
