//! fedlabd — the fedlab daemon.
//!
//! Single binary that assembles the fedlab subsystems:
//! - Record store (SQLite, shared with workers)
//! - Lifecycle controller + process supervisor
//! - Progress feed
//! - Teardown coordinator
//! - REST API + SSE progress streams
//!
//! # Usage
//!
//! ```text
//! fedlabd init --data-dir /var/lib/fedlab > fedlab.toml
//! fedlabd serve --config fedlab.toml --port 8080
//! ```

mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,fedlabd=debug,fedlab=debug";

#[derive(Parser)]
#[command(name = "fedlabd", about = "fedlab experiment orchestration daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the API and launch workers on request.
    Serve {
        /// Path to fedlab.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Put the store, checkpoints and uploads under this directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print a scaffolded fedlab.toml.
    Init {
        /// Data directory the scaffold points at.
        #[arg(long, default_value = "/var/lib/fedlab")]
        data_dir: PathBuf,

        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let config = server::load_config(config.as_deref(), port, data_dir.as_deref())?;
            server::run(config).await
        }
        Command::Init { data_dir, output } => server::write_scaffold(&data_dir, output.as_deref()),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
