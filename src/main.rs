//! gcpvm - interactive manager for Compute Engine VMs, IAP tunnels and
//! Cloud Run services
//!
//! All cloud access goes through the `gcloud` CLI and its ambient login.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gcpvm_gateway::{GcloudGateway, GcloudShell, DEFAULT_GCLOUD};
use gcpvm_registry::{ConfigStore, Registry};
use gcpvm_session::{CtrlC, Session, SessionConfig, TerminalPrompt};
use gcpvm_tunnel::IapTunnelLauncher;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Manage Google Cloud VMs, IAP tunnels and Cloud Run services from a menu
#[derive(Parser, Debug)]
#[command(name = "gcpvm")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Verbose diagnostics (log level debug, gcloud invocations in the menus)
    #[arg(long)]
    debug: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Configuration file (default: ~/.gcpvm/config.json)
    #[arg(long, value_name = "PATH", env = "GCPVM_CONFIG")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    /// Seconds to wait for each cloud query
    #[arg(long, value_name = "SECS", env = "GCPVM_TIMEOUT", default_value_t = gcpvm_session::config::DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// gcloud executable
    #[arg(long, value_name = "PATH", env = "GCPVM_GCLOUD", default_value = DEFAULT_GCLOUD)]
    gcloud: PathBuf,
}

/// Logs go to stderr so they never mix with the menus
fn setup_logging(level: &str, debug: bool) {
    let level = if debug { "debug" } else { level };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(filter)
        .init();
}

fn open_registry(path: Option<PathBuf>) -> Result<Registry> {
    let store = match path {
        Some(path) => ConfigStore::new(path),
        None => ConfigStore::from_default_location()
            .context("Could not determine the default configuration location")?,
    };

    let config = store.load_or_create().with_context(|| {
        format!(
            "Failed to load configuration from {}",
            store.path().display()
        )
    })?;
    info!(path = %store.path().display(), projects = config.projects.len(), "Configuration loaded");

    Ok(Registry::with_configuration(store, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.debug);
    if cli.no_color {
        colored::control::set_override(false);
    }
    debug!(?cli, "Starting gcpvm");

    let registry = open_registry(cli.config)?;

    let gateway = Arc::new(GcloudGateway::new(cli.gcloud.clone()));
    let shell = Arc::new(GcloudShell::new(cli.gcloud.clone()));
    let launcher = Arc::new(IapTunnelLauncher::new(cli.gcloud));

    // Installed before any tunnel can exist
    let interrupt = CtrlC::install();

    let config = SessionConfig {
        timeout: Duration::from_secs(cli.timeout),
        debug: cli.debug,
        ..SessionConfig::default()
    };

    let mut session = Session::new(
        registry,
        gateway,
        shell,
        launcher,
        TerminalPrompt::new(!cli.no_color),
        interrupt,
        config,
    );
    info!(projects = session.project_count(), "Session started");

    session.run().await.context("Interactive session failed")?;
    Ok(())
}
