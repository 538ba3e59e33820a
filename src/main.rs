use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use perfshm::agent::Agent;
use perfshm::config::{Config, SinkKind};
use perfshm::sink::shm::read_snapshot;

/// Periodic metrics aggregation into a shared memory region.
#[derive(Parser)]
#[command(name = "perfshm", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collector (default).
    Run,
    /// Print the snapshot currently published in the shared region.
    Dump,
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("perfshm {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // The flag wins over the config file.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(Command::Dump) = &cli.command {
        return dump(&cfg);
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting perfshm",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "signal handler failed");
        }
        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    tokio::select! {
        _ = shutdown_rx => {}
        _ = agent.wait() => {}
    }

    agent.stop().await?;

    tracing::info!("perfshm stopped");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("received ctrl-c, shutting down");
    Ok(())
}

/// Prints each published value next to its metric name.
fn dump(cfg: &Config) -> Result<()> {
    if cfg.sink.kind != SinkKind::SharedMemory {
        bail!("dump requires the shared_memory sink");
    }

    let values = read_snapshot(
        &cfg.sink.dir,
        &cfg.collector.sink_name,
        Some(cfg.metrics.len()),
    )
    .with_context(|| format!("reading region {}", cfg.collector.sink_name))?;

    for (def, value) in cfg.metrics.iter().zip(values.iter().chain(std::iter::repeat(&0))) {
        println!("{:<32} {value}", def.name);
    }

    Ok(())
}
