use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mvirt_router::ping::{EchoClient, PING_COUNT, PING_DELAY, TRACEROUTE_MAX_TTL};
use mvirt_router::{Router, RouterConfig};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvirt-router", about = "Graph-based software packet router")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run until SIGINT or SIGTERM (default)
    Run,

    /// Send echo requests through the dataplane
    Ping {
        dst: Ipv4Addr,

        #[arg(long, default_value_t = 0)]
        domain: u16,

        #[arg(short, long, default_value_t = PING_COUNT)]
        count: u16,

        /// Delay after each answered echo, in milliseconds
        #[arg(short, long, default_value_t = PING_DELAY.as_millis() as u64)]
        interval_ms: u64,
    },

    /// Trace the path to a destination with increasing TTL
    Traceroute {
        dst: Ipv4Addr,

        #[arg(long, default_value_t = 0)]
        domain: u16,

        #[arg(short, long, default_value_t = TRACEROUTE_MAX_TTL)]
        max_ttl: u8,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RouterConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RouterConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let router = Router::start(config).context("Failed to start router")?;
    let stop = Arc::new(AtomicBool::new(false));

    let outcome = match args.command.unwrap_or(Command::Run) {
        Command::Run => wait_for_signal().await,
        Command::Ping {
            dst,
            domain,
            count,
            interval_ms,
        } => {
            let client = EchoClient::new(router.client());
            let flag = Arc::clone(&stop);
            let task = tokio::task::spawn_blocking(move || {
                client.ping(domain, dst, count, Duration::from_millis(interval_ms), &flag)
            });
            run_interruptible(task, &stop).await.and_then(|outcomes| {
                let outcomes = outcomes?;
                let received = outcomes.iter().filter(|p| p.reply().is_some()).count();
                info!(%dst, transmitted = outcomes.len(), received, "Ping finished");
                Ok(())
            })
        }
        Command::Traceroute {
            dst,
            domain,
            max_ttl,
        } => {
            let client = EchoClient::new(router.client());
            let flag = Arc::clone(&stop);
            let task = tokio::task::spawn_blocking(move || {
                client.traceroute(domain, dst, max_ttl, &flag)
            });
            run_interruptible(task, &stop).await.and_then(|hops| {
                let hops = hops?;
                info!(%dst, hops = hops.len(), "Traceroute finished");
                Ok(())
            })
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Command failed");
    }
    router.shutdown().context("Router shutdown failed")?;
    outcome
}

async fn wait_for_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    info!("Router running (Ctrl+C to stop)");
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}

/// Wait for a blocking client task, asking it to stop on SIGINT/SIGTERM.
async fn run_interruptible<T: Send + 'static>(
    mut task: JoinHandle<T>,
    stop: &AtomicBool,
) -> Result<T> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    tokio::select! {
        res = &mut task => return Ok(res?),
        _ = sigint.recv() => info!("Received SIGINT, stopping..."),
        _ = sigterm.recv() => info!("Received SIGTERM, stopping..."),
    }
    stop.store(true, Ordering::Relaxed);
    Ok(task.await?)
}
