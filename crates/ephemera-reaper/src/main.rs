//! ephemera-reaper - removes what crashed test sessions left behind.
//!
//! Sessions hold a TCP connection to the reaper. When a session's last
//! connection drops and it does not come back within the grace period, every
//! container, network and volume labeled with its session id is removed. A
//! periodic scan also picks up sessions whose own reaper is gone.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, eyre};
use ephemera::reaper::{ReaperConfig, ReaperServer};
use ephemera::runtime::DockerRuntime;
use ephemera_common::config::{DEFAULT_REAPER_ADDR, parse_duration};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "ephemera-reaper")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "EPHEMERA_REAPER_ADDR", default_value = DEFAULT_REAPER_ADDR)]
    listen: SocketAddr,

    /// Grace period for a dropped session to reconnect (e.g. 10s, 500ms)
    #[arg(long, env = "EPHEMERA_REAPER_RECONNECTION_TIMEOUT", default_value = "10s", value_parser = duration)]
    reconnection_timeout: Duration,

    /// Interval of the orphan scan
    #[arg(long, default_value = "60s", value_parser = duration)]
    sweep_interval: Duration,

    /// Leave orphans younger than this alone
    #[arg(long, default_value = "30s", value_parser = duration)]
    orphan_min_age: Duration,

    /// Sweep rounds per orphaned session before leaving it to the next scan
    #[arg(long, default_value_t = 5)]
    orphan_sweep_attempts: usize,

    /// Container engine socket
    #[arg(long, env = "EPHEMERA_RUNTIME_SOCKET", value_parser = socket_path)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn duration(value: &str) -> std::result::Result<Duration, String> {
    parse_duration(value).ok_or_else(|| format!("invalid duration: {value:?}"))
}

fn socket_path(value: &str) -> std::result::Result<PathBuf, String> {
    Ok(PathBuf::from(value.strip_prefix("unix://").unwrap_or(value)))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let directive = if args.debug { "ephemera=debug" } else { "ephemera=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let runtime = match &args.socket {
        Some(path) => DockerRuntime::connect_socket(path)?,
        None => DockerRuntime::connect()?,
    };
    runtime
        .ping()
        .await
        .map_err(|e| eyre!("Container engine unreachable: {e}"))?;

    let config = ReaperConfig {
        listen: args.listen,
        reconnection_timeout: args.reconnection_timeout,
        sweep_interval: args.sweep_interval,
        orphan_min_age: args.orphan_min_age,
        orphan_sweep_attempts: args.orphan_sweep_attempts,
        ..ReaperConfig::default()
    };
    let server = ReaperServer::new(Arc::new(runtime), config);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted");
                shutdown.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });

    server.run().await?;
    Ok(())
}
