//! Rampart edge gateway.
//!
//! Accepts inbound HTTP traffic, applies per-client-IP admission control,
//! and routes admitted requests to a pool of upstream backends.

#![deny(missing_docs)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rampart_core::admission::AdmissionControl;
use rampart_core::balancer::ServerPool;
use rampart_core::domain::backend::Backend;

mod config;
mod filter;
mod forward;
mod server;

use config::Config;
use filter::LogPacketFilter;
use forward::HttpForwarder;
use server::Gateway;

/// Command-line options; everything else comes from the config file.
#[derive(Debug, Parser)]
#[command(name = "rampart", about = "Edge traffic gateway", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "rampart.toml")]
    config: PathBuf,
    /// Override the listen address from the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Override the selection policy from the config file.
    #[arg(long)]
    policy: Option<String>,
    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(policy) = cli.policy {
        config.policy = policy;
    }

    // Configuration failures are the only fatal errors; everything after
    // this point is handled per request.
    let backends: Vec<_> = config
        .backend_addrs()
        .context("invalid backend configuration")?
        .into_iter()
        .map(|addr| Arc::new(Backend::new(addr)))
        .collect();
    let policy = config.policy().context("invalid policy configuration")?;
    let admission_config = config
        .admission_config()
        .context("invalid admission configuration")?;

    info!(
        backends = backends.len(),
        ?policy,
        "rampart v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let pool = Arc::new(ServerPool::new(backends, policy, config.session_capacity));
    for backend in pool.snapshot().iter() {
        info!(backend = %backend.addr(), "registered backend");
    }

    let shutdown = CancellationToken::new();
    let (admission, signals) = AdmissionControl::new(admission_config, shutdown.clone());
    let consumer = filter::spawn_consumer(LogPacketFilter, signals, shutdown.clone());

    let gateway = Arc::new(Gateway {
        pool,
        admission: admission.clone(),
        forwarder: HttpForwarder::new(),
    });

    tokio::select! {
        result = server::run(config.listen, gateway, shutdown.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    consumer.await.ok();
    info!(
        tracked_ips = admission.tracked_ips(),
        dropped_signals = admission.dropped_signals(),
        "gateway stopped"
    );
    Ok(())
}

/// Structured logging with environment-based filtering; `-v` lowers the
/// default level to debug.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "rampart_gateway=debug,rampart_core=debug"
    } else {
        "rampart_gateway=info,rampart_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
