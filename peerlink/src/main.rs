//! peerlink: Layer 3 tunnel between two overlay peers.

use anyhow::Context;
use clap::Parser;
use peerlink::Config;
use peerlink::lifecycle::{self, EXIT_FAILURE, SystemLink, Termination};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "Layer 3 tunnel between two overlay peers")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log every relayed frame
    #[arg(short, long)]
    debug: bool,

    /// Write a template config file and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = if args.debug { "peerlink=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.init {
        match Config::write_template(&args.config) {
            Ok(()) => {
                info!(path = %args.config.display(), "Template config written");
                info!("Set remote_peer, then start peerlink again");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to write template config");
                std::process::exit(EXIT_FAILURE);
            }
        }
    }

    let link = match start(&args.config, args.debug).await {
        Ok(link) => link,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup failed");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGINT handler");
            std::process::exit(EXIT_FAILURE);
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    };

    let termination = link.run(shutdown).await;
    match &termination {
        Termination::Signal(signal) => info!(signal, "peerlink stopped"),
        Termination::Failed(e) => error!(error = %e, "peerlink stopped on error"),
    }
    std::process::exit(termination.exit_code());
}

async fn start(path: &Path, debug: bool) -> anyhow::Result<SystemLink> {
    let mut config = Config::load(path).with_context(|| {
        format!(
            "cannot use config {} (run 'peerlink --init' to create one)",
            path.display()
        )
    })?;
    config.debug |= debug;

    info!(
        peer = %config.remote_peer,
        tun = %config.tun_device_name,
        address = %config.tun_device_ip_address,
        mtu = config.mtu,
        "peerlink starting"
    );

    lifecycle::bootstrap(Arc::new(config))
        .await
        .context("link setup failed (peerlink needs CAP_NET_ADMIN)")
}
