// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use std::process::exit;
use tbx_config::{EXIT_CODE_CONFIG, ProducerConfig, process_env};
use tokio::sync::watch;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tbx-producer", version, about = "Tool Bridge producer")]
struct Args {
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = if args.debug {
        EnvFilter::new("tbx=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tbx=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match ProducerConfig::load(&process_env()) {
        Ok(config) => config,
        Err(e) => {
            error!(target: "tbx.producer", error = %e, "configuration invalid");
            exit(EXIT_CODE_CONFIG);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    tbx_producer::run(config, shutdown_rx).await
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
