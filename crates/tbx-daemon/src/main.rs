// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::process::exit;
use std::sync::Arc;
use tbx_config::{DaemonConfig, EXIT_CODE_CONFIG, process_env};
use tbx_daemon::{AppState, Supervisor, build_app};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tbx-daemon", version, about = "Tool Bridge supervisor daemon")]
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

    let config = match DaemonConfig::load(&process_env()) {
        Ok(config) => config,
        Err(e) => {
            error!(target: "tbx.daemon", error = %e, "configuration invalid");
            exit(EXIT_CODE_CONFIG);
        }
    };

    let bind = config.bind.clone();
    let state = Arc::new(AppState {
        supervisor: Supervisor::new(config),
    });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(target: "tbx.daemon", bind = %bind, "supervisor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            wait_for_signal().await;
        })
        .await
        .context("serve")
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
