// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tbx_config::{EXIT_CODE_CONFIG, ExecutorConfig, ExecutorMode, expand_template, process_env};
use tbx_executor::{ExecutorState, build_app, run_pubsub, sync_timer};
use tbx_tools::ToolRuntime;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tbx-executor", version, about = "Tool Bridge executor")]
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

    let config = match ExecutorConfig::load(&process_env()) {
        Ok(config) => config,
        Err(e) => {
            error!(target: "tbx.executor", error = %e, "configuration invalid");
            exit(EXIT_CODE_CONFIG);
        }
    };

    let work_root = tbx_workspace::ensure_templated_root(
        std::path::Path::new(&config.work_root_base),
        &expand_template(&config.work_prefix_template, &config.context),
    )
    .context("prepare work root")?;
    info!(target: "tbx.executor", root = %work_root.display(), "work root ready");

    let key = match &config.enc_key_b64 {
        Some(b64) => Some(tbx_envelope::decode_key_b64(b64).context("decode ENC_KEY_B64")?),
        None => None,
    };

    let mirror_prefix = expand_template(&config.mirror.prefix_template, &config.context);
    let runtime = ToolRuntime::new(
        &work_root,
        config.limits,
        config.mirror.clone(),
        mirror_prefix.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Mirroring runs beside either fabric.
    tokio::spawn(sync_timer::run_sync_timer(
        config.mirror.clone(),
        mirror_prefix,
        work_root.clone(),
        shutdown_rx.clone(),
    ));

    match config.mode() {
        ExecutorMode::PubSub => {
            let key = key.context("pub/sub mode requires ENC_KEY_B64")?;
            run_pubsub(&config, runtime, key, shutdown_rx).await?;
        }
        ExecutorMode::Duplex => {
            let state = Arc::new(ExecutorState {
                context: config.context.clone(),
                runtime,
                key,
                heartbeat: Duration::from_millis(config.heartbeat_ms),
            });
            let app = build_app(state);
            let listener = tokio::net::TcpListener::bind(&config.bind)
                .await
                .with_context(|| format!("bind {}", config.bind))?;
            info!(target: "tbx.executor", bind = %config.bind, "executor listening");

            let mut shutdown = shutdown_rx;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
                .context("serve")?;
        }
    }

    info!(target: "tbx.executor", "executor stopped");
    Ok(())
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
