// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-producer
#![deny(unsafe_code)]

/// HTTP client for the supervisor's lease API.
pub mod lease_api;

use anyhow::{Context, Result, bail};
use lease_api::{LeaseAnswer, LeaseApiClient};
use std::sync::Arc;
use std::time::Duration;
use tbx_callback::CallbackClient;
use tbx_channel::{DuplexClient, DuplexConfig, PubSubClient, PubSubRequester, ToolChannel};
use tbx_config::ProducerConfig;
use tbx_events::{CursorClient, EventPump, PumpConfig};
use tbx_lease::{REFRESH_FLOOR, refresh_interval};
use tokio::sync::watch;
use tracing::{info, warn};

/// Build the channel the configuration selects: duplex when an executor
/// base URL is present, pub/sub when a topic and reply subscription are.
pub fn build_channel(config: &ProducerConfig) -> Result<Arc<dyn ToolChannel>> {
    let key = match &config.enc_key_b64 {
        Some(b64) => Some(tbx_envelope::decode_key_b64(b64).context("decode ENC_KEY_B64")?),
        None => None,
    };
    let send_timeout = Duration::from_millis(config.send_timeout_ms);

    if let Some(base_url) = &config.consumer_base_url {
        return Ok(Arc::new(DuplexClient::new(DuplexConfig {
            base_url: base_url.clone(),
            user_id: config.context.user_id.clone(),
            project_id: config.context.project_id.clone(),
            workspace_id: config.context.workspace_id.clone(),
            session_id: config.context.session_id.clone(),
            auth_token: config.service_token.clone(),
            gcs_token: config.gcs_token.clone(),
            key,
            send_timeout,
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
        })));
    }

    if let (Some(topic), Some(reply)) = (&config.topic, &config.reply_subscription) {
        let key = key.context("pub/sub mode requires ENC_KEY_B64")?;
        return Ok(Arc::new(PubSubRequester::new(
            PubSubClient::new(&config.pubsub_base_url, None),
            topic.clone(),
            reply.clone(),
            key,
            config.context.user_id.clone(),
            config.context.project_id.clone(),
            config.context.session_id.clone().unwrap_or_default(),
            send_timeout,
        )));
    }

    bail!("no channel configured: set CONSUMER_BASE_URL or PUBSUB_TOPIC + REPLY_CHANNEL");
}

/// Keep the lease alive through the supervisor's lease API; flips
/// `surrender` when the lease is lost.
async fn refresh_lease(
    client: LeaseApiClient,
    consumer_id: String,
    lease_ms: u64,
    surrender: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delay = refresh_interval(lease_ms, REFRESH_FLOOR);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        match client.acquire(&consumer_id, lease_ms).await {
            Ok(LeaseAnswer::Held) => {}
            Ok(LeaseAnswer::Conflict { holder }) => {
                warn!(
                    target: "tbx.producer",
                    holder = holder.map(|h| h.consumer_id).unwrap_or_default(),
                    "lease lost; surrendering"
                );
                let _ = surrender.send(true);
                return;
            }
            Ok(LeaseAnswer::NotFound) => {
                warn!(target: "tbx.producer", "project vanished; surrendering");
                let _ = surrender.send(true);
                return;
            }
            Err(e) => {
                warn!(target: "tbx.producer", error = %e, "lease refresh failed; will retry");
            }
        }
    }
}

/// Run the producer until shutdown or lease loss.
///
/// Graceful shutdown spends at most half the budget on hooks (closing the
/// channel), then releases the lease with the remainder.
pub async fn run(config: ProducerConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let channel = build_channel(&config)?;

    // Lease loss and operator shutdown funnel into one stop signal.
    let (stop_tx, stop_rx) = watch::channel(false);
    {
        let stop_tx = stop_tx.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if shutdown.changed().await.is_err() {
                    return;
                }
                if *shutdown.borrow() {
                    let _ = stop_tx.send(true);
                    return;
                }
            }
        });
    }

    let lease = match (&config.supervisor_base_url, &config.consumer_id) {
        (Some(base_url), Some(consumer_id)) => {
            let client = LeaseApiClient::new(
                base_url,
                &config.context.user_id,
                &config.context.project_id,
            );
            tokio::spawn(refresh_lease(
                client.clone(),
                consumer_id.clone(),
                config.lock_lease_ms,
                stop_tx.clone(),
                stop_rx.clone(),
            ));
            Some((client, consumer_id.clone()))
        }
        _ => {
            info!(target: "tbx.producer", "no supervisor configured; running without lease refresh");
            None
        }
    };

    let pump = EventPump::new(
        PumpConfig {
            base_url: config.workflows_base_url.clone(),
            user_id: config.context.user_id.clone(),
            project_id: config.context.project_id.clone(),
            workspace_id: config.context.workspace_id.clone(),
            since_id: config.since_id.clone(),
            since_time: config.since_time.clone(),
            auth_token: config.service_token.clone(),
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
            error_delivery: config.error_delivery,
        },
        Arc::clone(&channel),
        CallbackClient::new(
            &config.workflows_base_url,
            &config.context.user_id,
            &config.context.project_id,
            config.service_token.clone(),
        ),
        CursorClient::new(
            &config.workflows_base_url,
            &config.context.user_id,
            &config.context.project_id,
            config.service_token.clone(),
        ),
    );

    info!(target: "tbx.producer", project = %config.context.project_id, "producer running");
    pump.run(stop_rx).await;

    // Shutdown: hooks get half the budget, the lease release the rest.
    let budget = Duration::from_millis(config.shutdown_timeout_ms);
    let _ = tokio::time::timeout(budget / 2, channel.close()).await;
    if let Some((client, consumer_id)) = lease {
        match tokio::time::timeout(budget / 2, client.release(&consumer_id)).await {
            Ok(Ok(())) => info!(target: "tbx.producer", "lease released"),
            Ok(Err(e)) => warn!(target: "tbx.producer", error = %e, "lease release failed"),
            Err(_) => warn!(target: "tbx.producer", "lease release timed out"),
        }
    }

    info!(target: "tbx.producer", "producer stopped");
    Ok(())
}
