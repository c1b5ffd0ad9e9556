// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-executor
#![deny(unsafe_code)]

/// Periodic workspace mirroring.
pub mod sync_timer;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tbx_channel::frame::{self, Frame};
use tbx_channel::pubsub::{PubSubClient, serve_requests};
use tbx_config::{ExecutorConfig, ProjectContext};
use tbx_core::{RouteAttrs, ToolRequest, ToolResponse};
use tbx_tools::ToolRuntime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Shared state behind the duplex endpoint.
pub struct ExecutorState {
    /// Scope this executor serves; mismatched streams are refused.
    pub context: ProjectContext,
    /// The tool runtime, shared across connections (dispatch is serialized
    /// per stream, and one producer holds the lease, so one stream).
    pub runtime: ToolRuntime,
    /// Envelope key; frames travel sealed when present.
    pub key: Option<[u8; 32]>,
    /// Heartbeat cadence on the response stream.
    pub heartbeat: Duration,
}

/// Build the executor's HTTP surface.
pub fn build_app(state: Arc<ExecutorState>) -> Router {
    Router::new()
        .route("/sessions/stream", post(session_stream))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok", "role": "executor"}))
}

async fn session_stream(
    State(state): State<Arc<ExecutorState>>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let user_id = header(&headers, "x-user-id");
    let project_id = header(&headers, "x-project-id");
    if user_id.as_deref() != Some(state.context.user_id.as_str())
        || project_id.as_deref() != Some(state.context.project_id.as_str())
    {
        warn!(target: "tbx.executor", "stream refused: scope mismatch");
        return (StatusCode::FORBIDDEN, "wrong project scope").into_response();
    }
    let session_id = header(&headers, "x-session-id").unwrap_or_default();
    let gcs_token = header(&headers, "x-gcs-token");

    let body = request.into_body().into_data_stream();
    let (tx, rx) = mpsc::channel::<Result<String, std::convert::Infallible>>(64);
    let runtime = state.runtime.clone().with_gcs_token(gcs_token);

    tokio::spawn(serve_stream(
        Arc::clone(&state),
        runtime,
        StreamScope {
            user_id: user_id.unwrap_or_default(),
            project_id: project_id.unwrap_or_default(),
            session_id,
        },
        body,
        tx,
    ));

    let stream = ReceiverStream::new(rx).map(|r| r.map(axum::body::Bytes::from));
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .expect("response builds")
}

struct StreamScope {
    user_id: String,
    project_id: String,
    session_id: String,
}

/// One duplex stream: read request lines, run tools serially, write
/// response lines interleaved with heartbeats. The response stream stays
/// open after the request body ends; only a dead socket closes it.
async fn serve_stream(
    state: Arc<ExecutorState>,
    runtime: ToolRuntime,
    scope: StreamScope,
    body: axum::body::BodyDataStream,
    tx: mpsc::Sender<Result<String, std::convert::Infallible>>,
) {
    if tx
        .send(Ok(frame::ready_line(Utc::now().timestamp_millis())))
        .await
        .is_err()
    {
        return;
    }
    info!(target: "tbx.executor", session = %scope.session_id, "stream accepted");

    let mut body = body;
    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buf: Vec<u8> = Vec::new();
    let mut seq: u64 = 0;
    let mut body_open = true;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if tx
                    .send(Ok(frame::ping_line(Utc::now().timestamp_millis())))
                    .await
                    .is_err()
                {
                    // Client went away; nothing left to serve.
                    return;
                }
            }
            chunk = body.next(), if body_open => match chunk {
                None => {
                    // Client finished writing; keep the response stream
                    // open and keep heartbeating until the socket drops.
                    body_open = false;
                }
                Some(Err(e)) => {
                    debug!(target: "tbx.executor", error = %e, "request body failed");
                    body_open = false;
                }
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                        match Frame::parse(&text) {
                            Frame::Empty | Frame::Control(_) => {}
                            Frame::Unparseable(s) => {
                                debug!(target: "tbx.executor", frame = %s, "discarding unparseable frame");
                            }
                            Frame::Json(value) => {
                                seq += 1;
                                let attrs = RouteAttrs::request(
                                    &scope.user_id,
                                    &scope.project_id,
                                    scope.session_id.clone(),
                                    seq,
                                );
                                let line = handle_frame(&state, &runtime, &attrs, value).await;
                                if tx.send(Ok(line)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            },
        }
    }
}

/// Decode, execute, and encode one request frame.
async fn handle_frame(
    state: &ExecutorState,
    runtime: &ToolRuntime,
    attrs: &RouteAttrs,
    value: serde_json::Value,
) -> String {
    let request: ToolRequest = match &state.key {
        None => match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                debug!(target: "tbx.executor", error = %e, "malformed request frame");
                return format!("error malformed request: {e}\n");
            }
        },
        Some(key) => {
            let opened = serde_json::from_value::<tbx_envelope::Envelope>(value)
                .map_err(|e| e.to_string())
                .and_then(|env| {
                    tbx_envelope::open_json(&env, key, attrs).map_err(|e| e.to_string())
                })
                .and_then(|plain| {
                    serde_json::from_value::<ToolRequest>(plain).map_err(|e| e.to_string())
                });
            match opened {
                Ok(request) => request,
                Err(detail) => {
                    // Never silently accept an unauthenticated frame; the
                    // note is informational, the producer's timeout does
                    // the actual rejection.
                    warn!(target: "tbx.executor", error = %detail, "rejecting unauthenticated frame");
                    return format!("error envelope rejected: {detail}\n");
                }
            }
        }
    };

    let response = runtime.handle(&request).await;
    encode_response(state, attrs, &response)
}

fn encode_response(state: &ExecutorState, attrs: &RouteAttrs, response: &ToolResponse) -> String {
    let value = serde_json::to_value(response).expect("response serializes");
    match &state.key {
        None => frame::to_line(&value),
        Some(key) => {
            match tbx_envelope::seal_json(&value, key, &attrs.reply()) {
                Ok(envelope) => frame::to_line(
                    &serde_json::to_value(&envelope).expect("envelope serializes"),
                ),
                Err(e) => format!("error seal failed: {e}\n"),
            }
        }
    }
}

/// Run the pub/sub consumer until idle-exit or shutdown.
///
/// Transport failures back off and re-enter the serve loop; an idle window
/// with no traffic returns cleanly so the process can exit.
pub async fn run_pubsub(
    config: &ExecutorConfig,
    runtime: ToolRuntime,
    key: [u8; 32],
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let subscription = config
        .subscription
        .clone()
        .ok_or_else(|| anyhow::anyhow!("pub/sub mode requires SUBSCRIPTION"))?;
    let topic = config
        .topic
        .clone()
        .ok_or_else(|| anyhow::anyhow!("pub/sub mode requires PUBSUB_TOPIC"))?;
    let client = PubSubClient::new(&config.pubsub_base_url, None);
    let idle_exit = Duration::from_millis(config.idle_exit_ms);
    let mut backoff = tbx_channel::Backoff::new(Duration::from_secs(1));

    loop {
        let runtime = runtime.clone();
        let serve = serve_requests(&client, &subscription, &topic, &key, idle_exit, move |req| {
            let runtime = runtime.clone();
            async move { runtime.handle(&req).await }
        });

        tokio::select! {
            result = serve => match result {
                Ok(()) => {
                    info!(target: "tbx.executor", "idle-exit window elapsed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(target: "tbx.executor", error = %e, "pub/sub serve failed; backing off");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
