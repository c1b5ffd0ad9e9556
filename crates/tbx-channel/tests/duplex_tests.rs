// SPDX-License-Identifier: MIT OR Apache-2.0
//! Duplex channel contract tests against a scripted in-process executor.

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::post;
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tbx_channel::{ChannelError, DuplexClient, DuplexConfig, ToolChannel};
use tbx_core::{RouteAttrs, ToolRequest, ToolResponse};
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// How the scripted executor behaves per connection.
#[derive(Clone, Copy, PartialEq)]
enum ServerMode {
    /// Answer every request.
    Echo,
    /// Answer the first request of each connection, then end the stream.
    CloseAfterFirst,
    /// Accept requests, never answer.
    Mute,
    /// Interleave control tokens and garbage before each answer.
    Noisy,
}

#[derive(Clone)]
struct TestState {
    mode: ServerMode,
    key: Option<[u8; 32]>,
    seen: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

async fn start_server(mode: ServerMode, key: Option<[u8; 32]>) -> (String, TestState) {
    let state = TestState {
        mode,
        key,
        seen: Arc::new(Mutex::new(Vec::new())),
        connections: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/sessions/stream", post(stream_handler))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

async fn stream_handler(State(state): State<TestState>, request: Request) -> Response {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let user_id = header(&request, "x-user-id");
    let project_id = header(&request, "x-project-id");
    let session_id = header(&request, "x-session-id");

    let mut body = request.into_body().into_data_stream();
    let (tx, rx) = mpsc::channel::<Result<String, Infallible>>(64);

    tokio::spawn(async move {
        let _ = tx.send(Ok("ready 0\n".to_string())).await;
        let mut buf: Vec<u8> = Vec::new();
        let mut answered = 0usize;
        let mut seq = 0u64;

        while let Some(Ok(chunk)) = body.next().await {
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                if text.trim().is_empty() {
                    continue;
                }
                seq += 1;

                let request: ToolRequest = match state.key {
                    None => serde_json::from_str(&text).unwrap(),
                    Some(key) => {
                        let envelope: tbx_envelope::Envelope =
                            serde_json::from_str(&text).unwrap();
                        let attrs = RouteAttrs::request(
                            &user_id,
                            &project_id,
                            session_id.clone(),
                            seq,
                        );
                        let plain = tbx_envelope::open_json(&envelope, &key, &attrs).unwrap();
                        serde_json::from_value(plain).unwrap()
                    }
                };
                state.seen.lock().await.push(request.id.clone());

                if state.mode == ServerMode::Mute {
                    continue;
                }
                if state.mode == ServerMode::Noisy {
                    let _ = tx.send(Ok("ping 1712345\n".to_string())).await;
                    let _ = tx.send(Ok("error upstream blip\n".to_string())).await;
                    let _ = tx.send(Ok("not json at all\n".to_string())).await;
                }

                let response =
                    ToolResponse::ok(&request.id, json!({"echoed": request.id.clone()}));
                let line = match state.key {
                    None => format!("{}\n", serde_json::to_string(&response).unwrap()),
                    Some(key) => {
                        let attrs = RouteAttrs::request(
                            &user_id,
                            &project_id,
                            session_id.clone(),
                            seq,
                        )
                        .reply();
                        let value = serde_json::to_value(&response).unwrap();
                        let envelope =
                            tbx_envelope::seal_json(&value, &key, &attrs).unwrap();
                        format!("{}\n", serde_json::to_string(&envelope).unwrap())
                    }
                };
                if tx.send(Ok(line)).await.is_err() {
                    return;
                }
                answered += 1;
                if state.mode == ServerMode::CloseAfterFirst && answered >= 1 {
                    // Dropping the sender ends the response stream.
                    return;
                }
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|r| r.map(Bytes::from));
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap()
}

fn header(request: &Request, name: &str) -> String {
    request
        .headers()
        .get(name)
        .map(|v| v.to_str().unwrap_or_default().to_string())
        .unwrap_or_default()
}

fn config(base_url: &str, key: Option<[u8; 32]>) -> DuplexConfig {
    DuplexConfig {
        base_url: base_url.to_string(),
        user_id: "u1".into(),
        project_id: "p1".into(),
        workspace_id: None,
        session_id: None,
        auth_token: Some("svc-token".into()),
        gcs_token: None,
        key,
        send_timeout: Duration::from_secs(5),
        reconnect_backoff: Duration::from_millis(50),
    }
}

fn tool_request(id: &str) -> ToolRequest {
    serde_json::from_value(json!({
        "id": id,
        "tool_call": {"function": {"name": "READ_FILE", "arguments": {"filepath": "a.txt"}}}
    }))
    .unwrap()
}

#[tokio::test]
async fn sends_resolve_in_submission_order() {
    let (url, state) = start_server(ServerMode::Echo, None).await;
    let client = DuplexClient::new(config(&url, None));

    let (r1, r2, r3) = tokio::join!(
        client.send(tool_request("r1")),
        client.send(tool_request("r2")),
        client.send(tool_request("r3")),
    );

    assert_eq!(r1.unwrap().id, "r1");
    assert_eq!(r2.unwrap().id, "r2");
    assert_eq!(r3.unwrap().id, "r3");
    assert_eq!(*state.seen.lock().await, vec!["r1", "r2", "r3"]);
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnect_preserves_queue_order() {
    let (url, state) = start_server(ServerMode::CloseAfterFirst, None).await;
    let client = DuplexClient::new(config(&url, None));

    let (r1, r2, r3) = tokio::join!(
        client.send(tool_request("r1")),
        client.send(tool_request("r2")),
        client.send(tool_request("r3")),
    );

    // Each connection dies after one answer; the queue survives reconnects
    // and the peer observes r1, r2, r3 in order.
    assert_eq!(r1.unwrap().id, "r1");
    assert_eq!(r2.unwrap().id, "r2");
    assert_eq!(r3.unwrap().id, "r3");
    assert_eq!(*state.seen.lock().await, vec!["r1", "r2", "r3"]);
    assert!(state.connections.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn timeout_rejects_inflight_and_queued_tail() {
    let (url, _state) = start_server(ServerMode::Mute, None).await;
    let mut cfg = config(&url, None);
    cfg.send_timeout = Duration::from_millis(200);
    let client = DuplexClient::new(cfg);

    let (r1, r2) = tokio::join!(client.send(tool_request("r1")), client.send(tool_request("r2")));

    assert!(matches!(r1.unwrap_err(), ChannelError::SendTimeout));
    assert!(matches!(r2.unwrap_err(), ChannelError::Stopped));
}

#[tokio::test]
async fn control_frames_and_garbage_are_ignored() {
    let (url, _state) = start_server(ServerMode::Noisy, None).await;
    let client = DuplexClient::new(config(&url, None));

    let resp = client.send(tool_request("r1")).await.unwrap();
    assert_eq!(resp.result.unwrap()["echoed"], "r1");
}

#[tokio::test]
async fn sealed_frames_round_trip() {
    let key = [7u8; 32];
    let (url, state) = start_server(ServerMode::Echo, Some(key)).await;
    let client = DuplexClient::new(config(&url, Some(key)));

    let resp = client.send(tool_request("enc-1")).await.unwrap();
    assert_eq!(resp.id, "enc-1");
    assert_eq!(*state.seen.lock().await, vec!["enc-1"]);
}

#[tokio::test]
async fn sealed_frames_survive_reconnect() {
    // Per-connection sequence numbers must restart on the new connection,
    // or the second request's AAD would not authenticate.
    let key = [9u8; 32];
    let (url, state) = start_server(ServerMode::CloseAfterFirst, Some(key)).await;
    let client = DuplexClient::new(config(&url, Some(key)));

    let (r1, r2) = tokio::join!(client.send(tool_request("a")), client.send(tool_request("b")));
    assert_eq!(r1.unwrap().id, "a");
    assert_eq!(r2.unwrap().id, "b");
    assert!(state.connections.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn close_rejects_later_sends() {
    let (url, _state) = start_server(ServerMode::Echo, None).await;
    let client = DuplexClient::new(config(&url, None));

    client.close().await;
    let err = client.send(tool_request("late")).await.unwrap_err();
    assert!(matches!(err, ChannelError::Stopped));
}
