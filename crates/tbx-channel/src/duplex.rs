// SPDX-License-Identifier: MIT OR Apache-2.0
//! The duplex NDJSON channel client.
//!
//! One long-lived HTTP exchange carries both directions: a chunked POST
//! body streams requests out while the response body streams responses and
//! heartbeats back. A single dispatcher task owns the connection; `send`
//! callers park on a reply channel. At most one request is in flight, the
//! queue drains FIFO, and a send timeout tears the connection down.
//!
//! Sequence numbers are per-connection: both peers count request frames
//! from 1 on every (re)connect, which is what keeps the envelope AAD in
//! agreement across reconnects.

use crate::frame::{self, Frame};
use crate::{Backoff, ChannelError, ToolChannel};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use tbx_core::{RouteAttrs, ToolRequest, ToolResponse};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Endpoint path served by the executor.
pub const STREAM_PATH: &str = "/sessions/stream";

/// Settings for a duplex channel client.
#[derive(Debug, Clone)]
pub struct DuplexConfig {
    /// Executor base URL.
    pub base_url: String,
    /// Route context, sent as headers and bound into the AAD.
    pub user_id: String,
    /// Owning project.
    pub project_id: String,
    /// Workspace scope header, if any.
    pub workspace_id: Option<String>,
    /// Session scope header, if any.
    pub session_id: Option<String>,
    /// Service identity bearer for the `Authorization` header.
    pub auth_token: Option<String>,
    /// Short-lived object-store token forwarded as `X-Gcs-Token`.
    pub gcs_token: Option<String>,
    /// Envelope key; frames travel sealed when present.
    pub key: Option<[u8; 32]>,
    /// Per-send timeout.
    pub send_timeout: Duration,
    /// Initial reconnect backoff.
    pub reconnect_backoff: Duration,
}

struct Pending {
    request: ToolRequest,
    reply: oneshot::Sender<Result<ToolResponse, ChannelError>>,
}

enum Msg {
    Send(Pending),
    Close,
}

/// Client handle; cheap to clone, all clones share one dispatcher.
#[derive(Clone)]
pub struct DuplexClient {
    tx: mpsc::Sender<Msg>,
}

impl DuplexClient {
    /// Spawn the dispatcher for `config` and return the handle.
    ///
    /// No connection is made until the first `send`.
    #[must_use]
    pub fn new(config: DuplexConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(
            Dispatcher {
                config,
                http: reqwest::Client::new(),
                rx,
                queue: VecDeque::new(),
                seq: 0,
            }
            .run(),
        );
        Self { tx }
    }
}

#[async_trait]
impl ToolChannel for DuplexClient {
    async fn send(&self, request: ToolRequest) -> Result<ToolResponse, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Send(Pending { request, reply }))
            .await
            .map_err(|_| ChannelError::Stopped)?;
        rx.await.map_err(|_| ChannelError::Stopped)?
    }

    async fn close(&self) {
        let _ = self.tx.send(Msg::Close).await;
    }
}

enum Outcome {
    Response(ToolResponse),
    Timeout,
    Ended,
    Closed,
    Envelope(ChannelError),
}

struct Dispatcher {
    config: DuplexConfig,
    http: reqwest::Client,
    rx: mpsc::Receiver<Msg>,
    queue: VecDeque<Pending>,
    seq: u64,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect_backoff);
        let mut reconnecting = false;

        'outer: loop {
            // Idle until there is work.
            while self.queue.is_empty() {
                match self.rx.recv().await {
                    Some(Msg::Send(p)) => self.queue.push_back(p),
                    Some(Msg::Close) | None => {
                        self.reject_all(&ChannelError::Stopped);
                        return;
                    }
                }
            }

            // Back off before a reconnect (not before the first connect).
            if reconnecting && !self.sleep_accepting(backoff.next_delay()).await {
                self.reject_all(&ChannelError::Stopped);
                return;
            }

            let mut conn = match Conn::open(&self.http, &self.config).await {
                Ok(conn) => {
                    backoff.reset();
                    reconnecting = false;
                    self.seq = 0;
                    conn
                }
                Err(e) => {
                    warn!(target: "tbx.channel", error = %e, "connect failed; backing off");
                    reconnecting = true;
                    continue 'outer;
                }
            };
            debug!(target: "tbx.channel", "duplex channel connected");

            // Connected: drain the queue, one request in flight.
            loop {
                let Some(pending) = self.queue.pop_front() else {
                    tokio::select! {
                        msg = self.rx.recv() => match msg {
                            Some(Msg::Send(p)) => self.queue.push_back(p),
                            Some(Msg::Close) | None => {
                                self.reject_all(&ChannelError::Stopped);
                                return;
                            }
                        },
                        line = conn.lines.recv() => match line {
                            // Keepalives while idle; anything else is stray.
                            Some(_) => {}
                            None => {
                                reconnecting = true;
                                continue 'outer;
                            }
                        },
                    }
                    continue;
                };

                // The sequence number is committed only once the frame
                // encodes; the peer counts received lines.
                let line = match self.encode(&pending.request, self.seq + 1) {
                    Ok(line) => {
                        self.seq += 1;
                        line
                    }
                    Err(e) => {
                        let _ = pending.reply.send(Err(e));
                        continue;
                    }
                };

                if let Err(detail) = conn.write(line).await {
                    // The frame never left; replay it on the next connection.
                    warn!(target: "tbx.channel", error = %detail, "write failed; reconnecting");
                    self.queue.push_front(pending);
                    reconnecting = true;
                    continue 'outer;
                }

                match self.await_response(&mut conn).await {
                    Outcome::Response(resp) => {
                        let _ = pending.reply.send(Ok(resp));
                    }
                    Outcome::Timeout => {
                        // The timed-out request rejects; the queued tail is
                        // rejected rather than replayed onto a fresh
                        // connection.
                        let _ = pending.reply.send(Err(ChannelError::SendTimeout));
                        self.reject_all(&ChannelError::Stopped);
                        reconnecting = true;
                        continue 'outer;
                    }
                    Outcome::Ended => {
                        // Stream died under the in-flight request. Handlers
                        // are idempotent on the request id, so replaying on
                        // the next connection is safe; only timeouts reject
                        // the queue.
                        self.queue.push_front(pending);
                        reconnecting = true;
                        continue 'outer;
                    }
                    Outcome::Envelope(e) => {
                        let _ = pending.reply.send(Err(e));
                        reconnecting = true;
                        continue 'outer;
                    }
                    Outcome::Closed => {
                        let _ = pending.reply.send(Err(ChannelError::Stopped));
                        self.reject_all(&ChannelError::Stopped);
                        return;
                    }
                }
            }
        }
    }

    async fn await_response(&mut self, conn: &mut Conn) -> Outcome {
        let deadline = tokio::time::sleep(self.config.send_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Outcome::Timeout,
                msg = self.rx.recv() => match msg {
                    Some(Msg::Send(p)) => self.queue.push_back(p),
                    Some(Msg::Close) | None => return Outcome::Closed,
                },
                line = conn.lines.recv() => match line {
                    None => return Outcome::Ended,
                    Some(raw) => match Frame::parse(&raw) {
                        Frame::Control(_) | Frame::Empty => {}
                        Frame::Unparseable(s) => {
                            debug!(target: "tbx.channel", frame = %s, "discarding unparseable frame");
                        }
                        Frame::Json(value) => match self.decode(value) {
                            Decoded::Response(resp) => return Outcome::Response(resp),
                            Decoded::NotAResponse => {}
                            Decoded::Failed(e) => return Outcome::Envelope(e),
                        },
                    },
                },
            }
        }
    }

    fn attrs(&self, seq: u64) -> RouteAttrs {
        RouteAttrs::request(
            &self.config.user_id,
            &self.config.project_id,
            self.config.session_id.clone().unwrap_or_default(),
            seq,
        )
    }

    fn encode(&self, request: &ToolRequest, seq: u64) -> Result<String, ChannelError> {
        let value =
            serde_json::to_value(request).map_err(|e| ChannelError::Envelope(e.to_string()))?;
        match &self.config.key {
            None => Ok(frame::to_line(&value)),
            Some(key) => {
                let envelope = tbx_envelope::seal_json(&value, key, &self.attrs(seq))
                    .map_err(|e| ChannelError::Envelope(e.to_string()))?;
                let env_value = serde_json::to_value(&envelope)
                    .map_err(|e| ChannelError::Envelope(e.to_string()))?;
                Ok(frame::to_line(&env_value))
            }
        }
    }

    fn decode(&self, value: serde_json::Value) -> Decoded {
        match &self.config.key {
            None => match serde_json::from_value::<ToolResponse>(value) {
                Ok(resp) if resp.result.is_some() || resp.error.is_some() => {
                    Decoded::Response(resp)
                }
                // An object with neither result nor error (or a different
                // shape entirely) is server chatter, not a response.
                _ => Decoded::NotAResponse,
            },
            Some(key) => {
                let Ok(envelope) = serde_json::from_value::<tbx_envelope::Envelope>(value) else {
                    return Decoded::NotAResponse;
                };
                match tbx_envelope::open_json(&envelope, key, &self.attrs(self.seq).reply()) {
                    Ok(plain) => match serde_json::from_value::<ToolResponse>(plain) {
                        Ok(resp) => Decoded::Response(resp),
                        Err(e) => Decoded::Failed(ChannelError::Envelope(e.to_string())),
                    },
                    Err(e) => Decoded::Failed(ChannelError::Envelope(e.to_string())),
                }
            }
        }
    }

    /// Sleep for `delay` while still accepting sends. Returns false when
    /// the client closed.
    async fn sleep_accepting(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                msg = self.rx.recv() => match msg {
                    Some(Msg::Send(p)) => self.queue.push_back(p),
                    Some(Msg::Close) | None => return false,
                },
            }
        }
    }

    fn reject_all(&mut self, error: &ChannelError) {
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }
}

enum Decoded {
    Response(ToolResponse),
    NotAResponse,
    Failed(ChannelError),
}

struct Conn {
    body_tx: mpsc::Sender<Result<Vec<u8>, std::io::Error>>,
    lines: mpsc::Receiver<String>,
    reader: tokio::task::JoinHandle<()>,
}

impl Conn {
    async fn open(http: &reqwest::Client, config: &DuplexConfig) -> Result<Self, ChannelError> {
        let (body_tx, body_rx) = mpsc::channel::<Result<Vec<u8>, std::io::Error>>(64);
        // Write the initial newline before the exchange even starts, so
        // middleboxes never see a byte-less idle body.
        body_tx
            .try_send(Ok(b"\n".to_vec()))
            .map_err(|_| ChannelError::ConnectFailed("body channel refused".into()))?;

        let url = format!("{}{STREAM_PATH}", config.base_url.trim_end_matches('/'));
        let mut req = http
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .header("accept", "application/x-ndjson")
            .header("x-user-id", &config.user_id)
            .header("x-project-id", &config.project_id)
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)));
        if let Some(workspace) = &config.workspace_id {
            req = req.header("x-workspace-id", workspace);
        }
        if let Some(session) = &config.session_id {
            req = req.header("x-session-id", session);
        }
        if let Some(token) = &config.gcs_token {
            req = req.header("x-gcs-token", token);
        }
        if let Some(token) = &config.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ChannelError::ConnectFailed(format!(
                "stream endpoint returned {}",
                resp.status()
            )));
        }

        let (lines_tx, lines) = mpsc::channel(64);
        let reader = tokio::spawn(read_lines(resp, lines_tx));

        Ok(Self {
            body_tx,
            lines,
            reader,
        })
    }

    async fn write(&self, line: String) -> Result<(), String> {
        self.body_tx
            .send(Ok(line.into_bytes()))
            .await
            .map_err(|_| "request body closed".to_string())
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_lines(resp: reqwest::Response, lines_tx: mpsc::Sender<String>) {
    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                buf.extend_from_slice(&bytes);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                    if lines_tx.send(text).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!(target: "tbx.channel", error = %e, "response stream error");
                break;
            }
        }
    }
    // Dropping the sender surfaces StreamEnded to the dispatcher.
}
