// SPDX-License-Identifier: MIT OR Apache-2.0
//! The pub/sub exchange fabric.
//!
//! Requests and responses share one topic; two attribute-filtered
//! subscriptions split them by `channel`. Message data is always a sealed
//! envelope, and the AAD is rebuilt from the message attributes, so a
//! message replayed with altered routing fails authentication.

use crate::{ChannelError, ToolChannel};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tbx_core::{ChannelSide, ENVELOPE_SCHEME, RouteAttrs, ToolRequest, ToolResponse};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Flow-control ceiling on a single pull.
pub const MAX_PULL_MESSAGES: usize = 16;

/// Minimum subscription expiration TTL in seconds (one day).
pub const SUBSCRIPTION_TTL_SECS: u64 = 86_400;

/// Delay between empty pulls (the REST surface may return immediately).
const EMPTY_PULL_DELAY: Duration = Duration::from_millis(200);

/// Build the executor-side request subscription filter.
#[must_use]
pub fn request_filter(user_id: &str, project_id: &str, session_id: Option<&str>) -> String {
    side_filter(user_id, project_id, session_id, ChannelSide::Req)
}

/// Build the producer-side response subscription filter.
#[must_use]
pub fn response_filter(user_id: &str, project_id: &str, session_id: Option<&str>) -> String {
    side_filter(user_id, project_id, session_id, ChannelSide::Resp)
}

fn side_filter(
    user_id: &str,
    project_id: &str,
    session_id: Option<&str>,
    side: ChannelSide,
) -> String {
    let mut filter = format!(
        "attributes.user_id = \"{user_id}\" AND attributes.project_id = \"{project_id}\""
    );
    if let Some(session) = session_id {
        filter.push_str(&format!(" AND attributes.session_id = \"{session}\""));
    }
    filter.push_str(&format!(" AND attributes.channel = \"{}\"", side.as_str()));
    filter
}

/// One pulled message, data already base64-decoded.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Opaque ack handle.
    pub ack_id: String,
    /// Decoded payload bytes.
    pub data: Vec<u8>,
    /// Message attributes.
    pub attributes: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct PullResponse {
    #[serde(default, rename = "receivedMessages")]
    received: Vec<WireReceived>,
}

#[derive(Deserialize)]
struct WireReceived {
    #[serde(rename = "ackId")]
    ack_id: String,
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(rename = "messageIds")]
    message_ids: Vec<String>,
}

/// Client for the pub/sub REST surface.
///
/// Topic and subscription arguments are full resource names
/// (`projects/<p>/topics/<t>`, `projects/<p>/subscriptions/<s>`).
#[derive(Debug, Clone)]
pub struct PubSubClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl PubSubClient {
    /// Create a client against `base_url` (production or emulator).
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    /// Publish one message; returns the server-assigned message id.
    pub async fn publish(
        &self,
        topic: &str,
        data: &[u8],
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, ChannelError> {
        let url = format!("{}/v1/{topic}:publish", self.base_url);
        let body = json!({
            "messages": [{"data": B64.encode(data), "attributes": attributes}]
        });
        let resp: PublishResponse = self
            .post_json(&url, &body, &format!("publish to {topic}"))
            .await?
            .json()
            .await?;
        resp.message_ids
            .into_iter()
            .next()
            .ok_or_else(|| ChannelError::Transport("publish returned no message id".into()))
    }

    /// Pull up to `max` messages (clamped to [`MAX_PULL_MESSAGES`]).
    pub async fn pull(
        &self,
        subscription: &str,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, ChannelError> {
        let url = format!("{}/v1/{subscription}:pull", self.base_url);
        let body = json!({"maxMessages": max.min(MAX_PULL_MESSAGES)});
        let resp: PullResponse = self
            .post_json(&url, &body, &format!("pull from {subscription}"))
            .await?
            .json()
            .await?;

        let mut messages = Vec::with_capacity(resp.received.len());
        for wire in resp.received {
            let data = B64
                .decode(&wire.message.data)
                .map_err(|e| ChannelError::Transport(format!("message data not base64: {e}")))?;
            messages.push(ReceivedMessage {
                ack_id: wire.ack_id,
                data,
                attributes: wire.message.attributes,
            });
        }
        Ok(messages)
    }

    /// Acknowledge processed messages.
    pub async fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: &[String],
    ) -> Result<(), ChannelError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/v1/{subscription}:acknowledge", self.base_url);
        self.post_json(&url, &json!({"ackIds": ack_ids}), "acknowledge")
            .await?;
        Ok(())
    }

    /// Negative-acknowledge: zero the ack deadline so the store redelivers.
    pub async fn nack(&self, subscription: &str, ack_ids: &[String]) -> Result<(), ChannelError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/v1/{subscription}:modifyAckDeadline", self.base_url);
        self.post_json(
            &url,
            &json!({"ackIds": ack_ids, "ackDeadlineSeconds": 0}),
            "nack",
        )
        .await?;
        Ok(())
    }

    /// Create a filtered subscription bound to `topic`.
    ///
    /// Already-exists answers are tolerated so supervisor restarts are
    /// idempotent.
    pub async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        filter: &str,
        ttl_secs: u64,
    ) -> Result<(), ChannelError> {
        let url = format!("{}/v1/{subscription}", self.base_url);
        let body = json!({
            "topic": topic,
            "filter": filter,
            "expirationPolicy": {"ttl": format!("{}s", ttl_secs.max(SUBSCRIPTION_TTL_SECS))},
        });
        let mut req = self.http.put(&url).json(&body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        match resp.status().as_u16() {
            200 | 409 => Ok(()),
            status => Err(ChannelError::Http {
                status,
                context: format!("create subscription {subscription}"),
            }),
        }
    }

    /// Delete a subscription; absence is not an error.
    pub async fn delete_subscription(&self, subscription: &str) -> Result<(), ChannelError> {
        let url = format!("{}/v1/{subscription}", self.base_url);
        let mut req = self.http.delete(&url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        match resp.status().as_u16() {
            200 | 204 | 404 => Ok(()),
            status => Err(ChannelError::Http {
                status,
                context: format!("delete subscription {subscription}"),
            }),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        context: &str,
    ) -> Result<reqwest::Response, ChannelError> {
        let mut req = self.http.post(url).json(body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::Http {
                status: status.as_u16(),
                context: context.to_string(),
            });
        }
        Ok(resp)
    }
}

/// Producer-side requester over the pub/sub fabric.
///
/// `send` publishes a sealed request and polls the response subscription
/// for the matching `seq`. A mutex serializes callers, preserving the
/// one-in-flight, FIFO contract.
pub struct PubSubRequester {
    client: PubSubClient,
    topic: String,
    reply_subscription: String,
    key: [u8; 32],
    user_id: String,
    project_id: String,
    session_id: String,
    send_timeout: Duration,
    seq: AtomicU64,
    inflight: Mutex<()>,
}

impl PubSubRequester {
    /// Create a requester publishing to `topic` and pulling replies from
    /// `reply_subscription`.
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        client: PubSubClient,
        topic: impl Into<String>,
        reply_subscription: impl Into<String>,
        key: [u8; 32],
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        session_id: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            client,
            topic: topic.into(),
            reply_subscription: reply_subscription.into(),
            key,
            user_id: user_id.into(),
            project_id: project_id.into(),
            session_id: session_id.into(),
            send_timeout,
            seq: AtomicU64::new(0),
            inflight: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ToolChannel for PubSubRequester {
    async fn send(&self, request: ToolRequest) -> Result<ToolResponse, ChannelError> {
        let _guard = self.inflight.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let attrs = RouteAttrs::request(&self.user_id, &self.project_id, &self.session_id, seq);

        let value =
            serde_json::to_value(&request).map_err(|e| ChannelError::Envelope(e.to_string()))?;
        let envelope = tbx_envelope::seal_json(&value, &self.key, &attrs)
            .map_err(|e| ChannelError::Envelope(e.to_string()))?;
        let data =
            serde_json::to_vec(&envelope).map_err(|e| ChannelError::Envelope(e.to_string()))?;

        self.client
            .publish(&self.topic, &data, &attrs.to_attributes(ENVELOPE_SCHEME))
            .await?;
        debug!(target: "tbx.channel", seq, id = %request.id, "published request");

        let deadline = Instant::now() + self.send_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(ChannelError::SendTimeout);
            }

            let messages = self
                .client
                .pull(&self.reply_subscription, MAX_PULL_MESSAGES)
                .await?;
            if messages.is_empty() {
                tokio::time::sleep(EMPTY_PULL_DELAY).await;
                continue;
            }

            for message in messages {
                let Some(mattrs) = RouteAttrs::from_attributes(&message.attributes) else {
                    warn!(target: "tbx.channel", "reply without routing attributes; nacking");
                    self.client
                        .nack(&self.reply_subscription, &[message.ack_id])
                        .await?;
                    continue;
                };

                if mattrs.channel != ChannelSide::Resp || mattrs.seq > seq {
                    // Not ours (yet); leave it for redelivery.
                    self.client
                        .nack(&self.reply_subscription, &[message.ack_id])
                        .await?;
                    continue;
                }
                if mattrs.seq < seq {
                    // Stale duplicate of an already-resolved exchange.
                    self.client
                        .acknowledge(&self.reply_subscription, &[message.ack_id])
                        .await?;
                    continue;
                }

                // The AAD comes from the message's own attributes; altered
                // routing fails authentication.
                let opened = serde_json::from_slice::<tbx_envelope::Envelope>(&message.data)
                    .map_err(|e| e.to_string())
                    .and_then(|env| {
                        tbx_envelope::open_json(&env, &self.key, &mattrs)
                            .map_err(|e| e.to_string())
                    });
                match opened {
                    Ok(plain) => {
                        self.client
                            .acknowledge(&self.reply_subscription, &[message.ack_id])
                            .await?;
                        let resp = serde_json::from_value::<ToolResponse>(plain)
                            .map_err(|e| ChannelError::Envelope(e.to_string()))?;
                        return Ok(resp);
                    }
                    Err(detail) => {
                        self.client
                            .nack(&self.reply_subscription, &[message.ack_id])
                            .await?;
                        return Err(ChannelError::Envelope(detail));
                    }
                }
            }
        }
    }

    async fn close(&self) {}
}

/// Executor-side serve loop: pull sealed requests, run `handler`, publish
/// sealed replies with the request's `seq`.
///
/// Acks on processed messages (tool errors included); nacks on envelope or
/// publish failures. Returns `Ok(())` when no traffic arrives for
/// `idle_exit` — the caller is expected to exit.
pub async fn serve_requests<F, Fut>(
    client: &PubSubClient,
    subscription: &str,
    topic: &str,
    key: &[u8; 32],
    idle_exit: Duration,
    mut handler: F,
) -> Result<(), ChannelError>
where
    F: FnMut(ToolRequest) -> Fut,
    Fut: Future<Output = ToolResponse>,
{
    let mut last_traffic = Instant::now();

    loop {
        let messages = client.pull(subscription, MAX_PULL_MESSAGES).await?;
        if messages.is_empty() {
            if last_traffic.elapsed() >= idle_exit {
                debug!(target: "tbx.channel", "idle window elapsed; leaving serve loop");
                return Ok(());
            }
            tokio::time::sleep(EMPTY_PULL_DELAY).await;
            continue;
        }
        last_traffic = Instant::now();

        for message in messages {
            let Some(attrs) = RouteAttrs::from_attributes(&message.attributes) else {
                warn!(target: "tbx.channel", "request without routing attributes; nacking");
                client.nack(subscription, &[message.ack_id]).await?;
                continue;
            };

            let opened = serde_json::from_slice::<tbx_envelope::Envelope>(&message.data)
                .map_err(|e| e.to_string())
                .and_then(|env| {
                    tbx_envelope::open_json(&env, key, &attrs).map_err(|e| e.to_string())
                })
                .and_then(|plain| {
                    serde_json::from_value::<ToolRequest>(plain).map_err(|e| e.to_string())
                });

            let request = match opened {
                Ok(request) => request,
                Err(detail) => {
                    warn!(target: "tbx.channel", error = %detail, "request failed to open; nacking");
                    client.nack(subscription, &[message.ack_id]).await?;
                    continue;
                }
            };

            // One tool at a time: the handler is awaited inline.
            let response = handler(request).await;

            let reply_attrs = attrs.reply();
            let sealed = serde_json::to_value(&response)
                .map_err(|e| ChannelError::Envelope(e.to_string()))
                .and_then(|value| {
                    tbx_envelope::seal_json(&value, key, &reply_attrs)
                        .map_err(|e| ChannelError::Envelope(e.to_string()))
                })
                .and_then(|env| {
                    serde_json::to_vec(&env).map_err(|e| ChannelError::Envelope(e.to_string()))
                });

            match sealed {
                Ok(data) => {
                    if let Err(e) = client
                        .publish(topic, &data, &reply_attrs.to_attributes(ENVELOPE_SCHEME))
                        .await
                    {
                        warn!(target: "tbx.channel", error = %e, "reply publish failed; nacking request");
                        client.nack(subscription, &[message.ack_id]).await?;
                        return Err(e);
                    }
                    client.acknowledge(subscription, &[message.ack_id]).await?;
                }
                Err(e) => {
                    client.nack(subscription, &[message.ack_id]).await?;
                    return Err(e);
                }
            }
        }
    }
}
