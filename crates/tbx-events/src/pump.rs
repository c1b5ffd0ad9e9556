// SPDX-License-Identifier: MIT OR Apache-2.0
//! The cursor-advancing event pump.
//!
//! Per event, strictly in order: normalize arguments, send on the channel,
//! deliver the callback, then write the cursor. A crash anywhere before the
//! cursor write replays the event on reconnect, which is why everything
//! downstream is idempotent on the event id.

use crate::cursors::CursorClient;
use crate::sse::SseParser;
use crate::EventsError;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tbx_callback::CallbackClient;
use tbx_channel::{Backoff, ToolChannel};
use tbx_core::{CursorTimestamp, ErrorDelivery, ToolRequest, ToolResponse, WorkflowEvent};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pump settings.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Workflow engine base URL.
    pub base_url: String,
    /// Owning user.
    pub user_id: String,
    /// Owning project.
    pub project_id: String,
    /// Optional workspace filter on the stream.
    pub workspace_id: Option<String>,
    /// Replay floor by event id when no cursor exists.
    pub since_id: Option<String>,
    /// Replay floor by event time when no cursor or id exists.
    pub since_time: Option<String>,
    /// Service identity bearer.
    pub auth_token: Option<String>,
    /// Initial reconnect backoff.
    pub reconnect_backoff: Duration,
    /// How tool-level errors are treated (spec'd default: advance).
    pub error_delivery: ErrorDelivery,
}

enum StreamOutcome {
    Ended,
    ShutdownRequested,
}

/// The producer's event pump.
pub struct EventPump {
    config: PumpConfig,
    channel: Arc<dyn ToolChannel>,
    callbacks: CallbackClient,
    cursors: CursorClient,
    http: reqwest::Client,
}

impl EventPump {
    /// Wire a pump over its collaborators.
    pub fn new(
        config: PumpConfig,
        channel: Arc<dyn ToolChannel>,
        callbacks: CallbackClient,
        cursors: CursorClient,
    ) -> Self {
        Self {
            config,
            channel,
            callbacks,
            cursors,
            http: reqwest::Client::new(),
        }
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Stream failures reconnect with backoff, resuming from the last
    /// committed event; they never bubble out of here.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (mut resume_id, mut resume_time) = self.initial_resume().await;
        let mut backoff = Backoff::new(self.config.reconnect_backoff);

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self
                .consume_stream(&mut resume_id, &mut resume_time, &mut shutdown)
                .await
            {
                Ok(StreamOutcome::ShutdownRequested) => return,
                Ok(StreamOutcome::Ended) => {
                    backoff.reset();
                    debug!(target: "tbx.pump", "event stream ended; reconnecting");
                }
                Err(e) => {
                    warn!(target: "tbx.pump", error = %e, "event stream failed; reconnecting");
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn initial_resume(&self) -> (Option<String>, Option<String>) {
        match self.cursors.fetch().await {
            Ok(Some(cursor)) => {
                info!(
                    target: "tbx.pump",
                    event_id = cursor.event_id.as_deref().unwrap_or(""),
                    "resuming from persisted cursor"
                );
                let time = cursor.timestamp.map(|t| t.0.to_rfc3339());
                (cursor.event_id, time)
            }
            Ok(None) => (
                self.config.since_id.clone(),
                self.config.since_time.clone(),
            ),
            Err(e) => {
                warn!(target: "tbx.pump", error = %e, "cursor fetch failed; using configured replay floor");
                (
                    self.config.since_id.clone(),
                    self.config.since_time.clone(),
                )
            }
        }
    }

    async fn consume_stream(
        &self,
        resume_id: &mut Option<String>,
        resume_time: &mut Option<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamOutcome, EventsError> {
        let url = format!("{}/events/stream", self.config.base_url.trim_end_matches('/'));
        let mut query: Vec<(&str, String)> =
            vec![("projectId", self.config.project_id.clone())];
        if let Some(workspace) = &self.config.workspace_id {
            query.push(("workspaceId", workspace.clone()));
        }
        if let Some(id) = resume_id {
            query.push(("since_id", id.clone()));
        } else if let Some(time) = resume_time {
            query.push(("since_time", time.clone()));
        }

        let mut req = self
            .http
            .get(&url)
            .query(&query)
            .header("accept", "text/event-stream")
            .header("x-user-id", &self.config.user_id);
        if let Some(token) = &self.config.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(EventsError::Http {
                status: resp.status().as_u16(),
                context: "open event stream".into(),
            });
        }
        debug!(target: "tbx.pump", "event stream open");

        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::new();
        let mut last_event_id: Option<String> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(StreamOutcome::ShutdownRequested);
                    }
                }
                chunk = stream.next() => match chunk {
                    None => return Ok(StreamOutcome::Ended),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(bytes)) => {
                        for frame in parser.feed(&bytes) {
                            if let Some(id) = &frame.id {
                                last_event_id = Some(id.clone());
                            }
                            if frame.data.is_empty() {
                                continue;
                            }
                            let event: WorkflowEvent = match serde_json::from_str(&frame.data) {
                                Ok(event) => event,
                                Err(e) => {
                                    warn!(target: "tbx.pump", error = %e, "discarding unparseable event");
                                    continue;
                                }
                            };
                            if event.tool_call.is_none() {
                                continue;
                            }
                            self.process(&event, last_event_id.as_deref(), resume_id, resume_time)
                                .await?;
                        }
                    }
                },
            }
        }
    }

    async fn process(
        &self,
        event: &WorkflowEvent,
        last_event_id: Option<&str>,
        resume_id: &mut Option<String>,
        resume_time: &mut Option<String>,
    ) -> Result<(), EventsError> {
        let event_id = event
            .id
            .clone()
            .or_else(|| last_event_id.map(String::from));
        let request_id = event_id
            .clone()
            .unwrap_or_else(|| format!("evt-{}", Utc::now().timestamp_millis()));

        let tool_call = event
            .tool_call
            .as_ref()
            .expect("caller checked tool_call")
            .normalized();
        let request = ToolRequest {
            id: request_id,
            tool_call,
        };

        // A channel failure propagates: the cursor stays put and the event
        // replays after reconnect.
        let response = self.channel.send(request).await?;

        if response.is_error() && self.config.error_delivery == ErrorDelivery::Reject {
            warn!(
                target: "tbx.pump",
                event_id = event_id.as_deref().unwrap_or(""),
                error = response.error.as_deref().unwrap_or(""),
                "tool error treated as rejection; callback skipped, cursor held"
            );
            return Ok(());
        }

        if let Some(callback_id) = &event.callback_id {
            let payload = callback_payload(&response);
            if let Err(e) = self.callbacks.deliver(callback_id, &payload).await {
                // Logged, never blocks the cursor.
                warn!(target: "tbx.pump", callback_id, error = %e, "callback delivery failed");
            }
        }

        if let Some(id) = &event_id {
            let timestamp = event
                .create_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| CursorTimestamp(t.with_timezone(&Utc)))
                .unwrap_or_else(CursorTimestamp::now);
            if let Err(e) = self.cursors.store(id, timestamp).await {
                // Advisory write: failure means replay, which is safe.
                warn!(target: "tbx.pump", event_id = %id, error = %e, "cursor write failed");
            }
            *resume_id = Some(id.clone());
            resume_time.clone_from(&event.create_time);
        }

        Ok(())
    }
}

/// The callback body for a response: the bare result on success, the
/// value-shaped error otherwise.
fn callback_payload(response: &ToolResponse) -> Value {
    match (&response.result, &response.error) {
        (Some(result), _) => result.clone(),
        (None, Some(error)) => json!({"result": null, "error": error}),
        (None, None) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_payload_shapes() {
        let ok = ToolResponse::ok("e", json!({"bytes": 5}));
        assert_eq!(callback_payload(&ok), json!({"bytes": 5}));

        let failed = ToolResponse::failed("e", "boom");
        assert_eq!(
            callback_payload(&failed),
            json!({"result": null, "error": "boom"})
        );

        let noop = ToolResponse::no_op("e");
        assert_eq!(callback_payload(&noop), Value::Null);
    }
}
