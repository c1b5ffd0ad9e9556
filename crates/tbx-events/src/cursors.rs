// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reading and advancing the persisted project cursor.

use crate::EventsError;
use serde::Deserialize;
use serde_json::json;
use tbx_core::{Cursor, CursorTimestamp};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct CursorDoc {
    #[serde(default)]
    project: Option<Cursor>,
}

/// Client for the engine's cursor endpoints.
#[derive(Debug, Clone)]
pub struct CursorClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    project_id: String,
    auth_token: Option<String>,
}

impl CursorClient {
    /// Create a client against the workflow engine base URL.
    pub fn new(
        base_url: impl Into<String>,
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            project_id: project_id.into(),
            auth_token,
        }
    }

    /// Fetch the persisted project cursor, if any.
    pub async fn fetch(&self) -> Result<Option<Cursor>, EventsError> {
        let url = format!("{}/events/cursors", self.base_url);
        let mut req = self
            .http
            .get(&url)
            .query(&[("projectId", self.project_id.as_str())])
            .header("x-user-id", &self.user_id);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        match resp.status().as_u16() {
            200 => {
                let doc: CursorDoc = resp.json().await?;
                Ok(doc.project)
            }
            404 => Ok(None),
            status => Err(EventsError::Http {
                status,
                context: "fetch cursor".into(),
            }),
        }
    }

    /// Persist the cursor for a fully processed event.
    ///
    /// The write is advisory: a later crash may replay the event, so
    /// downstream consumers key idempotency on the event id.
    pub async fn store(
        &self,
        event_id: &str,
        timestamp: CursorTimestamp,
    ) -> Result<(), EventsError> {
        let url = format!("{}/events/cursors", self.base_url);
        let body = json!({
            "projectId": self.project_id,
            "eventId": event_id,
            "timestamp": timestamp,
            "target": "project",
        });
        let mut req = self
            .http
            .post(&url)
            .header("x-user-id", &self.user_id)
            .json(&body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(EventsError::Http {
                status: resp.status().as_u16(),
                context: format!("store cursor for {event_id}"),
            });
        }
        debug!(target: "tbx.pump", event_id, "cursor advanced");
        Ok(())
    }
}
