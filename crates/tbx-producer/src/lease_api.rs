// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP client for the supervisor's lease API.

use serde_json::json;
use tbx_core::ConsumerLock;

/// Errors talking to the lease API.
#[derive(Debug, thiserror::Error)]
pub enum LeaseApiError {
    /// The supervisor answered with an unexpected status.
    #[error("lease API returned {status} for {context}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// What was being attempted.
        context: String,
    },

    /// Network-level failure.
    #[error("lease API request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// What an acquire attempt came back as.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseAnswer {
    /// Acquired fresh or refreshed; the producer keeps serving.
    Held,
    /// A different consumer holds the lease; the producer must surrender.
    Conflict {
        /// The current holder, when reported.
        holder: Option<ConsumerLock>,
    },
    /// The project is gone.
    NotFound,
}

/// Client for `POST /projects/{id}/consumer-lock/{acquire,release}`.
#[derive(Debug, Clone)]
pub struct LeaseApiClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    project_id: String,
}

impl LeaseApiClient {
    /// Create a client against the supervisor base URL.
    pub fn new(
        base_url: impl Into<String>,
        user_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            project_id: project_id.into(),
        }
    }

    /// Acquire or refresh the lease for `consumer_id`.
    pub async fn acquire(
        &self,
        consumer_id: &str,
        lease_ms: u64,
    ) -> Result<LeaseAnswer, LeaseApiError> {
        let url = format!(
            "{}/projects/{}/consumer-lock/acquire",
            self.base_url, self.project_id
        );
        let resp = self
            .http
            .post(&url)
            .header("x-user-id", &self.user_id)
            .json(&json!({"consumerId": consumer_id, "leaseMs": lease_ms}))
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => Ok(LeaseAnswer::Held),
            409 => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                let holder = body
                    .get("holder")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok());
                Ok(LeaseAnswer::Conflict { holder })
            }
            404 => Ok(LeaseAnswer::NotFound),
            status => Err(LeaseApiError::Http {
                status,
                context: "acquire".into(),
            }),
        }
    }

    /// Release the lease held by `consumer_id`. Best-effort; conflicts and
    /// absence are not errors at shutdown.
    pub async fn release(&self, consumer_id: &str) -> Result<(), LeaseApiError> {
        let url = format!(
            "{}/projects/{}/consumer-lock/release",
            self.base_url, self.project_id
        );
        let resp = self
            .http
            .post(&url)
            .header("x-user-id", &self.user_id)
            .json(&json!({"consumerId": consumer_id}))
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 404 | 409 => Ok(()),
            status => Err(LeaseApiError::Http {
                status,
                context: "release".into(),
            }),
        }
    }
}
