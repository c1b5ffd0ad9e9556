// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-callback
#![deny(unsafe_code)]

use rand::Rng;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum delivery attempts per callback.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff slope per attempt, in milliseconds.
const BACKOFF_STEP_MS: u64 = 300;

/// Additive jitter ceiling per backoff, in milliseconds.
const BACKOFF_JITTER_MS: u64 = 200;

/// Errors from callback delivery.
///
/// Callers treat these as log-worthy, not fatal: a failed callback never
/// blocks cursor advance.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// The engine kept answering 5xx until attempts ran out.
    #[error("callback {callback_id} failed with status {status} after {attempts} attempts")]
    Upstream {
        /// Target callback.
        callback_id: String,
        /// Final status received.
        status: u16,
        /// Attempts made.
        attempts: u32,
    },

    /// The engine rejected both payload shapes with 400.
    #[error("callback {callback_id} rejected with 400 in both payload shapes")]
    Rejected {
        /// Target callback.
        callback_id: String,
    },

    /// Network-level failure on the final attempt.
    #[error("callback {callback_id} transport failure: {detail}")]
    Network {
        /// Target callback.
        callback_id: String,
        /// Final error detail.
        detail: String,
    },
}

/// Outcome of a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// HTTP status of the accepted POST.
    pub status: u16,
    /// Whether the `{ result: … }` fallback shape was the accepted one.
    pub wrapped: bool,
}

/// Client for `POST …/callbacks/{callback_id}`.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    project_id: String,
    auth_token: Option<String>,
}

impl CallbackClient {
    /// Create a client posting under `base_url`.
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

    /// Deliver `payload` to `callback_id`.
    ///
    /// Up to three attempts with `300·attempt + [0,200)` ms backoff. On the
    /// first 400 the payload is re-sent once, immediately, wrapped as
    /// `{ result: payload }`; any further 400 is final. Statuses below 500
    /// are final; 5xx and network errors burn an attempt and retry.
    pub async fn deliver(
        &self,
        callback_id: &str,
        payload: &Value,
    ) -> Result<Delivered, CallbackError> {
        let url = format!("{}/callbacks/{callback_id}", self.base_url);
        let mut last_failure = (0u16, String::new());

        for attempt in 1..=MAX_ATTEMPTS {
            match self.post(&url, payload).await {
                Ok(status) if status.is_success() => {
                    debug!(target: "tbx.callback", callback_id, attempt, status = status.as_u16(), "callback delivered");
                    return Ok(Delivered {
                        status: status.as_u16(),
                        wrapped: false,
                    });
                }
                Ok(status) if status.as_u16() == 400 => {
                    // Compatibility fallback: older engines expect the
                    // result wrapped. One immediate retry, then 400 is
                    // fatal for this delivery.
                    let wrapped = json!({"result": payload});
                    match self.post(&url, &wrapped).await {
                        Ok(status) if status.is_success() => {
                            debug!(target: "tbx.callback", callback_id, "callback delivered with wrapped payload");
                            return Ok(Delivered {
                                status: status.as_u16(),
                                wrapped: true,
                            });
                        }
                        Ok(_) | Err(_) => {
                            return Err(CallbackError::Rejected {
                                callback_id: callback_id.to_string(),
                            });
                        }
                    }
                }
                Ok(status) if status.as_u16() < 500 => {
                    return Err(CallbackError::Upstream {
                        callback_id: callback_id.to_string(),
                        status: status.as_u16(),
                        attempts: attempt,
                    });
                }
                Ok(status) => {
                    warn!(target: "tbx.callback", callback_id, attempt, status = status.as_u16(), "callback attempt failed");
                    last_failure = (status.as_u16(), status.to_string());
                }
                Err(e) => {
                    warn!(target: "tbx.callback", callback_id, attempt, error = %e, "callback attempt errored");
                    last_failure = (0, e.to_string());
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff_for(attempt)).await;
            }
        }

        if last_failure.0 >= 500 {
            Err(CallbackError::Upstream {
                callback_id: callback_id.to_string(),
                status: last_failure.0,
                attempts: MAX_ATTEMPTS,
            })
        } else {
            Err(CallbackError::Network {
                callback_id: callback_id.to_string(),
                detail: last_failure.1,
            })
        }
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<reqwest::StatusCode, reqwest::Error> {
        let mut req = self
            .http
            .post(url)
            .header("x-user-id", &self.user_id)
            .header("x-project-id", &self.project_id)
            .json(payload);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        Ok(req.send().await?.status())
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(BACKOFF_STEP_MS * u64::from(attempt) + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> CallbackClient {
        CallbackClient::new(server.uri(), "u1", "p1", Some("svc".into()))
    }

    #[tokio::test]
    async fn delivers_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb1"))
            .and(header("x-user-id", "u1"))
            .and(body_json(json!({"filepath": "a.txt", "bytes": 5})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let delivered = client(&server)
            .deliver("cb1", &json!({"filepath": "a.txt", "bytes": 5}))
            .await
            .unwrap();
        assert_eq!(delivered.status, 200);
        assert!(!delivered.wrapped);
    }

    #[tokio::test]
    async fn wraps_payload_once_after_400() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb1"))
            .and(body_json(json!({"result": {"bytes": 5}})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb1"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let delivered = client(&server)
            .deliver("cb1", &json!({"bytes": 5}))
            .await
            .unwrap();
        assert_eq!(delivered.status, 200);
        assert!(delivered.wrapped);
    }

    #[tokio::test]
    async fn second_400_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb1"))
            .respond_with(ResponseTemplate::new(400))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server).deliver("cb1", &json!({})).await.unwrap_err();
        assert!(matches!(err, CallbackError::Rejected { .. }));
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let delivered = client(&server).deliver("cb1", &json!({})).await.unwrap();
        assert_eq!(delivered.status, 200);
    }

    #[tokio::test]
    async fn exhausted_5xx_reports_upstream_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).deliver("cb1", &json!({})).await.unwrap_err();
        assert!(
            matches!(err, CallbackError::Upstream { status: 500, attempts: 3, .. })
        );
    }

    #[tokio::test]
    async fn non_retryable_4xx_is_final_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).deliver("cb1", &json!({})).await.unwrap_err();
        assert!(matches!(err, CallbackError::Upstream { status: 404, attempts: 1, .. }));
    }

    #[tokio::test]
    async fn delivery_is_idempotent_per_callback() {
        // At most one successful POST is observed even with a flaky first
        // attempt: the retry succeeds once and delivery stops.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb-once"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/callbacks/cb-once"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).deliver("cb-once", &json!({"n": 1})).await.unwrap();

        let successes = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/callbacks/cb-once")
            .count();
        assert_eq!(successes, 2); // one 502, one 200 — exactly one success
    }
}
