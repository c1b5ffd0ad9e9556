// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-daemon
#![deny(unsafe_code)]

/// Peer launchers (local processes, cloud jobs).
pub mod launch;
/// Startup progress reporting.
pub mod progress;
/// Start/stop orchestration.
pub mod supervisor;

pub use supervisor::{StartOutcome, StartRequest, StopOutcome, Supervisor, SupervisorError};

use axum::extract::{Path as AxPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tbx_core::ConsumerType;
use tbx_lease::{AcquireOutcome, LeaseError, ReleaseOutcome};
use tracing::error;

/// Shared state behind the control plane.
pub struct AppState {
    /// The supervisor.
    pub supervisor: Supervisor,
}

/// Structured API error in the control plane's envelope.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to answer with.
    pub status: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// An error with the given status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<LeaseError> for ApiError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::ProjectNotFound { .. } => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            LeaseError::Store(_) => Self::internal(e.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Lease(inner) => inner.into(),
            SupervisorError::Key(_) => Self::bad_request(e.to_string()),
            other => {
                error!(target: "tbx.daemon", error = %other, "start/stop failed");
                Self::internal(other.to_string())
            }
        }
    }
}

/// Build the control-plane router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/producer/start", post(producer_start))
        .route("/producer/stop", post(producer_stop))
        .route(
            "/projects/{project_id}/consumer-lock/acquire",
            post(lock_acquire),
        )
        .route(
            "/projects/{project_id}/consumer-lock/release",
            post(lock_release),
        )
        .route(
            "/projects/{project_id}/consumer-lock/status",
            get(lock_status),
        )
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "role": "supervisor"}))
}

/// Pull the `userId`/`projectId` context headers.
fn context(headers: &HeaderMap) -> Result<(String, String), ApiError> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::bad_request(format!("missing {name} header")))
    };
    Ok((get("x-user-id")?, get("x-project-id")?))
}

async fn producer_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<StartRequest>>,
) -> Result<Response, ApiError> {
    let (user_id, project_id) = context(&headers)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    match state.supervisor.start(&user_id, &project_id, request).await? {
        StartOutcome::Launched(description) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"launched": true, "launch": description})),
        )
            .into_response()),
        StartOutcome::Conflict {
            holder,
            ms_remaining,
        } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "launched": false,
                "conflict": true,
                "holder": holder,
                "msRemaining": ms_remaining,
            })),
        )
            .into_response()),
    }
}

async fn producer_stop(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (user_id, project_id) = context(&headers)?;
    let outcome = state.supervisor.stop(&user_id, &project_id).await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct AcquireBody {
    #[serde(rename = "consumerId")]
    consumer_id: String,
    #[serde(default, rename = "leaseMs")]
    lease_ms: Option<u64>,
    #[serde(default, rename = "consumerType")]
    consumer_type: Option<ConsumerType>,
}

async fn lock_acquire(
    State(state): State<Arc<AppState>>,
    AxPath(project_id): AxPath<String>,
    headers: HeaderMap,
    Json(body): Json<AcquireBody>,
) -> Result<Response, ApiError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("missing x-user-id header"))?
        .to_string();

    let outcome = state
        .supervisor
        .lease()
        .acquire(
            &user_id,
            &project_id,
            &body.consumer_id,
            body.lease_ms,
            body.consumer_type.unwrap_or(ConsumerType::Local),
        )
        .await?;

    Ok(match outcome {
        AcquireOutcome::Acquired { lock } => {
            Json(json!({"acquired": true, "lock": lock})).into_response()
        }
        AcquireOutcome::Refreshed { lock } => {
            Json(json!({"refreshed": true, "lock": lock})).into_response()
        }
        AcquireOutcome::Conflict {
            holder,
            ms_remaining,
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "conflict": true,
                "holder": holder,
                "msRemaining": ms_remaining,
            })),
        )
            .into_response(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ReleaseBody {
    #[serde(default, rename = "consumerId")]
    consumer_id: Option<String>,
    #[serde(default)]
    force: Option<bool>,
}

async fn lock_release(
    State(state): State<Arc<AppState>>,
    AxPath(project_id): AxPath<String>,
    headers: HeaderMap,
    body: Option<Json<ReleaseBody>>,
) -> Result<Response, ApiError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("missing x-user-id header"))?
        .to_string();
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let outcome = state
        .supervisor
        .lease()
        .release(
            &user_id,
            &project_id,
            body.consumer_id.as_deref(),
            body.force.unwrap_or(false),
        )
        .await?;

    Ok(match outcome {
        ReleaseOutcome::Released => Json(json!({"released": true})).into_response(),
        ReleaseOutcome::NotHeld => Json(json!({"released": false})).into_response(),
        ReleaseOutcome::Conflict => {
            (StatusCode::CONFLICT, Json(json!({"conflict": true}))).into_response()
        }
    })
}

async fn lock_status(
    State(state): State<Arc<AppState>>,
    AxPath(project_id): AxPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("missing x-user-id header"))?
        .to_string();

    let status = state.supervisor.lease().status(&user_id, &project_id).await?;
    Ok(Json(status).into_response())
}
