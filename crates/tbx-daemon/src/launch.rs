// SPDX-License-Identifier: MIT OR Apache-2.0
//! Launching producer/executor peers, locally or as cloud job executions.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Which half of the pair is being launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The event-pumping peer.
    Producer,
    /// The tool-running peer.
    Executor,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Producer => "producer",
            Self::Executor => "executor",
        })
    }
}

/// Errors from launching or stopping a peer.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The local process failed to spawn.
    #[error("failed to spawn {role}: {detail}")]
    Spawn {
        /// Which peer.
        role: String,
        /// OS-level detail.
        detail: String,
    },

    /// The cloud jobs API answered with an unexpected status.
    #[error("jobs API returned {status} for {context}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// What was being attempted.
        context: String,
    },

    /// Network-level failure.
    #[error("jobs API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The requested mode is not configured on this supervisor.
    #[error("launch mode unavailable: {0}")]
    Unavailable(String),
}

/// A launched peer: an opaque id for stop/poll plus a human detail
/// (pid or operation name) for the runtime record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    /// Launcher-scoped id.
    pub id: String,
    /// Pid or cloud operation name.
    pub detail: String,
}

/// Launch, stop, and liveness-poll peers.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Start a peer with the given environment overrides.
    async fn launch(
        &self,
        role: PeerRole,
        env: BTreeMap<String, String>,
    ) -> Result<Launched, LaunchError>;

    /// Stop a peer; returns whether anything was stopped.
    async fn stop(&self, id: &str) -> bool;

    /// Whether the peer has exited. Cloud executions report `false`; their
    /// lifecycle is watched by the platform, not this supervisor.
    async fn has_exited(&self, id: &str) -> bool;
}

/// Local launcher: peers are child processes sharing the workspace mount.
pub struct LocalLauncher {
    producer_cmd: String,
    executor_cmd: String,
    children: Mutex<HashMap<String, tokio::process::Child>>,
    counter: AtomicU64,
}

impl LocalLauncher {
    /// A launcher spawning `producer_cmd` / `executor_cmd`.
    ///
    /// Commands are whitespace-split: the first token is the program, the
    /// rest are leading arguments.
    pub fn new(producer_cmd: impl Into<String>, executor_cmd: impl Into<String>) -> Self {
        Self {
            producer_cmd: producer_cmd.into(),
            executor_cmd: executor_cmd.into(),
            children: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl JobLauncher for LocalLauncher {
    async fn launch(
        &self,
        role: PeerRole,
        env: BTreeMap<String, String>,
    ) -> Result<Launched, LaunchError> {
        let command = match role {
            PeerRole::Producer => &self.producer_cmd,
            PeerRole::Executor => &self.executor_cmd,
        };
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| LaunchError::Spawn {
            role: role.to_string(),
            detail: "empty command".into(),
        })?;

        let child = tokio::process::Command::new(program)
            .args(parts)
            .envs(&env)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                role: role.to_string(),
                detail: e.to_string(),
            })?;

        let pid = child.id().unwrap_or_default();
        let id = format!("{role}-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        info!(target: "tbx.daemon", %role, pid, "peer spawned");
        self.children.lock().await.insert(id.clone(), child);
        Ok(Launched {
            id,
            detail: pid.to_string(),
        })
    }

    async fn stop(&self, id: &str) -> bool {
        let mut children = self.children.lock().await;
        match children.remove(id) {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    warn!(target: "tbx.daemon", id, error = %e, "kill failed");
                }
                let _ = child.wait().await;
                true
            }
            None => false,
        }
    }

    async fn has_exited(&self, id: &str) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(id) {
            // An untracked id was stopped or never started; treat as gone.
            None => true,
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => {
                    children.remove(id);
                    true
                }
                Ok(None) => false,
                Err(_) => true,
            },
        }
    }
}

/// Cloud launcher: peers are managed job executions started over HTTP.
pub struct CloudLauncher {
    http: reqwest::Client,
    base_url: String,
    producer_job: String,
    executor_job: String,
    auth_token: Option<String>,
}

impl CloudLauncher {
    /// A launcher running `producer_job` / `executor_job` via the jobs API.
    pub fn new(
        base_url: impl Into<String>,
        producer_job: impl Into<String>,
        executor_job: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            producer_job: producer_job.into(),
            executor_job: executor_job.into(),
            auth_token,
        }
    }
}

#[async_trait]
impl JobLauncher for CloudLauncher {
    async fn launch(
        &self,
        role: PeerRole,
        env: BTreeMap<String, String>,
    ) -> Result<Launched, LaunchError> {
        let job = match role {
            PeerRole::Producer => &self.producer_job,
            PeerRole::Executor => &self.executor_job,
        };
        let url = format!("{}/v1/{job}:run", self.base_url);
        let env_list: Vec<serde_json::Value> = env
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        let body = json!({
            "overrides": {"containerOverrides": [{"env": env_list}]}
        });

        let mut req = self.http.post(&url).json(&body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(LaunchError::Http {
                status: resp.status().as_u16(),
                context: format!("run {job}"),
            });
        }
        let answer: serde_json::Value = resp.json().await?;
        let operation = answer
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        info!(target: "tbx.daemon", %role, operation, "cloud execution started");
        Ok(Launched {
            id: operation.clone(),
            detail: operation,
        })
    }

    async fn stop(&self, _id: &str) -> bool {
        // Cancelling a managed execution is platform glue, out of core;
        // `stop` records the request and releases the lease instead.
        false
    }

    async fn has_exited(&self, _id: &str) -> bool {
        false
    }
}
