// SPDX-License-Identifier: MIT OR Apache-2.0
//! Start/stop orchestration for a producer/executor pair.

use crate::launch::{CloudLauncher, JobLauncher, LaunchError, Launched, LocalLauncher, PeerRole};
use crate::progress::ProgressReporter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tbx_channel::pubsub::{PubSubClient, SUBSCRIPTION_TTL_SECS, request_filter, response_filter};
use tbx_config::{DaemonConfig, ProjectContext, expand_template};
use tbx_core::{ConsumerLock, ConsumerType, clamp_lease_ms};
use tbx_lease::{AcquireOutcome, LeaseManager, MemoryStore, ReleaseOutcome};
use tbx_workspace::sanitize_segment;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Body of `POST /producer/start`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    /// Workspace scope.
    #[serde(default, rename = "workspaceId")]
    pub workspace_id: Option<String>,
    /// Session scope.
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
    /// Replay floor by event id.
    #[serde(default)]
    pub since_id: Option<String>,
    /// Replay floor by event time.
    #[serde(default)]
    pub since_time: Option<String>,
    /// Requested lease duration.
    #[serde(default, rename = "leaseMs")]
    pub lease_ms: Option<u64>,
    /// Force local or cloud launch; defaults to local unless cloud is the
    /// only configured mode.
    #[serde(default, rename = "localMode")]
    pub local_mode: Option<bool>,
    /// Caller-supplied envelope key (base64, 32 bytes).
    #[serde(default, rename = "ENC_KEY_B64")]
    pub enc_key_b64: Option<String>,
    /// Envelope scheme pin passed through to the pair.
    #[serde(default, rename = "ENC_VER")]
    pub enc_ver: Option<String>,
}

/// Successful launch description, returned with 202.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchDescription {
    /// `local` or `cloud`.
    pub mode: String,
    /// Minted lease holder id.
    pub consumer_id: String,
    /// First 8 hex chars of the key's SHA-256.
    pub key_fingerprint: String,
    /// Absolute work root.
    pub work_root: String,
    /// Producer pid or operation name.
    pub producer: String,
    /// Executor pid or operation name.
    pub executor: String,
    /// Request subscription, pub/sub mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_subscription: Option<String>,
    /// Response subscription, pub/sub mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_subscription: Option<String>,
}

/// Outcome of a start request.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The pair is launching.
    Launched(Box<LaunchDescription>),
    /// Another consumer already serves the project.
    Conflict {
        /// The current holder.
        holder: ConsumerLock,
        /// Lease milliseconds remaining.
        ms_remaining: u64,
    },
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    /// Launch mode read from the runtime record, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Whether a lease was released.
    pub released: bool,
}

/// Errors from start/stop orchestration.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Lease operations failed.
    #[error(transparent)]
    Lease(#[from] tbx_lease::LeaseError),

    /// Workspace could not be prepared.
    #[error(transparent)]
    Workspace(#[from] tbx_workspace::WorkspaceError),

    /// Subscription setup failed.
    #[error("subscription setup failed: {0}")]
    Subscription(tbx_channel::ChannelError),

    /// Peer launch failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The supplied encryption key was unusable.
    #[error("invalid encryption key: {0}")]
    Key(String),
}

/// The supervisor: owns launchers, the lease manager, the subscription
/// admin client, and the per-project exit monitors. Passed explicitly —
/// no process-wide singletons.
pub struct Supervisor {
    config: DaemonConfig,
    lease: LeaseManager,
    store: Arc<MemoryStore>,
    pubsub: Option<PubSubClient>,
    local: Arc<LocalLauncher>,
    cloud: Option<Arc<CloudLauncher>>,
    monitors: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    /// Build a supervisor from configuration.
    pub fn new(config: DaemonConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let lease = LeaseManager::new(store.clone());
        let pubsub = config
            .topic
            .as_ref()
            .map(|_| PubSubClient::new(&config.pubsub_base_url, None));
        let local = Arc::new(LocalLauncher::new(
            &config.producer_cmd,
            &config.executor_cmd,
        ));
        let cloud = match (
            &config.cloud_jobs_base_url,
            &config.cloud_producer_job,
            &config.cloud_executor_job,
        ) {
            (Some(base), Some(producer), Some(executor)) => Some(Arc::new(CloudLauncher::new(
                base, producer, executor, None,
            ))),
            _ => None,
        };
        Self {
            config,
            lease,
            store,
            pubsub,
            local,
            cloud,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// The lease manager (shared with the lease API handlers).
    #[must_use]
    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    /// Launch the pair for a project.
    pub async fn start(
        &self,
        user_id: &str,
        project_id: &str,
        request: StartRequest,
    ) -> Result<StartOutcome, SupervisorError> {
        self.store.ensure_project(user_id, project_id).await;
        let reporter = ProgressReporter::new(
            self.lease.store().clone(),
            user_id,
            project_id,
        );

        reporter.push("resolving workspace").await;
        let context = ProjectContext {
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            workspace_id: request.workspace_id.clone(),
            session_id: request.session_id.clone(),
        };
        let work_root = tbx_workspace::ensure_templated_root(
            std::path::Path::new(&self.config.work_root_base),
            &expand_template(&self.config.work_prefix_template, &context),
        )?;

        reporter.push("deriving key").await;
        let key_b64 = request
            .enc_key_b64
            .clone()
            .unwrap_or_else(tbx_envelope::generate_key_b64);
        let key =
            tbx_envelope::decode_key_b64(&key_b64).map_err(|e| SupervisorError::Key(e.to_string()))?;
        let key_fingerprint = fingerprint(&key);

        let consumer_id = format!("c-{}", Uuid::new_v4().simple());
        let local_mode = request.local_mode.unwrap_or(self.cloud.is_none());
        let consumer_type = if local_mode {
            ConsumerType::Local
        } else {
            ConsumerType::Cloud
        };
        let lease_ms = clamp_lease_ms(request.lease_ms.or(Some(self.config.lock_lease_ms)));

        reporter.push("acquiring lease").await;
        match self
            .lease
            .acquire(user_id, project_id, &consumer_id, Some(lease_ms), consumer_type)
            .await?
        {
            AcquireOutcome::Conflict {
                holder,
                ms_remaining,
            } => {
                reporter.clear().await;
                return Ok(StartOutcome::Conflict {
                    holder,
                    ms_remaining,
                });
            }
            AcquireOutcome::Acquired { .. } | AcquireOutcome::Refreshed { .. } => {}
        }

        let subscriptions = match self.create_subscriptions(&context).await {
            Ok(subs) => subs,
            Err(e) => {
                self.rollback(user_id, project_id, None).await;
                return Err(e);
            }
        };

        let producer_env = self.producer_env(
            &context,
            &request,
            &key_b64,
            &consumer_id,
            lease_ms,
            subscriptions.as_ref(),
        );
        let executor_env =
            self.executor_env(&context, &request, &key_b64, subscriptions.as_ref());

        let launcher: Arc<dyn JobLauncher> = if local_mode {
            Arc::clone(&self.local) as Arc<dyn JobLauncher>
        } else {
            match &self.cloud {
                Some(cloud) => Arc::clone(cloud) as Arc<dyn JobLauncher>,
                None => {
                    self.rollback(user_id, project_id, subscriptions.as_ref()).await;
                    return Err(LaunchError::Unavailable(
                        "cloud mode requested but no jobs API configured".into(),
                    )
                    .into());
                }
            }
        };

        // Executor first, so it is listening before the producer connects.
        reporter.push("launching executor").await;
        let executor = match launcher.launch(PeerRole::Executor, executor_env).await {
            Ok(launched) => launched,
            Err(e) => {
                self.rollback(user_id, project_id, subscriptions.as_ref()).await;
                return Err(e.into());
            }
        };
        reporter.push("launching producer").await;
        let producer = match launcher.launch(PeerRole::Producer, producer_env).await {
            Ok(launched) => launched,
            Err(e) => {
                launcher.stop(&executor.id).await;
                self.rollback(user_id, project_id, subscriptions.as_ref()).await;
                return Err(e.into());
            }
        };

        let mode = if local_mode { "local" } else { "cloud" };
        let runtime = json!({
            "mode": mode,
            "producerId": producer.id,
            "executorId": executor.id,
            "producer": producer.detail,
            "executor": executor.detail,
            "reqSubscription": subscriptions.as_ref().map(|s| s.0.clone()),
            "respSubscription": subscriptions.as_ref().map(|s| s.1.clone()),
            "keyFingerprint": key_fingerprint,
            "topic": self.config.topic,
            "workspaceId": context.workspace_id,
            "sessionId": context.session_id,
            "workRoot": work_root.display().to_string(),
            "stopRequested": false,
        });
        self.lease
            .set_runtime_info(user_id, project_id, &consumer_id, runtime)
            .await?;

        if local_mode {
            self.spawn_exit_monitor(
                user_id,
                project_id,
                producer.clone(),
                executor.clone(),
                subscriptions.clone(),
            )
            .await;
        }

        reporter.clear().await;
        info!(target: "tbx.daemon", user_id, project_id, mode, consumer_id, "pair launched");
        Ok(StartOutcome::Launched(Box::new(LaunchDescription {
            mode: mode.to_string(),
            consumer_id,
            key_fingerprint: fingerprint(&key),
            work_root: work_root.display().to_string(),
            producer: producer.detail,
            executor: executor.detail,
            req_subscription: subscriptions.as_ref().map(|s| s.0.clone()),
            resp_subscription: subscriptions.map(|s| s.1),
        })))
    }

    /// Stop the pair and release the lease.
    pub async fn stop(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<StopOutcome, SupervisorError> {
        if let Some(monitor) = self
            .monitors
            .lock()
            .await
            .remove(&monitor_key(user_id, project_id))
        {
            monitor.abort();
        }

        let status = self.lease.status(user_id, project_id).await?;
        let runtime = status
            .holder
            .as_ref()
            .and_then(|holder| holder.runtime.clone())
            .unwrap_or_default();
        let mode = runtime
            .get("mode")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.delete_runtime_subscriptions(&runtime).await;

        match mode.as_deref() {
            Some("local") | None => {
                // Producer first, then executor.
                for id_field in ["producerId", "executorId"] {
                    if let Some(id) = runtime.get(id_field).and_then(|v| v.as_str()) {
                        self.local.stop(id).await;
                    }
                }
            }
            Some(_) => {
                // Cloud: record the request; execution teardown is platform
                // glue outside the core.
                if let Some(holder) = &status.holder {
                    let _ = self
                        .lease
                        .set_runtime_info(
                            user_id,
                            project_id,
                            &holder.consumer_id,
                            json!({"stopRequested": true}),
                        )
                        .await;
                }
            }
        }

        let released = matches!(
            self.lease.release(user_id, project_id, None, true).await?,
            ReleaseOutcome::Released
        );
        info!(target: "tbx.daemon", user_id, project_id, released, "pair stopped");
        Ok(StopOutcome { mode, released })
    }

    async fn create_subscriptions(
        &self,
        context: &ProjectContext,
    ) -> Result<Option<(String, String)>, SupervisorError> {
        let (Some(pubsub), Some(topic)) = (&self.pubsub, &self.config.topic) else {
            return Ok(None);
        };

        let (req_sub, resp_sub) = subscription_names(
            topic,
            &context.user_id,
            &context.project_id,
            context.session_id.as_deref(),
        );
        let session = context.session_id.as_deref();
        pubsub
            .create_subscription(
                &req_sub,
                topic,
                &request_filter(&context.user_id, &context.project_id, session),
                SUBSCRIPTION_TTL_SECS,
            )
            .await
            .map_err(SupervisorError::Subscription)?;
        pubsub
            .create_subscription(
                &resp_sub,
                topic,
                &response_filter(&context.user_id, &context.project_id, session),
                SUBSCRIPTION_TTL_SECS,
            )
            .await
            .map_err(SupervisorError::Subscription)?;
        Ok(Some((req_sub, resp_sub)))
    }

    async fn delete_runtime_subscriptions(&self, runtime: &serde_json::Value) {
        let Some(pubsub) = &self.pubsub else { return };
        for field in ["reqSubscription", "respSubscription"] {
            if let Some(name) = runtime.get(field).and_then(|v| v.as_str()) {
                if let Err(e) = pubsub.delete_subscription(name).await {
                    warn!(target: "tbx.daemon", subscription = name, error = %e, "subscription delete failed");
                }
            }
        }
    }

    async fn rollback(
        &self,
        user_id: &str,
        project_id: &str,
        subscriptions: Option<&(String, String)>,
    ) {
        if let (Some(pubsub), Some((req_sub, resp_sub))) = (&self.pubsub, subscriptions) {
            let _ = pubsub.delete_subscription(req_sub).await;
            let _ = pubsub.delete_subscription(resp_sub).await;
        }
        if let Err(e) = self.lease.release(user_id, project_id, None, true).await {
            warn!(target: "tbx.daemon", error = %e, "rollback lease release failed");
        }
    }

    /// Watch both peers; when either exits, stop the other and release the
    /// lease. Symmetric in both directions.
    async fn spawn_exit_monitor(
        &self,
        user_id: &str,
        project_id: &str,
        producer: Launched,
        executor: Launched,
        subscriptions: Option<(String, String)>,
    ) {
        let key = monitor_key(user_id, project_id);
        let local = Arc::clone(&self.local);
        let lease = self.lease.clone();
        let pubsub = self.pubsub.clone();
        let user_id = user_id.to_string();
        let project_id = project_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let producer_gone = local.has_exited(&producer.id).await;
                let executor_gone = local.has_exited(&executor.id).await;
                if !(producer_gone || executor_gone) {
                    continue;
                }

                info!(
                    target: "tbx.daemon",
                    user_id, project_id, producer_gone, executor_gone,
                    "peer exited; stopping the other and releasing the lease"
                );
                if !producer_gone {
                    local.stop(&producer.id).await;
                }
                if !executor_gone {
                    local.stop(&executor.id).await;
                }
                if let (Some(pubsub), Some((req_sub, resp_sub))) = (&pubsub, &subscriptions) {
                    let _ = pubsub.delete_subscription(req_sub).await;
                    let _ = pubsub.delete_subscription(resp_sub).await;
                }
                if let Err(e) = lease.release(&user_id, &project_id, None, true).await {
                    warn!(target: "tbx.daemon", error = %e, "monitor lease release failed");
                }
                return;
            }
        });

        self.monitors.lock().await.insert(key, handle);
    }

    fn producer_env(
        &self,
        context: &ProjectContext,
        request: &StartRequest,
        key_b64: &str,
        consumer_id: &str,
        lease_ms: u64,
        subscriptions: Option<&(String, String)>,
    ) -> BTreeMap<String, String> {
        let mut env = self.common_env(context, request, key_b64, lease_ms);
        env.insert(
            "WORKFLOWS_BASE_URL".into(),
            self.config.workflows_base_url.clone(),
        );
        env.insert("CONSUMER_ID".into(), consumer_id.to_string());
        env.insert(
            "SUPERVISOR_BASE_URL".into(),
            format!("http://{}", self.config.bind),
        );
        if let Some(base) = &self.config.consumer_base_url {
            env.insert("CONSUMER_BASE_URL".into(), base.clone());
        }
        if let Some((_, resp_sub)) = subscriptions {
            env.insert("REPLY_CHANNEL".into(), resp_sub.clone());
        }
        if let Some(id) = &request.since_id {
            env.insert("SINCE_ID".into(), id.clone());
        }
        if let Some(time) = &request.since_time {
            env.insert("SINCE_TIME".into(), time.clone());
        }
        env
    }

    fn executor_env(
        &self,
        context: &ProjectContext,
        request: &StartRequest,
        key_b64: &str,
        subscriptions: Option<&(String, String)>,
    ) -> BTreeMap<String, String> {
        let mut env = self.common_env(context, request, key_b64, self.config.lock_lease_ms);
        if let Some((req_sub, _)) = subscriptions {
            env.insert("SUBSCRIPTION".into(), req_sub.clone());
        }
        if let Some(bind) = self
            .config
            .consumer_base_url
            .as_deref()
            .and_then(bind_from_url)
        {
            env.insert("CONSUMER_BIND".into(), bind);
        }
        env
    }

    fn common_env(
        &self,
        context: &ProjectContext,
        request: &StartRequest,
        key_b64: &str,
        lease_ms: u64,
    ) -> BTreeMap<String, String> {
        // The children also inherit this process's environment, which is
        // how GCS_*, SYNC_*, and timing knobs flow through unchanged.
        let mut env = BTreeMap::new();
        env.insert("USER_ID".into(), context.user_id.clone());
        env.insert("PROJECT_ID".into(), context.project_id.clone());
        if let Some(workspace) = &context.workspace_id {
            env.insert("WORKSPACE_ID".into(), workspace.clone());
        }
        if let Some(session) = &context.session_id {
            env.insert("SESSION_ID".into(), session.clone());
        }
        env.insert("ENC_KEY_B64".into(), key_b64.to_string());
        if let Some(ver) = &request.enc_ver {
            env.insert("ENC_VER".into(), ver.clone());
        }
        if let Some(topic) = &self.config.topic {
            env.insert("PUBSUB_TOPIC".into(), topic.clone());
        }
        env.insert("PUBSUB_BASE_URL".into(), self.config.pubsub_base_url.clone());
        env.insert("LOCK_LEASE_MS".into(), lease_ms.to_string());
        env.insert("WORK_ROOT_BASE".into(), self.config.work_root_base.clone());
        env.insert(
            "WORK_PREFIX_TEMPLATE".into(),
            self.config.work_prefix_template.clone(),
        );
        env
    }
}

fn fingerprint(key: &[u8; 32]) -> String {
    let digest = Sha256::digest(key);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_string()
}

fn monitor_key(user_id: &str, project_id: &str) -> String {
    format!("{user_id}/{project_id}")
}

/// Derive `projects/<p>/subscriptions/<name>` pair names from the topic.
fn subscription_names(
    topic: &str,
    user_id: &str,
    project_id: &str,
    session_id: Option<&str>,
) -> (String, String) {
    let project_path = topic
        .split("/topics/")
        .next()
        .unwrap_or("projects/unknown");
    let mut scope = format!(
        "{}-{}",
        sanitize_segment(user_id),
        sanitize_segment(project_id)
    );
    if let Some(session) = session_id {
        scope.push('-');
        scope.push_str(&sanitize_segment(session));
    }
    (
        format!("{project_path}/subscriptions/tbx-req-{scope}"),
        format!("{project_path}/subscriptions/tbx-resp-{scope}"),
    )
}

fn bind_from_url(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let host_port = rest.split('/').next()?;
    if host_port.contains(':') {
        Some(host_port.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_names_derive_from_topic() {
        let (req, resp) =
            subscription_names("projects/x/topics/bridge", "u1", "p1", Some("s1"));
        assert_eq!(req, "projects/x/subscriptions/tbx-req-u1-p1-s1");
        assert_eq!(resp, "projects/x/subscriptions/tbx-resp-u1-p1-s1");
    }

    #[test]
    fn subscription_names_sanitize_scope() {
        let (req, _) = subscription_names("projects/x/topics/t", "u/1", "p 2", None);
        assert_eq!(req, "projects/x/subscriptions/tbx-req-u1-p2");
    }

    #[test]
    fn bind_derivation() {
        assert_eq!(
            bind_from_url("http://127.0.0.1:8791"),
            Some("127.0.0.1:8791".into())
        );
        assert_eq!(
            bind_from_url("http://127.0.0.1:8791/base"),
            Some("127.0.0.1:8791".into())
        );
        assert_eq!(bind_from_url("http://example.com"), None);
    }

    #[test]
    fn fingerprint_is_eight_hex_chars() {
        let fp = fingerprint(&[7u8; 32]);
        assert_eq!(fp.len(), 8);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
