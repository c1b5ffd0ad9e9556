// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tbx_core::{ErrorDelivery, clamp_lease_ms};

/// Process exit code for fatal configuration errors.
pub const EXIT_CODE_CONFIG: i32 = 2;

/// Default READ_FILE byte cap.
pub const DEFAULT_READ_FILE_MAX_BYTES: usize = 524_288;
/// Default per-stream RUN_COMMAND output cap.
pub const DEFAULT_OUTPUT_MAX_BYTES: usize = 262_144;
/// Default RUN_COMMAND timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
/// Default per-send channel timeout in milliseconds.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 20_000;
/// Default initial reconnect backoff in milliseconds.
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1_000;
/// Default duplex-stream heartbeat cadence in milliseconds.
pub const DEFAULT_HEARTBEAT_MS: u64 = 15_000;
/// Default graceful-shutdown budget in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
/// Default pub/sub idle-exit window in milliseconds.
pub const DEFAULT_IDLE_EXIT_MS: u64 = 300_000;

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is absent or empty.
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    /// An environment variable exists but could not be parsed.
    #[error("invalid value for {name}: {reason}")]
    InvalidVar {
        /// Variable name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// A source of environment values; `&HashMap<String, String>` for tests,
/// [`process_env`] in binaries.
pub trait EnvSource {
    /// Look up a variable, returning trimmed non-empty values only.
    fn get(&self, name: &str) -> Option<String>;
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// The process environment as an [`EnvSource`].
#[derive(Debug, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// The process environment.
#[must_use]
pub fn process_env() -> ProcessEnv {
    ProcessEnv
}

fn require(env: &impl EnvSource, name: &str) -> Result<String, ConfigError> {
    env.get(name)
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn parse_u64(env: &impl EnvSource, name: &str, default: u64) -> Result<u64, ConfigError> {
    match env.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
            name: name.to_string(),
            reason: format!("expected integer, got '{raw}'"),
        }),
    }
}

fn parse_usize(env: &impl EnvSource, name: &str, default: usize) -> Result<usize, ConfigError> {
    Ok(parse_u64(env, name, default as u64)? as usize)
}

fn parse_bool(env: &impl EnvSource, name: &str, default: bool) -> Result<bool, ConfigError> {
    match env.get(name) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidVar {
                name: name.to_string(),
                reason: format!("expected boolean, got '{other}'"),
            }),
        },
    }
}

// ---------------------------------------------------------------------------
// Project context & templates
// ---------------------------------------------------------------------------

/// The ownership scope a process serves, from `USER_ID` / `PROJECT_ID` /
/// `WORKSPACE_ID` / `SESSION_ID`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Owning user (required).
    pub user_id: String,
    /// Owning project (required).
    pub project_id: String,
    /// Workspace within the project.
    pub workspace_id: Option<String>,
    /// Session sub-scope.
    pub session_id: Option<String>,
}

impl ProjectContext {
    /// Read the context from the environment.
    pub fn load(env: &impl EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            user_id: require(env, "USER_ID")?,
            project_id: require(env, "PROJECT_ID")?,
            workspace_id: env.get("WORKSPACE_ID"),
            session_id: env.get("SESSION_ID"),
        })
    }
}

/// Expand `{userId}` / `{projectId}` / `{workspaceId}` / `{sessionId}`
/// placeholders in a prefix template. Absent optional scopes expand to
/// `default`, matching the workspace layout.
#[must_use]
pub fn expand_template(template: &str, ctx: &ProjectContext) -> String {
    template
        .replace("{userId}", &ctx.user_id)
        .replace("{projectId}", &ctx.project_id)
        .replace(
            "{workspaceId}",
            ctx.workspace_id.as_deref().unwrap_or("default"),
        )
        .replace(
            "{sessionId}",
            ctx.session_id.as_deref().unwrap_or("default"),
        )
}

/// Default layout template for work roots under `WORK_ROOT_BASE`.
pub const DEFAULT_WORK_PREFIX_TEMPLATE: &str =
    "{userId}/{projectId}/{workspaceId}/{sessionId}";

// ---------------------------------------------------------------------------
// Tool limits
// ---------------------------------------------------------------------------

/// Byte and time limits applied by the tool runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolLimits {
    /// Maximum bytes returned by READ_FILE.
    pub read_file_max_bytes: usize,
    /// Per-stream cap on RUN_COMMAND output.
    pub output_max_bytes: usize,
    /// Default RUN_COMMAND timeout in seconds (per-request values are
    /// clamped to [1, 600] regardless).
    pub command_timeout_secs: u64,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            read_file_max_bytes: DEFAULT_READ_FILE_MAX_BYTES,
            output_max_bytes: DEFAULT_OUTPUT_MAX_BYTES,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl ToolLimits {
    /// Read limits from `READ_FILE_MAX_BYTES` / `OUTPUT_MAX_BYTES` /
    /// `RUN_COMMAND_TIMEOUT_SECONDS`.
    pub fn load(env: &impl EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            read_file_max_bytes: parse_usize(
                env,
                "READ_FILE_MAX_BYTES",
                DEFAULT_READ_FILE_MAX_BYTES,
            )?,
            output_max_bytes: parse_usize(env, "OUTPUT_MAX_BYTES", DEFAULT_OUTPUT_MAX_BYTES)?,
            command_timeout_secs: parse_u64(
                env,
                "RUN_COMMAND_TIMEOUT_SECONDS",
                DEFAULT_COMMAND_TIMEOUT_SECS,
            )?
            .clamp(1, 600),
        })
    }
}

// ---------------------------------------------------------------------------
// Mirror settings
// ---------------------------------------------------------------------------

/// Object-store mirroring settings (`GCS_*`, `SYNC_*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSettings {
    /// Bucket to mirror; mirroring is disabled when unset.
    pub bucket: Option<String>,
    /// Object-name prefix template.
    pub prefix_template: String,
    /// Whether local changes are uploaded back.
    pub enable_upload: bool,
    /// Concurrent downloads.
    pub download_concurrency: usize,
    /// Concurrent uploads.
    pub upload_concurrency: usize,
    /// Requester-pays billing project, if any.
    pub billing_project: Option<String>,
    /// Object-store API base URL (overridable for emulators).
    pub base_url: String,
    /// Run a sync when the executor starts.
    pub sync_on_start: bool,
    /// Periodic sync interval in milliseconds; 0 disables the timer.
    pub sync_interval_ms: u64,
}

impl MirrorSettings {
    /// Read mirror settings from the environment.
    pub fn load(env: &impl EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            bucket: env.get("GCS_BUCKET"),
            prefix_template: env.get("GCS_PREFIX_TEMPLATE").unwrap_or_default(),
            enable_upload: parse_bool(env, "GCS_ENABLE_UPLOAD", true)?,
            download_concurrency: parse_usize(env, "GCS_DOWNLOAD_CONCURRENCY", 4)?.max(1),
            upload_concurrency: parse_usize(env, "GCS_UPLOAD_CONCURRENCY", 4)?.max(1),
            billing_project: env.get("GCS_BILLING_PROJECT"),
            base_url: env
                .get("GCS_BASE_URL")
                .unwrap_or_else(|| "https://storage.googleapis.com".to_string()),
            sync_on_start: parse_bool(env, "SYNC_ON_START", false)?,
            sync_interval_ms: parse_u64(env, "SYNC_INTERVAL_MS", 0)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Executor configuration
// ---------------------------------------------------------------------------

/// Which fabric the executor serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// Serve the duplex NDJSON endpoint.
    Duplex,
    /// Consume a filtered pub/sub subscription.
    PubSub,
}

/// Full executor-process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Ownership scope served.
    pub context: ProjectContext,
    /// Base directory for work roots (`WORK_ROOT_BASE`).
    pub work_root_base: String,
    /// Work-root layout template (`WORK_PREFIX_TEMPLATE`).
    pub work_prefix_template: String,
    /// Tool runtime limits.
    pub limits: ToolLimits,
    /// Mirror settings.
    pub mirror: MirrorSettings,
    /// Base64 32-byte envelope key, when frames are sealed.
    pub enc_key_b64: Option<String>,
    /// Duplex bind address (`CONSUMER_BIND`).
    pub bind: String,
    /// Pub/sub topic for replies.
    pub topic: Option<String>,
    /// Request subscription consumed in pub/sub mode (`SUBSCRIPTION`).
    pub subscription: Option<String>,
    /// Pub/sub API base URL.
    pub pubsub_base_url: String,
    /// Idle-exit window in pub/sub mode.
    pub idle_exit_ms: u64,
    /// Heartbeat cadence on the duplex response stream.
    pub heartbeat_ms: u64,
    /// Graceful-shutdown budget.
    pub shutdown_timeout_ms: u64,
}

impl ExecutorConfig {
    /// Read the executor configuration from the environment.
    pub fn load(env: &impl EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            context: ProjectContext::load(env)?,
            work_root_base: require(env, "WORK_ROOT_BASE")?,
            work_prefix_template: env
                .get("WORK_PREFIX_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_WORK_PREFIX_TEMPLATE.to_string()),
            limits: ToolLimits::load(env)?,
            mirror: MirrorSettings::load(env)?,
            enc_key_b64: env.get("ENC_KEY_B64"),
            bind: env
                .get("CONSUMER_BIND")
                .unwrap_or_else(|| "127.0.0.1:8791".to_string()),
            topic: env.get("PUBSUB_TOPIC"),
            subscription: env.get("SUBSCRIPTION"),
            pubsub_base_url: pubsub_base_url(env),
            idle_exit_ms: parse_u64(env, "IDLE_EXIT_MS", DEFAULT_IDLE_EXIT_MS)?,
            heartbeat_ms: parse_u64(env, "EVENTS_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS)?,
            shutdown_timeout_ms: parse_u64(
                env,
                "SHUTDOWN_TIMEOUT_MS",
                DEFAULT_SHUTDOWN_TIMEOUT_MS,
            )?,
        })
    }

    /// The fabric this configuration selects: pub/sub when a request
    /// subscription is named, duplex otherwise.
    #[must_use]
    pub fn mode(&self) -> ExecutorMode {
        if self.subscription.is_some() {
            ExecutorMode::PubSub
        } else {
            ExecutorMode::Duplex
        }
    }
}

// ---------------------------------------------------------------------------
// Producer configuration
// ---------------------------------------------------------------------------

/// Full producer-process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Ownership scope served.
    pub context: ProjectContext,
    /// Workflow engine base URL (events, cursors, callbacks).
    pub workflows_base_url: String,
    /// Audience for workflow-engine identity tokens.
    pub workflows_audience: Option<String>,
    /// Executor base URL for the duplex fabric.
    pub consumer_base_url: Option<String>,
    /// Base64 32-byte envelope key.
    pub enc_key_b64: Option<String>,
    /// Pub/sub topic for requests.
    pub topic: Option<String>,
    /// Response subscription consumed in pub/sub mode (`REPLY_CHANNEL`).
    pub reply_subscription: Option<String>,
    /// Pub/sub API base URL.
    pub pubsub_base_url: String,
    /// Initial reconnect backoff.
    pub reconnect_backoff_ms: u64,
    /// Per-send channel timeout.
    pub send_timeout_ms: u64,
    /// Graceful-shutdown budget.
    pub shutdown_timeout_ms: u64,
    /// Lease duration requested on refresh.
    pub lock_lease_ms: u64,
    /// Replay floor by event id.
    pub since_id: Option<String>,
    /// Replay floor by event time.
    pub since_time: Option<String>,
    /// Tool-error delivery policy.
    pub error_delivery: ErrorDelivery,
    /// Pre-minted service identity token for upstream and executor calls.
    pub service_token: Option<String>,
    /// Lease holder identity, minted by the supervisor.
    pub consumer_id: Option<String>,
    /// Supervisor base URL for the lease API; refresh is skipped when unset.
    pub supervisor_base_url: Option<String>,
    /// Short-lived object-store token forwarded on the duplex channel.
    pub gcs_token: Option<String>,
}

impl ProducerConfig {
    /// Read the producer configuration from the environment.
    pub fn load(env: &impl EnvSource) -> Result<Self, ConfigError> {
        let error_delivery = match env.get("TOOL_ERROR_DELIVERY") {
            None => ErrorDelivery::default(),
            Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidVar {
                name: "TOOL_ERROR_DELIVERY".to_string(),
                reason,
            })?,
        };

        Ok(Self {
            context: ProjectContext::load(env)?,
            workflows_base_url: require(env, "WORKFLOWS_BASE_URL")?,
            workflows_audience: env.get("WORKFLOWS_AUDIENCE"),
            consumer_base_url: env.get("CONSUMER_BASE_URL"),
            enc_key_b64: env.get("ENC_KEY_B64"),
            topic: env.get("PUBSUB_TOPIC"),
            reply_subscription: env.get("REPLY_CHANNEL"),
            pubsub_base_url: pubsub_base_url(env),
            reconnect_backoff_ms: parse_u64(
                env,
                "RECONNECT_BACKOFF_MS",
                DEFAULT_RECONNECT_BACKOFF_MS,
            )?,
            send_timeout_ms: parse_u64(env, "SEND_TIMEOUT_MS", DEFAULT_SEND_TIMEOUT_MS)?,
            shutdown_timeout_ms: parse_u64(
                env,
                "SHUTDOWN_TIMEOUT_MS",
                DEFAULT_SHUTDOWN_TIMEOUT_MS,
            )?,
            lock_lease_ms: clamp_lease_ms(match env.get("LOCK_LEASE_MS") {
                None => None,
                Some(_) => Some(parse_u64(env, "LOCK_LEASE_MS", 0)?),
            }),
            since_id: env.get("SINCE_ID"),
            since_time: env.get("SINCE_TIME"),
            error_delivery,
            service_token: env.get("SERVICE_TOKEN"),
            consumer_id: env.get("CONSUMER_ID"),
            supervisor_base_url: env.get("SUPERVISOR_BASE_URL"),
            gcs_token: env.get("GCS_TOKEN"),
        })
    }
}

// ---------------------------------------------------------------------------
// Daemon configuration
// ---------------------------------------------------------------------------

/// Supervisor-daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Control-plane bind address.
    pub bind: String,
    /// Base directory for work roots.
    pub work_root_base: String,
    /// Work-root layout template.
    pub work_prefix_template: String,
    /// Workflow engine base URL handed to producers.
    pub workflows_base_url: String,
    /// Executor base URL handed to producers (duplex mode).
    pub consumer_base_url: Option<String>,
    /// Pub/sub topic; pub/sub mode when set.
    pub topic: Option<String>,
    /// Pub/sub API base URL.
    pub pubsub_base_url: String,
    /// Default lease duration.
    pub lock_lease_ms: u64,
    /// Graceful-shutdown budget.
    pub shutdown_timeout_ms: u64,
    /// Command used to launch local producers.
    pub producer_cmd: String,
    /// Command used to launch local executors.
    pub executor_cmd: String,
    /// Cloud jobs API base URL; cloud mode is unavailable when unset.
    pub cloud_jobs_base_url: Option<String>,
    /// Cloud job name for producers.
    pub cloud_producer_job: Option<String>,
    /// Cloud job name for executors.
    pub cloud_executor_job: Option<String>,
}

impl DaemonConfig {
    /// Read the daemon configuration from the environment.
    pub fn load(env: &impl EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            bind: env
                .get("DAEMON_BIND")
                .unwrap_or_else(|| "127.0.0.1:8790".to_string()),
            work_root_base: require(env, "WORK_ROOT_BASE")?,
            work_prefix_template: env
                .get("WORK_PREFIX_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_WORK_PREFIX_TEMPLATE.to_string()),
            workflows_base_url: require(env, "WORKFLOWS_BASE_URL")?,
            consumer_base_url: env.get("CONSUMER_BASE_URL"),
            topic: env.get("PUBSUB_TOPIC"),
            pubsub_base_url: pubsub_base_url(env),
            lock_lease_ms: clamp_lease_ms(match env.get("LOCK_LEASE_MS") {
                None => None,
                Some(_) => Some(parse_u64(env, "LOCK_LEASE_MS", 0)?),
            }),
            shutdown_timeout_ms: parse_u64(
                env,
                "SHUTDOWN_TIMEOUT_MS",
                DEFAULT_SHUTDOWN_TIMEOUT_MS,
            )?,
            producer_cmd: env
                .get("PRODUCER_CMD")
                .unwrap_or_else(|| "tbx-producer".to_string()),
            executor_cmd: env
                .get("EXECUTOR_CMD")
                .unwrap_or_else(|| "tbx-executor".to_string()),
            cloud_jobs_base_url: env.get("CLOUD_JOBS_BASE_URL"),
            cloud_producer_job: env.get("CLOUD_PRODUCER_JOB"),
            cloud_executor_job: env.get("CLOUD_EXECUTOR_JOB"),
        })
    }
}

fn pubsub_base_url(env: &impl EnvSource) -> String {
    env.get("PUBSUB_BASE_URL")
        .unwrap_or_else(|| "https://pubsub.googleapis.com".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_required_var_is_reported_by_name() {
        let err = ProjectContext::load(&env(&[("USER_ID", "u")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(name) if name == "PROJECT_ID"));
    }

    #[test]
    fn empty_values_count_as_missing() {
        let err =
            ProjectContext::load(&env(&[("USER_ID", "  "), ("PROJECT_ID", "p")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(name) if name == "USER_ID"));
    }

    #[test]
    fn template_expansion_with_defaults() {
        let ctx = ProjectContext {
            user_id: "u1".into(),
            project_id: "p1".into(),
            workspace_id: None,
            session_id: Some("s1".into()),
        };
        assert_eq!(
            expand_template("projects/{userId}/{projectId}/{workspaceId}/{sessionId}/", &ctx),
            "projects/u1/p1/default/s1/"
        );
    }

    #[test]
    fn tool_limits_defaults() {
        let limits = ToolLimits::load(&env(&[])).unwrap();
        assert_eq!(limits.read_file_max_bytes, 524_288);
        assert_eq!(limits.output_max_bytes, 262_144);
        assert_eq!(limits.command_timeout_secs, 60);
    }

    #[test]
    fn tool_limits_clamp_command_timeout() {
        let limits =
            ToolLimits::load(&env(&[("RUN_COMMAND_TIMEOUT_SECONDS", "10000")])).unwrap();
        assert_eq!(limits.command_timeout_secs, 600);
        let limits = ToolLimits::load(&env(&[("RUN_COMMAND_TIMEOUT_SECONDS", "0")])).unwrap();
        assert_eq!(limits.command_timeout_secs, 1);
    }

    #[test]
    fn invalid_integer_is_rejected() {
        let err = ToolLimits::load(&env(&[("READ_FILE_MAX_BYTES", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name, .. } if name == "READ_FILE_MAX_BYTES"));
    }

    #[test]
    fn executor_mode_follows_subscription() {
        let base = &[
            ("USER_ID", "u"),
            ("PROJECT_ID", "p"),
            ("WORK_ROOT_BASE", "/tmp/work"),
        ];
        let cfg = ExecutorConfig::load(&env(base)).unwrap();
        assert_eq!(cfg.mode(), ExecutorMode::Duplex);

        let mut with_sub = env(base);
        with_sub.insert("SUBSCRIPTION".into(), "tbx-req-p".into());
        let cfg = ExecutorConfig::load(&with_sub).unwrap();
        assert_eq!(cfg.mode(), ExecutorMode::PubSub);
    }

    #[test]
    fn producer_lease_is_clamped() {
        let cfg = ProducerConfig::load(&env(&[
            ("USER_ID", "u"),
            ("PROJECT_ID", "p"),
            ("WORKFLOWS_BASE_URL", "http://wf"),
            ("LOCK_LEASE_MS", "10"),
        ]))
        .unwrap();
        assert_eq!(cfg.lock_lease_ms, 5_000);
    }

    #[test]
    fn producer_error_delivery_parses() {
        let cfg = ProducerConfig::load(&env(&[
            ("USER_ID", "u"),
            ("PROJECT_ID", "p"),
            ("WORKFLOWS_BASE_URL", "http://wf"),
            ("TOOL_ERROR_DELIVERY", "reject"),
        ]))
        .unwrap();
        assert_eq!(cfg.error_delivery, ErrorDelivery::Reject);

        let err = ProducerConfig::load(&env(&[
            ("USER_ID", "u"),
            ("PROJECT_ID", "p"),
            ("WORKFLOWS_BASE_URL", "http://wf"),
            ("TOOL_ERROR_DELIVERY", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name, .. } if name == "TOOL_ERROR_DELIVERY"));
    }

    #[test]
    fn mirror_defaults() {
        let mirror = MirrorSettings::load(&env(&[])).unwrap();
        assert!(mirror.bucket.is_none());
        assert!(mirror.enable_upload);
        assert_eq!(mirror.download_concurrency, 4);
        assert_eq!(mirror.base_url, "https://storage.googleapis.com");
        assert_eq!(mirror.sync_interval_ms, 0);
    }

    #[test]
    fn daemon_requires_workflows_url() {
        let err = DaemonConfig::load(&env(&[("WORK_ROOT_BASE", "/tmp/work")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(name) if name == "WORKFLOWS_BASE_URL"));
    }
}
