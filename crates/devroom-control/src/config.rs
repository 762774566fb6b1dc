//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Commands a bridge may run, matched as whole-token prefixes.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "npm install",
    "npm ci",
    "npm test",
    "npm run build",
    "npm run test",
    "npm run lint",
    "yarn install",
    "yarn test",
    "yarn build",
    "pnpm install",
    "pnpm test",
    "pnpm build",
    "cargo build",
    "cargo test",
    "cargo check",
    "cargo fmt",
    "cargo clippy",
    "pip install",
    "python -m pytest",
    "go build",
    "go test",
    "go mod tidy",
    "make",
    "ls",
    "cat",
    "git status",
];

/// Configuration for the engine services.
///
/// Durations are given in whole seconds when deserialized.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Wall-clock limit for bridge commands and git operations.
    #[serde(
        rename = "command_timeout_seconds",
        default = "ControlConfig::default_command_timeout",
        deserialize_with = "seconds"
    )]
    pub command_timeout: Duration,

    /// Captured stdout/stderr are truncated to this many bytes each.
    #[serde(default = "ControlConfig::default_max_output")]
    pub max_output_bytes: usize,

    /// Allow-listed command prefixes for `execute-command`.
    #[serde(default = "ControlConfig::default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Wall-clock limit for each deployment install/build step.
    #[serde(
        rename = "deploy_step_timeout_seconds",
        default = "ControlConfig::default_deploy_step_timeout",
        deserialize_with = "seconds"
    )]
    pub deploy_step_timeout: Duration,

    /// Parent directory for per-deployment working directories.
    #[serde(default = "ControlConfig::default_work_root")]
    pub deploy_work_root: PathBuf,

    /// Where the `static` provider publishes build output.
    #[serde(default = "ControlConfig::default_publish_root")]
    pub publish_root: PathBuf,

    /// Public URL prefix of `publish_root`.
    #[serde(default = "ControlConfig::default_public_base_url")]
    pub public_base_url: String,

    /// Target of the `webhook` provider. The provider is not registered when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Terminal deployments older than this are evicted from memory.
    #[serde(
        rename = "deployment_retention_seconds",
        default = "ControlConfig::default_retention",
        deserialize_with = "seconds"
    )]
    pub deployment_retention: Duration,

    /// How often the retention sweeper runs.
    #[serde(
        rename = "retention_sweep_interval_seconds",
        default = "ControlConfig::default_sweep_interval",
        deserialize_with = "seconds"
    )]
    pub retention_sweep_interval: Duration,

    /// Default page size for deployment history.
    #[serde(default = "ControlConfig::default_history_limit")]
    pub history_limit: usize,
}

impl ControlConfig {
    const fn default_command_timeout() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_max_output() -> usize {
        64 * 1024
    }

    fn default_allowed_commands() -> Vec<String> {
        DEFAULT_ALLOWED_COMMANDS
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    const fn default_deploy_step_timeout() -> Duration {
        Duration::from_secs(600)
    }

    fn default_work_root() -> PathBuf {
        std::env::temp_dir().join("devroom-deploy")
    }

    fn default_publish_root() -> PathBuf {
        std::env::temp_dir().join("devroom-sites")
    }

    fn default_public_base_url() -> String {
        "http://localhost:8080/sites".to_string()
    }

    const fn default_retention() -> Duration {
        Duration::from_secs(2 * 24 * 60 * 60) // 2 days
    }

    const fn default_sweep_interval() -> Duration {
        Duration::from_secs(60 * 60)
    }

    const fn default_history_limit() -> usize {
        20
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            command_timeout: Self::default_command_timeout(),
            max_output_bytes: Self::default_max_output(),
            allowed_commands: Self::default_allowed_commands(),
            deploy_step_timeout: Self::default_deploy_step_timeout(),
            deploy_work_root: Self::default_work_root(),
            publish_root: Self::default_publish_root(),
            public_base_url: Self::default_public_base_url(),
            webhook_url: None,
            deployment_retention: Self::default_retention(),
            retention_sweep_interval: Self::default_sweep_interval(),
            history_limit: Self::default_history_limit(),
        }
    }
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}
