//! Provisioner settings, read from flags or `PROVISIONER_*` variables.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

use crate::config::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_NAME_PREFIX, DEFAULT_TIMEOUT_SECS, DEFAULT_WORKER_IMAGE};
use crate::error::{SandboxError, SandboxResult};
use crate::paths::VIRTUAL_ROOT;

pub const DEFAULT_NAMESPACE: &str = "agent-sandboxes";
pub const DEFAULT_CONTAINER_NAME: &str = "worker";
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_FILE_OP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Args)]
pub struct ProvisionerConfig {
    /// Address the HTTP API listens on
    #[arg(long, env = "PROVISIONER_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Namespace sandbox pods live in
    #[arg(long, env = "PROVISIONER_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Path to the kubectl binary
    #[arg(long, env = "PROVISIONER_KUBECTL", default_value = "kubectl")]
    pub kubectl: String,

    /// kubeconfig context to use
    #[arg(long, env = "PROVISIONER_KUBE_CONTEXT")]
    pub kube_context: Option<String>,

    /// Image every sandbox pod runs
    #[arg(long, env = "PROVISIONER_WORKER_IMAGE", default_value = DEFAULT_WORKER_IMAGE)]
    pub worker_image: String,

    /// Name of the single container in each pod
    #[arg(long, env = "PROVISIONER_CONTAINER_NAME", default_value = DEFAULT_CONTAINER_NAME)]
    pub container_name: String,

    /// Prefix for pod names
    #[arg(long, env = "PROVISIONER_NAME_PREFIX", default_value = DEFAULT_NAME_PREFIX)]
    pub name_prefix: String,

    /// Mount path of the workspace volume inside the pod
    #[arg(long, env = "PROVISIONER_WORKSPACE_DIR", default_value = VIRTUAL_ROOT)]
    pub workspace_dir: String,

    /// Seconds to wait for a new pod to become ready
    #[arg(long, env = "PROVISIONER_STARTUP_TIMEOUT", default_value_t = DEFAULT_STARTUP_TIMEOUT_SECS)]
    pub startup_timeout_secs: u64,

    /// Seconds without use before a pod is reclaimed
    #[arg(long, env = "PROVISIONER_IDLE_TIMEOUT", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    /// Seconds between idle sweeps
    #[arg(long, env = "PROVISIONER_CLEANUP_INTERVAL", default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS)]
    pub cleanup_interval_secs: u64,

    /// Execute timeout when the request does not set one
    #[arg(long, env = "PROVISIONER_DEFAULT_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub default_timeout_secs: u64,

    /// Upper bound on any execute timeout
    #[arg(long, env = "PROVISIONER_MAX_TIMEOUT", default_value_t = DEFAULT_MAX_TIMEOUT_SECS)]
    pub max_timeout_secs: u64,

    /// Timeout for list/read/write/replace
    #[arg(long, env = "PROVISIONER_FILE_OP_TIMEOUT", default_value_t = DEFAULT_FILE_OP_TIMEOUT_SECS)]
    pub file_op_timeout_secs: u64,

    /// Ceiling on captured command output
    #[arg(long, env = "PROVISIONER_MAX_OUTPUT_BYTES", default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    pub max_output_bytes: usize,

    /// Bearer token required on /v1 routes
    #[arg(long, env = "PROVISIONER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "PROVISIONER_CPU_REQUEST")]
    pub cpu_request: Option<String>,

    #[arg(long, env = "PROVISIONER_CPU_LIMIT")]
    pub cpu_limit: Option<String>,

    #[arg(long, env = "PROVISIONER_MEMORY_REQUEST")]
    pub memory_request: Option<String>,

    #[arg(long, env = "PROVISIONER_MEMORY_LIMIT")]
    pub memory_limit: Option<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            namespace: DEFAULT_NAMESPACE.to_string(),
            kubectl: "kubectl".to_string(),
            kube_context: None,
            worker_image: DEFAULT_WORKER_IMAGE.to_string(),
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            workspace_dir: VIRTUAL_ROOT.to_string(),
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
            file_op_timeout_secs: DEFAULT_FILE_OP_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            api_key: None,
            cpu_request: None,
            cpu_limit: None,
            memory_request: None,
            memory_limit: None,
        }
    }
}

impl ProvisionerConfig {
    pub fn validate(&self) -> SandboxResult<()> {
        let positive = [
            ("startup timeout", self.startup_timeout_secs),
            ("idle timeout", self.idle_timeout_secs),
            ("cleanup interval", self.cleanup_interval_secs),
            ("default timeout", self.default_timeout_secs),
            ("max timeout", self.max_timeout_secs),
            ("file-op timeout", self.file_op_timeout_secs),
            ("max output bytes", self.max_output_bytes as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SandboxError::invalid_config(format!("{} must be greater than 0", name)));
            }
        }
        if !self.workspace_dir.starts_with('/') {
            return Err(SandboxError::invalid_config("workspace dir must be absolute"));
        }
        if self.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(SandboxError::invalid_config("api key must not be blank"));
        }
        Ok(())
    }

    /// Effective execute timeout: the request's value (or the default),
    /// clamped to `[1, max_timeout]`.
    pub fn exec_timeout(&self, requested: Option<u64>) -> Duration {
        let secs = requested
            .unwrap_or(self.default_timeout_secs)
            .clamp(1, self.max_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Output budget: the smaller of the request's value and the ceiling.
    pub fn output_budget(&self, requested: Option<usize>) -> usize {
        requested
            .map(|v| v.min(self.max_output_bytes))
            .unwrap_or(self.max_output_bytes)
            .max(1)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn file_op_timeout(&self) -> Duration {
        Duration::from_secs(self.file_op_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ProvisionerConfig,
    }

    #[test]
    fn test_flag_defaults_match_default_impl() {
        let parsed = Cli::parse_from(["test"]).config;
        let default = ProvisionerConfig::default();
        assert_eq!(parsed.namespace, default.namespace);
        assert_eq!(parsed.worker_image, default.worker_image);
        assert_eq!(parsed.workspace_dir, default.workspace_dir);
        assert_eq!(parsed.idle_timeout_secs, default.idle_timeout_secs);
        assert_eq!(parsed.max_output_bytes, default.max_output_bytes);
        assert_eq!(parsed.bind, default.bind);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_exec_timeout_clamped() {
        let config = ProvisionerConfig {
            default_timeout_secs: 60,
            max_timeout_secs: 300,
            ..Default::default()
        };
        assert_eq!(config.exec_timeout(None), Duration::from_secs(60));
        assert_eq!(config.exec_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(config.exec_timeout(Some(10_000)), Duration::from_secs(300));
        assert_eq!(config.exec_timeout(Some(0)), Duration::from_secs(1));
    }

    #[test]
    fn test_output_budget_takes_smaller() {
        let config = ProvisionerConfig {
            max_output_bytes: 1000,
            ..Default::default()
        };
        assert_eq!(config.output_budget(None), 1000);
        assert_eq!(config.output_budget(Some(10)), 10);
        assert_eq!(config.output_budget(Some(5000)), 1000);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = ProvisionerConfig {
            idle_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
