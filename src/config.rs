//! Layered sandbox configuration.
//!
//! A [`SandboxConfig`] is built once per request from three layers, highest
//! precedence first: explicit caller overrides, `SANDBOX_*` environment
//! variables, compiled-in defaults. It is validated on construction and
//! never mutated afterwards.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

pub const DEFAULT_WORKER_IMAGE: &str = "python:3.12-slim";
pub const DEFAULT_NAME_PREFIX: &str = "agent-sandbox";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

pub const ENV_ENABLED: &str = "SANDBOX_ENABLED";
pub const ENV_MODE: &str = "SANDBOX_MODE";
pub const ENV_WORKSPACE_ROOT: &str = "SANDBOX_WORKSPACE_ROOT";
pub const ENV_WORKER_IMAGE: &str = "SANDBOX_WORKER_IMAGE";
pub const ENV_NAME_PREFIX: &str = "SANDBOX_NAME_PREFIX";
pub const ENV_PROVISIONER_URL: &str = "SANDBOX_PROVISIONER_URL";
pub const ENV_PROVISIONER_API_KEY: &str = "SANDBOX_PROVISIONER_API_KEY";
pub const ENV_TIMEOUT_SECONDS: &str = "SANDBOX_TIMEOUT_SECONDS";
pub const ENV_MAX_OUTPUT_BYTES: &str = "SANDBOX_MAX_OUTPUT_BYTES";

/// Which backend serves sandbox operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Local,
    Container,
    Cluster,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Container => "container",
            Self::Cluster => "cluster",
        })
    }
}

impl FromStr for SandboxMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "container" | "docker" => Ok(Self::Container),
            "cluster" | "k8s" | "kubernetes" => Ok(Self::Cluster),
            other => Err(SandboxError::invalid_config(format!(
                "unknown sandbox mode '{}'",
                other
            ))),
        }
    }
}

/// Resolved, immutable sandbox settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub mode: SandboxMode,
    pub workspace_root: PathBuf,
    pub worker_image: String,
    pub name_prefix: String,
    pub provisioner_url: Option<String>,
    pub provisioner_api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_output_bytes: usize,
}

/// Caller-supplied values that take precedence over the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxOverrides {
    pub enabled: Option<bool>,
    pub mode: Option<SandboxMode>,
    pub workspace_root: Option<PathBuf>,
    pub worker_image: Option<String>,
    pub name_prefix: Option<String>,
    pub provisioner_url: Option<String>,
    pub provisioner_api_key: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

impl SandboxConfig {
    /// Resolve against the process environment.
    pub fn from_env(overrides: &SandboxOverrides) -> SandboxResult<Self> {
        Self::resolve(overrides, |key| std::env::var(key).ok())
    }

    /// Resolve against an arbitrary environment lookup.
    pub fn resolve<F>(overrides: &SandboxOverrides, env: F) -> SandboxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let enabled = match overrides.enabled {
            Some(v) => v,
            None => env(ENV_ENABLED)
                .map(|v| parse_bool(ENV_ENABLED, &v))
                .transpose()?
                .unwrap_or(true),
        };
        let mode = match overrides.mode {
            Some(m) => m,
            None => env(ENV_MODE)
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(SandboxMode::Local),
        };
        let workspace_root = overrides
            .workspace_root
            .clone()
            .or_else(|| env(ENV_WORKSPACE_ROOT).map(PathBuf::from))
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_NAME_PREFIX));
        let worker_image = overrides
            .worker_image
            .clone()
            .or_else(|| env(ENV_WORKER_IMAGE))
            .unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string());
        let name_prefix = overrides
            .name_prefix
            .clone()
            .or_else(|| env(ENV_NAME_PREFIX))
            .unwrap_or_else(|| DEFAULT_NAME_PREFIX.to_string());
        let provisioner_url = overrides
            .provisioner_url
            .clone()
            .or_else(|| env(ENV_PROVISIONER_URL))
            .map(|u| u.trim_end_matches('/').to_string());
        let provisioner_api_key = overrides
            .provisioner_api_key
            .clone()
            .or_else(|| env(ENV_PROVISIONER_API_KEY));
        let timeout_seconds = match overrides.timeout_seconds {
            Some(v) => v,
            None => env(ENV_TIMEOUT_SECONDS)
                .map(|v| parse_number(ENV_TIMEOUT_SECONDS, &v))
                .transpose()?
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        };
        let max_output_bytes = match overrides.max_output_bytes {
            Some(v) => v,
            None => env(ENV_MAX_OUTPUT_BYTES)
                .map(|v| parse_number(ENV_MAX_OUTPUT_BYTES, &v))
                .transpose()?
                .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
        };

        let config = Self {
            enabled,
            mode,
            workspace_root,
            worker_image,
            name_prefix,
            provisioner_url,
            provisioner_api_key,
            timeout_seconds,
            max_output_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> SandboxResult<()> {
        if self.timeout_seconds == 0 {
            return Err(SandboxError::invalid_config("timeout_seconds must be greater than 0"));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::invalid_config("max_output_bytes must be greater than 0"));
        }
        if self.mode == SandboxMode::Cluster && self.provisioner_url.is_none() {
            return Err(SandboxError::invalid_config(format!(
                "cluster mode requires {}",
                ENV_PROVISIONER_URL
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn parse_bool(key: &str, value: &str) -> SandboxResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SandboxError::invalid_config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> SandboxResult<T> {
    value.parse().map_err(|_| {
        SandboxError::invalid_config(format!("{} must be a non-negative integer, got '{}'", key, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_compiled_defaults() {
        let config = SandboxConfig::resolve(&SandboxOverrides::default(), env_of(&[])).unwrap();
        assert!(config.enabled);
        assert_eq!(config.mode, SandboxMode::Local);
        assert_eq!(config.worker_image, DEFAULT_WORKER_IMAGE);
        assert_eq!(config.timeout_seconds, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert!(config.provisioner_url.is_none());
    }

    #[test]
    fn test_env_over_defaults() {
        let env = env_of(&[
            (ENV_MODE, "container"),
            (ENV_TIMEOUT_SECONDS, "15"),
            (ENV_ENABLED, "false"),
            (ENV_WORKER_IMAGE, "alpine:3"),
        ]);
        let config = SandboxConfig::resolve(&SandboxOverrides::default(), env).unwrap();
        assert_eq!(config.mode, SandboxMode::Container);
        assert_eq!(config.timeout_seconds, 15);
        assert!(!config.enabled);
        assert_eq!(config.worker_image, "alpine:3");
    }

    #[test]
    fn test_explicit_over_env() {
        let env = env_of(&[(ENV_MODE, "container"), (ENV_TIMEOUT_SECONDS, "15")]);
        let overrides = SandboxOverrides {
            mode: Some(SandboxMode::Local),
            timeout_seconds: Some(3),
            ..Default::default()
        };
        let config = SandboxConfig::resolve(&overrides, env).unwrap();
        assert_eq!(config.mode, SandboxMode::Local);
        assert_eq!(config.timeout_seconds, 3);
    }

    #[test]
    fn test_cluster_requires_url() {
        let env = env_of(&[(ENV_MODE, "cluster")]);
        let err = SandboxConfig::resolve(&SandboxOverrides::default(), env).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig { .. }));

        let env = env_of(&[(ENV_MODE, "cluster"), (ENV_PROVISIONER_URL, "http://prov:8080/")]);
        let config = SandboxConfig::resolve(&SandboxOverrides::default(), env).unwrap();
        assert_eq!(config.provisioner_url.as_deref(), Some("http://prov:8080"));
    }

    #[test]
    fn test_rejects_bad_values() {
        for pairs in [
            [(ENV_MODE, "vm")],
            [(ENV_TIMEOUT_SECONDS, "abc")],
            [(ENV_TIMEOUT_SECONDS, "0")],
            [(ENV_ENABLED, "maybe")],
        ] {
            assert!(
                SandboxConfig::resolve(&SandboxOverrides::default(), env_of(&pairs)).is_err(),
                "{:?}",
                pairs
            );
        }
    }
}
