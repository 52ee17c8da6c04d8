//! Container backend: one long-lived container per sandbox, exec'd into.
//!
//! Containers are started with a sleep-loop entrypoint and the sandbox's host
//! workspace bind-mounted at `/workspace`, then reused for every later call so
//! installed packages and written files survive between steps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::identity::derive_resource_name;
use crate::output::EXIT_NOT_FOUND;
use crate::paths::VIRTUAL_ROOT;
use crate::process::{self, CommandOutcome};
use crate::workspace::HostWorkspace;

/// Keeps PID 1 alive without doing any work. Shared by containers and pods.
pub const KEEPALIVE: &str = "trap 'exit 0' TERM; while true; do sleep 3600 & wait $!; done";

/// Deadline for `docker run/start/inspect/rm`.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

/// Label attached to every container this backend creates.
pub const MANAGED_LABEL: &str = "agent-sandbox.managed=true";

/// What to launch for a sandbox, taken from the request's config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name_prefix: String,
    pub workspace_root: PathBuf,
}

impl ContainerSpec {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            image: config.worker_image.clone(),
            name_prefix: config.name_prefix.clone(),
            workspace_root: config.workspace_root.clone(),
        }
    }

    pub fn container_name(&self, sandbox_id: &str) -> String {
        derive_resource_name(sandbox_id, &self.name_prefix)
    }

    /// Host directory mounted into the sandbox's container.
    pub fn workspace(&self, sandbox_id: &str) -> HostWorkspace {
        HostWorkspace::new(self.workspace_root.join(sandbox_id))
    }
}

/// Reusable containers, one per sandbox id.
///
/// Construct once per process and share it: the internal mutex serializes
/// the ensure/create sequence so concurrent callers for the same sandbox
/// never start duplicate containers.
#[derive(Debug)]
pub struct ContainerPool {
    runtime: String,
    pool: Mutex<HashMap<String, String>>,
}

impl Default for ContainerPool {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerPool {
    /// `runtime` is the container CLI (`docker`, `podman`).
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure the sandbox's container exists and is running.
    ///
    /// Returns the container name and whether an existing container was
    /// reused. Blocking.
    pub fn ensure(&self, spec: &ContainerSpec, sandbox_id: &str) -> SandboxResult<(String, bool)> {
        let mut pool = self
            .pool
            .lock()
            .map_err(|_| SandboxError::unavailable("container pool lock poisoned"))?;
        let name = spec.container_name(sandbox_id);

        match self.inspect_running(&name)? {
            Some(true) => {
                pool.insert(sandbox_id.to_string(), name.clone());
                return Ok((name, true));
            }
            Some(false) => {
                info!(container = %name, "restarting stopped sandbox container");
                self.control(&["start", &name])
                    .map_err(|reason| SandboxError::StartupFailed {
                        resource: name.clone(),
                        reason,
                    })?;
                pool.insert(sandbox_id.to_string(), name.clone());
                return Ok((name, true));
            }
            None => {}
        }

        let workspace = spec.workspace(sandbox_id);
        workspace.ensure()?;
        let host_dir = workspace.root().canonicalize()?;
        let mount = format!("{}:{}", host_dir.display(), VIRTUAL_ROOT);

        info!(container = %name, image = %spec.image, "starting sandbox container");
        let started = self.control(&[
            "run",
            "-d",
            "--name",
            &name,
            "--label",
            MANAGED_LABEL,
            "-v",
            &mount,
            "-w",
            VIRTUAL_ROOT,
            "--entrypoint",
            "sh",
            &spec.image,
            "-c",
            KEEPALIVE,
        ]);
        if let Err(reason) = started {
            // another process may have won the race for this name
            if reason.contains("already in use") {
                warn!(container = %name, "container appeared concurrently, starting it");
                self.control(&["start", &name])
                    .map_err(|reason| SandboxError::StartupFailed {
                        resource: name.clone(),
                        reason,
                    })?;
            } else {
                return Err(SandboxError::StartupFailed {
                    resource: name,
                    reason,
                });
            }
        }

        pool.insert(sandbox_id.to_string(), name.clone());
        Ok((name, false))
    }

    /// Exec into an already ensured container. Blocking.
    pub fn exec(
        &self,
        name: &str,
        command: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> SandboxResult<CommandOutcome> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(["exec", "-w", VIRTUAL_ROOT, name, "sh", "-c", command]);

        info!(container = %name, command, "container exec");
        let start = Instant::now();
        let captured = process::run(cmd, None, timeout, max_output_bytes.saturating_mul(2))?;
        if captured.not_found {
            return Err(SandboxError::unavailable(format!(
                "container runtime '{}' is not installed",
                self.runtime
            )));
        }
        let outcome = CommandOutcome::from_captured(&captured, timeout, max_output_bytes);
        info!(
            container = %name,
            exit_code = outcome.exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "container exec finished"
        );
        Ok(outcome)
    }

    /// Force-remove the sandbox's container. Returns whether one existed.
    pub fn release(&self, spec: &ContainerSpec, sandbox_id: &str) -> SandboxResult<(String, bool)> {
        let mut pool = self
            .pool
            .lock()
            .map_err(|_| SandboxError::unavailable("container pool lock poisoned"))?;
        let name = spec.container_name(sandbox_id);
        pool.remove(sandbox_id);

        let existed = self.inspect_running(&name)?.is_some();
        if existed {
            info!(container = %name, "removing sandbox container");
            self.control(&["rm", "-f", &name])
                .map_err(SandboxError::unavailable)?;
        }
        Ok((name, existed))
    }

    /// Names of the containers this process has ensured.
    pub fn pooled(&self) -> Vec<String> {
        self.pool
            .lock()
            .map(|pool| pool.values().cloned().collect())
            .unwrap_or_default()
    }

    /// `Some(running)` when the container exists, `None` when it does not.
    fn inspect_running(&self, name: &str) -> SandboxResult<Option<bool>> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(["inspect", "--format", "{{.State.Running}}", name]);
        let captured = process::run(cmd, None, CONTROL_TIMEOUT, 64 * 1024)?;
        if captured.not_found {
            return Err(SandboxError::unavailable(format!(
                "container runtime '{}' is not installed",
                self.runtime
            )));
        }
        if captured.timed_out {
            return Err(SandboxError::Timeout {
                operation: format!("{} inspect", self.runtime),
                seconds: CONTROL_TIMEOUT.as_secs(),
            });
        }
        match captured.exit_code {
            Some(0) => Ok(Some(captured.stdout().trim() == "true")),
            _ => Ok(None),
        }
    }

    fn control(&self, args: &[&str]) -> Result<(), String> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(args);
        let captured = process::run(cmd, None, CONTROL_TIMEOUT, 64 * 1024)
            .map_err(|e| format!("{} {}: {}", self.runtime, args[0], e))?;
        if captured.timed_out {
            return Err(format!(
                "{} {} timed out after {}s",
                self.runtime,
                args[0],
                CONTROL_TIMEOUT.as_secs()
            ));
        }
        match captured.exit_code {
            Some(0) => Ok(()),
            Some(EXIT_NOT_FOUND) if captured.not_found => {
                Err(format!("container runtime '{}' is not installed", self.runtime))
            }
            _ => Err(captured.stderr().trim().to_string()),
        }
    }
}
