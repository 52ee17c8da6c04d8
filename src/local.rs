//! Local backend: commands run as direct child processes of this one.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::SandboxResult;
use crate::process::{self, CommandOutcome};
use crate::workspace::HostWorkspace;

/// Shell used to interpret agent commands.
pub const SHELL: &str = "sh";

/// Runs commands in per-identifier directories under one host root.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    workspace_root: PathBuf,
}

impl LocalBackend {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    /// Workspace for a resolved sandbox id; created lazily on first use.
    pub fn workspace(&self, sandbox_id: &str) -> HostWorkspace {
        HostWorkspace::new(self.workspace_root.join(sandbox_id))
    }

    /// Run `command` through the shell inside the sandbox's directory.
    ///
    /// Blocks until the command exits or `timeout` expires. Ordinary command
    /// failures are reported through the exit code, not as errors.
    pub fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> SandboxResult<CommandOutcome> {
        let workspace = self.workspace(sandbox_id);
        workspace.ensure()?;
        run_shell(workspace.root(), command, timeout, max_output_bytes)
    }
}

fn run_shell(
    dir: &Path,
    command: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> SandboxResult<CommandOutcome> {
    let mut cmd = Command::new(SHELL);
    cmd.arg("-c").arg(command).current_dir(dir).env("PWD", dir);

    info!(dir = ?dir, command, "local exec");
    let start = Instant::now();
    let captured = process::run(cmd, None, timeout, max_output_bytes.saturating_mul(2))?;
    let outcome = CommandOutcome::from_captured(&captured, timeout, max_output_bytes);
    info!(
        exit_code = outcome.exit_code,
        truncated = outcome.truncated,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "local exec finished"
    );
    Ok(outcome)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::output::{EXIT_NOT_FOUND, EXIT_TIMEOUT, NO_OUTPUT};

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn test_runs_in_workspace_dir() {
        let (dir, backend) = backend();
        let out = backend
            .execute("t1", "pwd", Duration::from_secs(5), 4096)
            .unwrap();
        assert_eq!(out.exit_code, 0);
        let expected = dir.path().join("t1").canonicalize().unwrap();
        assert_eq!(
            Path::new(out.output.trim()).canonicalize().unwrap(),
            expected
        );
    }

    #[test]
    fn test_state_persists_between_calls() {
        let (_dir, backend) = backend();
        backend
            .execute("t1", "echo hi > note.txt", Duration::from_secs(5), 4096)
            .unwrap();
        let out = backend
            .execute("t1", "cat note.txt", Duration::from_secs(5), 4096)
            .unwrap();
        assert_eq!(out.output, "hi");
    }

    #[test]
    fn test_stderr_prefixed_and_exit_code_kept() {
        let (_dir, backend) = backend();
        let out = backend
            .execute("t1", "echo oops 1>&2; exit 2", Duration::from_secs(5), 4096)
            .unwrap();
        assert_eq!(out.exit_code, 2);
        assert_eq!(out.output, "[stderr] oops");
    }

    #[test]
    fn test_empty_output() {
        let (_dir, backend) = backend();
        let out = backend.execute("t1", "true", Duration::from_secs(5), 4096).unwrap();
        assert_eq!(out.output, NO_OUTPUT);
    }

    #[test]
    fn test_single_long_line_keeps_a_prefix() {
        let (_dir, backend) = backend();
        let out = backend
            .execute("t1", "head -c 5000 /dev/zero | tr '\\0' x", Duration::from_secs(5), 256)
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.truncated);
        assert_ne!(out.output, NO_OUTPUT);
        assert!(out.output.starts_with("xxxxxxxx"));
        assert!(out.output.len() <= 256);
    }

    #[test]
    fn test_timeout_returns_124_quickly() {
        let (_dir, backend) = backend();
        let start = Instant::now();
        let out = backend
            .execute("t1", "sleep 100", Duration::from_secs(1), 4096)
            .unwrap();
        assert_eq!(out.exit_code, EXIT_TIMEOUT);
        assert!(out.output.contains("1 seconds"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_command_is_127() {
        let (_dir, backend) = backend();
        let out = backend
            .execute("t1", "no-such-tool-abc --version", Duration::from_secs(5), 4096)
            .unwrap();
        assert_eq!(out.exit_code, EXIT_NOT_FOUND);
    }

    #[test]
    fn test_output_is_capped() {
        let (_dir, backend) = backend();
        let out = backend
            .execute("t1", "seq 1 100000", Duration::from_secs(10), 256)
            .unwrap();
        assert!(out.truncated);
        assert!(out.output.len() <= 256);
    }
}
