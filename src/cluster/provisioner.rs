//! Pod lifecycle and command/file operations for cluster sandboxes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use super::config::ProvisionerConfig;
use super::control::ControlPlane;
use super::manifest::pod_manifest;
use super::reaper::idle_candidates;
use super::script::{self, FileOp, FilePayload, ListReply, ReadReply, ReplaceReply, WriteReply};
use super::{
    managed_selector, ANNOTATION_LAST_USED, ANNOTATION_SANDBOX_ID, ANNOTATION_THREAD_ID,
    ANNOTATION_THREAD_KEY,
};
use crate::error::{SandboxError, SandboxResult};
use crate::guard;
use crate::identity::{derive_resource_name, ResolvedIdentity, SandboxIdentity};
use crate::paths::{self, VIRTUAL_ROOT};
use crate::process::CommandOutcome;
use crate::protocol::{
    CleanupResponse, ExecuteRequest, ExecuteResponse, HealthResponse, Lease, ListRequest,
    ListResponse, ReadFileRequest, ReadFileResponse, ReleaseRequest, ReleaseResponse,
    ReplaceRequest, ReplaceResponse, WriteFileRequest, WriteFileResponse,
};

/// How often a starting pod is polled for readiness.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Retained output of a file-op reply; read windows can be large.
const FILE_OP_CAPTURE_LIMIT: usize = 16 * 1024 * 1024;

pub const SERVICE_NAME: &str = "agent-sandbox-provisioner";

pub struct Provisioner {
    config: ProvisionerConfig,
    control: Arc<dyn ControlPlane>,
}

impl Provisioner {
    pub fn new(config: ProvisionerConfig, control: Arc<dyn ControlPlane>) -> Self {
        Self { config, control }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn pod_name(&self, sandbox_id: &str) -> String {
        derive_resource_name(sandbox_id, &self.config.name_prefix)
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            service: SERVICE_NAME.to_string(),
            namespace: self.config.namespace.clone(),
            worker_image: self.config.worker_image.clone(),
        }
    }

    /// Run a control-plane call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> SandboxResult<T>
    where
        F: FnOnce(&dyn ControlPlane) -> SandboxResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let control = Arc::clone(&self.control);
        tokio::task::spawn_blocking(move || f(control.as_ref())).await?
    }

    /// Get-or-create the sandbox's pod, wait until it is ready and mark it used.
    pub async fn acquire(&self, identity: &SandboxIdentity) -> SandboxResult<Lease> {
        let identity = identity.resolve()?;
        let name = self.pod_name(&identity.sandbox_id);

        let existing = {
            let name = name.clone();
            self.blocking(move |c| c.get_pod(&name)).await?
        };
        let existing = match existing {
            Some(pod) if pod.is_terminal() => {
                info!(pod = %name, phase = ?pod.phase, deleting = pod.deleting, "replacing terminal sandbox pod");
                let name = name.clone();
                self.blocking(move |c| c.delete_pod(&name, true)).await?;
                None
            }
            other => other,
        };

        let reused = existing.is_some();
        if !reused {
            info!(pod = %name, sandbox_id = %identity.sandbox_id, image = %self.config.worker_image, "creating sandbox pod");
            let manifest = pod_manifest(&self.config, &name, &identity);
            self.blocking(move |c| c.create_pod(&manifest)).await?;
        }

        self.wait_ready(&name).await?;
        self.touch(&name, &identity).await?;

        Ok(Lease {
            thread_id: identity.thread_id,
            thread_key: identity.thread_key,
            sandbox_id: identity.sandbox_id,
            resource_name: name,
            workspace_path: self.config.workspace_dir.clone(),
            reused,
        })
    }

    async fn wait_ready(&self, name: &str) -> SandboxResult<()> {
        let timeout = self.config.startup_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let pod = {
                let name = name.to_string();
                self.blocking(move |c| c.get_pod(&name)).await?
            };
            match pod {
                Some(pod) if pod.is_ready() => return Ok(()),
                Some(pod) if pod.is_terminal() => {
                    return Err(SandboxError::StartupFailed {
                        resource: name.to_string(),
                        reason: format!("pod entered phase {:?} while starting", pod.phase),
                    })
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(SandboxError::Timeout {
                    operation: format!("startup of pod {}", name),
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stamp last-used time and identity annotations.
    async fn touch(&self, name: &str, identity: &ResolvedIdentity) -> SandboxResult<()> {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_LAST_USED.to_string(), Utc::now().timestamp().to_string());
        annotations.insert(ANNOTATION_THREAD_ID.to_string(), identity.thread_id.clone());
        annotations.insert(ANNOTATION_THREAD_KEY.to_string(), identity.thread_key.clone());
        annotations.insert(ANNOTATION_SANDBOX_ID.to_string(), identity.sandbox_id.clone());
        let name = name.to_string();
        self.blocking(move |c| c.annotate_pod(&name, &annotations)).await
    }

    /// Delete the sandbox's pod if it exists. Does not wait for termination.
    pub async fn release(&self, request: &ReleaseRequest) -> SandboxResult<ReleaseResponse> {
        let identity = request.identity.resolve()?;
        let name = self.pod_name(&identity.sandbox_id);
        let reason = request.reason();

        let released = {
            let name = name.clone();
            self.blocking(move |c| {
                if c.get_pod(&name)?.is_none() {
                    return Ok(false);
                }
                c.delete_pod(&name, false)?;
                Ok(true)
            })
            .await?
        };
        info!(pod = %name, sandbox_id = %identity.sandbox_id, reason = %reason, released, "release");

        Ok(ReleaseResponse {
            released,
            resource_name: name,
            sandbox_id: identity.sandbox_id,
            reason,
        })
    }

    pub async fn execute(&self, request: &ExecuteRequest) -> SandboxResult<ExecuteResponse> {
        guard::check_command(&request.command)?;
        let lease = self.acquire(&request.identity).await?;

        let timeout = self.config.exec_timeout(request.timeout_seconds);
        let budget = self.config.output_budget(request.max_output_bytes);
        let argv = vec!["sh".to_string(), "-c".to_string(), request.command.clone()];

        info!(pod = %lease.resource_name, command = %request.command, timeout_secs = timeout.as_secs(), "pod exec");
        let start = Instant::now();
        let captured = {
            let pod = lease.resource_name.clone();
            let container = self.config.container_name.clone();
            self.blocking(move |c| {
                c.exec(&pod, &container, &argv, None, timeout, budget.saturating_mul(2))
            })
            .await?
        };
        let outcome = CommandOutcome::from_captured(&captured, timeout, budget);
        info!(
            pod = %lease.resource_name,
            exit_code = outcome.exit_code,
            truncated = outcome.truncated,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pod exec finished"
        );

        Ok(ExecuteResponse {
            lease,
            output: outcome.output,
            exit_code: outcome.exit_code,
            truncated: outcome.truncated,
        })
    }

    /// Run one file op through the in-pod script.
    async fn file_op<T>(&self, identity: &SandboxIdentity, op: FileOp) -> SandboxResult<(Lease, T)>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        // reject bad paths before touching the cluster
        paths::normalize(op.path())?;
        let lease = self.acquire(identity).await?;

        let timeout = self.config.file_op_timeout();
        let payload = FilePayload {
            op,
            root: self.config.workspace_dir.clone(),
            virtual_root: VIRTUAL_ROOT.to_string(),
        };
        let stdin = payload.to_bytes()?;
        let action = payload.op.name();

        let captured = {
            let pod = lease.resource_name.clone();
            let container = self.config.container_name.clone();
            self.blocking(move |c| {
                c.exec(&pod, &container, &script::argv(), Some(&stdin), timeout, FILE_OP_CAPTURE_LIMIT)
            })
            .await?
        };
        if captured.timed_out {
            warn!(pod = %lease.resource_name, action, "file op timed out");
            return Err(SandboxError::Timeout {
                operation: action.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        let reply = script::parse_reply(&payload.op, &captured)?;
        Ok((lease, reply))
    }

    pub async fn list(&self, request: &ListRequest) -> SandboxResult<ListResponse> {
        let op = FileOp::List {
            path: request.path.clone(),
            max_depth: request.max_depth,
            max_entries: request.max_entries,
        };
        let (lease, reply): (_, ListReply) = self.file_op(&request.identity, op).await?;
        Ok(ListResponse {
            lease,
            path: paths::normalize(&request.path)?,
            entries: reply.entries,
        })
    }

    pub async fn read_file(&self, request: &ReadFileRequest) -> SandboxResult<ReadFileResponse> {
        let op = FileOp::ReadFile {
            path: request.path.clone(),
            start_line: request.start_line,
            end_line: request.end_line,
            max_lines: request.max_lines,
        };
        let (lease, reply): (_, ReadReply) = self.file_op(&request.identity, op).await?;
        Ok(ReadFileResponse {
            lease,
            path: paths::normalize(&request.path)?,
            content: reply.content,
        })
    }

    pub async fn write_file(&self, request: &WriteFileRequest) -> SandboxResult<WriteFileResponse> {
        let op = FileOp::WriteFile {
            path: request.path.clone(),
            content: request.content.clone(),
            append: request.append,
        };
        let (lease, reply): (_, WriteReply) = self.file_op(&request.identity, op).await?;
        Ok(WriteFileResponse {
            lease,
            path: reply.path,
        })
    }

    pub async fn replace(&self, request: &ReplaceRequest) -> SandboxResult<ReplaceResponse> {
        let op = FileOp::Replace {
            path: request.path.clone(),
            old_text: request.old_text.clone(),
            new_text: request.new_text.clone(),
            replace_all: request.replace_all,
        };
        let (lease, reply): (_, ReplaceReply) = self.file_op(&request.identity, op).await?;
        Ok(ReplaceResponse {
            lease,
            path: paths::normalize(&request.path)?,
            replaced: reply.replaced,
        })
    }

    /// Delete managed pods idle for longer than the configured timeout.
    pub async fn cleanup_idle(&self) -> SandboxResult<CleanupResponse> {
        self.cleanup_idle_at(Utc::now().timestamp()).await
    }

    pub async fn cleanup_idle_at(&self, now: i64) -> SandboxResult<CleanupResponse> {
        let idle_timeout = self.config.idle_timeout_secs;
        let deleted = self
            .blocking(move |c| {
                let pods = c.list_pods(&managed_selector())?;
                let mut deleted = Vec::new();
                for name in idle_candidates(&pods, now, idle_timeout) {
                    match c.delete_pod(&name, false) {
                        Ok(()) => deleted.push(name),
                        Err(e) => warn!(pod = %name, error = %e, "failed to delete idle pod"),
                    }
                }
                Ok(deleted)
            })
            .await?;
        Ok(CleanupResponse {
            count: deleted.len(),
            deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::control::PodPhase;
    use crate::cluster::testing::FakeCluster;
    use crate::output::{EXIT_TIMEOUT, NO_OUTPUT};

    fn provisioner() -> (Arc<FakeCluster>, Provisioner) {
        let fake = Arc::new(FakeCluster::new());
        let config = ProvisionerConfig {
            startup_timeout_secs: 2,
            ..Default::default()
        };
        let provisioner = Provisioner::new(config, fake.clone());
        (fake, provisioner)
    }

    fn execute(command: &str) -> ExecuteRequest {
        ExecuteRequest {
            identity: SandboxIdentity::for_thread("Thread One"),
            command: command.into(),
            timeout_seconds: None,
            max_output_bytes: None,
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_then_reuses() {
        let (fake, provisioner) = provisioner();
        let identity = SandboxIdentity::for_thread("Thread One");

        let first = provisioner.acquire(&identity).await.unwrap();
        assert!(!first.reused);
        assert_eq!(first.thread_key, "thread-one");
        assert_eq!(first.workspace_path, "/workspace");
        assert_eq!(fake.creates(), 1);

        let second = provisioner.acquire(&identity).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.resource_name, first.resource_name);
        assert_eq!(fake.creates(), 1);

        let pod = fake.pod(&first.resource_name).unwrap();
        assert!(pod.last_used().is_some());
        assert_eq!(pod.annotations[ANNOTATION_THREAD_ID], "Thread One");
    }

    #[tokio::test]
    async fn test_terminal_pod_is_replaced() {
        let (fake, provisioner) = provisioner();
        let identity = SandboxIdentity::for_sandbox("box");
        let lease = provisioner.acquire(&identity).await.unwrap();

        fake.set_phase(&lease.resource_name, PodPhase::Failed);
        let again = provisioner.acquire(&identity).await.unwrap();
        assert!(!again.reused);
        assert_eq!(fake.creates(), 2);
    }

    #[tokio::test]
    async fn test_pod_that_never_starts_times_out() {
        let (fake, provisioner) = provisioner();
        fake.start_pending();
        let err = provisioner
            .acquire(&SandboxIdentity::for_sandbox("slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_identity_rejected() {
        let (fake, provisioner) = provisioner();
        let err = provisioner.acquire(&SandboxIdentity::default()).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest { .. }));
        assert_eq!(fake.creates(), 0);
    }

    #[tokio::test]
    async fn test_execute_runs_in_workspace() {
        let (_fake, provisioner) = provisioner();
        let resp = provisioner.execute(&execute("echo hi > a.txt && cat a.txt")).await.unwrap();
        assert_eq!(resp.exit_code, 0);
        assert_eq!(resp.output, "hi");
        assert!(!resp.truncated);

        let resp = provisioner.execute(&execute("true")).await.unwrap();
        assert_eq!(resp.output, NO_OUTPUT);
        assert!(resp.lease.reused);
    }

    #[tokio::test]
    async fn test_execute_timeout_and_refusal() {
        let (fake, provisioner) = provisioner();
        let mut req = execute("sleep 30");
        req.timeout_seconds = Some(1);
        let resp = provisioner.execute(&req).await.unwrap();
        assert_eq!(resp.exit_code, EXIT_TIMEOUT);

        let err = provisioner.execute(&execute("npm run dev")).await.unwrap_err();
        assert!(matches!(err, SandboxError::CommandRefused { .. }));
        assert_eq!(fake.creates(), 1);
    }

    #[tokio::test]
    async fn test_file_ops_round_trip() {
        let (_fake, provisioner) = provisioner();
        let identity = SandboxIdentity::for_thread("files");

        let written = provisioner
            .write_file(&WriteFileRequest {
                identity: identity.clone(),
                path: "/workspace/src/app.py".into(),
                content: "print('a')\nprint('a')\n".into(),
                append: false,
            })
            .await
            .unwrap();
        assert_eq!(written.path, "/workspace/src/app.py");

        let replaced = provisioner
            .replace(&ReplaceRequest {
                identity: identity.clone(),
                path: "/workspace/src/app.py".into(),
                old_text: "'a'".into(),
                new_text: "'b'".into(),
                replace_all: true,
            })
            .await
            .unwrap();
        assert_eq!(replaced.replaced, 2);

        let read = provisioner
            .read_file(&ReadFileRequest {
                identity: identity.clone(),
                path: "/workspace/src/app.py".into(),
                start_line: Some(2),
                end_line: None,
                max_lines: 10,
            })
            .await
            .unwrap();
        assert_eq!(read.content, "2|print('b')");

        let listed = provisioner
            .list(&ListRequest {
                identity,
                path: "/workspace".into(),
                max_depth: 1,
                max_entries: 10,
            })
            .await
            .unwrap();
        assert_eq!(listed.entries, vec!["/workspace/src/", "/workspace/src/app.py"]);
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_acquire() {
        let (fake, provisioner) = provisioner();
        let err = provisioner
            .read_file(&ReadFileRequest {
                identity: SandboxIdentity::for_thread("t"),
                path: "/workspace/../etc/passwd".into(),
                start_line: None,
                end_line: None,
                max_lines: 10,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "path_traversal");
        assert_eq!(fake.creates(), 0);
    }

    #[tokio::test]
    async fn test_release() {
        let (fake, provisioner) = provisioner();
        let identity = SandboxIdentity::for_thread("t");
        let lease = provisioner.acquire(&identity).await.unwrap();

        let request = ReleaseRequest {
            identity: identity.clone(),
            reason: Some("  done  ".into()),
        };
        let resp = provisioner.release(&request).await.unwrap();
        assert!(resp.released);
        assert_eq!(resp.reason, "done");
        assert!(fake.pod(&lease.resource_name).is_none());

        let resp = provisioner.release(&request).await.unwrap();
        assert!(!resp.released);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_idle() {
        let (fake, provisioner) = provisioner();
        let old = provisioner.acquire(&SandboxIdentity::for_sandbox("old")).await.unwrap();
        let fresh = provisioner.acquire(&SandboxIdentity::for_sandbox("fresh")).await.unwrap();
        fake.stamp(&old.resource_name, "1000");

        let now = Utc::now().timestamp();
        let report = provisioner.cleanup_idle_at(now).await.unwrap();
        assert_eq!(report.deleted, vec![old.resource_name.clone()]);
        assert_eq!(report.count, 1);
        assert!(fake.pod(&old.resource_name).is_none());
        assert!(fake.pod(&fresh.resource_name).is_some());
    }
}
