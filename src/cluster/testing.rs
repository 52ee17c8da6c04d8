//! In-memory control plane for tests.
//!
//! Pods are map entries; each pod's workspace is a temp directory. Shell
//! execs run on the host inside that directory, and file-op execs are served
//! by [`HostWorkspace`] so the reply format matches the in-pod script.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use super::control::{ControlPlane, PodInfo, PodPhase};
use super::script::{FileOp, FilePayload, INTERPRETER};
use super::ANNOTATION_LAST_USED;
use crate::error::{SandboxError, SandboxResult};
use crate::process::{self, Captured};
use crate::workspace::HostWorkspace;

pub(crate) struct FakeCluster {
    root: tempfile::TempDir,
    pods: Mutex<BTreeMap<String, PodInfo>>,
    creates: AtomicUsize,
    pending: AtomicBool,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            pods: Mutex::new(BTreeMap::new()),
            creates: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn pod(&self, name: &str) -> Option<PodInfo> {
        self.pods.lock().unwrap().get(name).cloned()
    }

    /// New pods stay Pending forever.
    pub fn start_pending(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn set_phase(&self, name: &str, phase: PodPhase) {
        if let Some(pod) = self.pods.lock().unwrap().get_mut(name) {
            pod.phase = phase;
            pod.ready = phase == PodPhase::Running;
        }
    }

    pub fn stamp(&self, name: &str, ts: &str) {
        if let Some(pod) = self.pods.lock().unwrap().get_mut(name) {
            pod.annotations
                .insert(ANNOTATION_LAST_USED.to_string(), ts.to_string());
        }
    }

    fn workspace(&self, pod: &str) -> HostWorkspace {
        HostWorkspace::new(self.root.path().join(pod))
    }

    fn file_op(&self, pod: &str, payload: FilePayload) -> Value {
        let ws = self.workspace(pod);
        let result = match payload.op {
            FileOp::List {
                path,
                max_depth,
                max_entries,
            } => ws
                .list(&path, max_depth, max_entries)
                .map(|entries| json!({ "entries": entries })),
            FileOp::ReadFile {
                path,
                start_line,
                end_line,
                max_lines,
            } => ws
                .read(&path, start_line, end_line, max_lines)
                .map(|content| json!({ "content": content })),
            FileOp::WriteFile {
                path,
                content,
                append,
            } => ws
                .write(&path, &content, append)
                .map(|path| json!({ "path": path })),
            FileOp::Replace {
                path,
                old_text,
                new_text,
                replace_all,
            } => ws
                .replace(&path, &old_text, &new_text, replace_all)
                .map(|replaced| json!({ "replaced": replaced })),
        };
        match result {
            Ok(mut reply) => {
                reply["ok"] = json!(true);
                reply
            }
            Err(e) => {
                let kind = match e.kind() {
                    "path_traversal" | "path_invalid" => e.kind(),
                    _ => "action",
                };
                let error = match e {
                    SandboxError::ActionFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                json!({ "ok": false, "error": error, "kind": kind })
            }
        }
    }
}

impl ControlPlane for FakeCluster {
    fn get_pod(&self, name: &str) -> SandboxResult<Option<PodInfo>> {
        Ok(self.pod(name))
    }

    fn create_pod(&self, manifest: &Value) -> SandboxResult<()> {
        let mut pod = PodInfo::from_json(manifest)?;
        let mut pods = self.pods.lock().unwrap();
        if pods.contains_key(&pod.name) {
            return Ok(());
        }
        if self.pending.load(Ordering::SeqCst) {
            pod.phase = PodPhase::Pending;
            pod.ready = false;
        } else {
            pod.phase = PodPhase::Running;
            pod.ready = true;
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        pods.insert(pod.name.clone(), pod);
        Ok(())
    }

    fn delete_pod(&self, name: &str, _wait: bool) -> SandboxResult<()> {
        if self.pods.lock().unwrap().remove(name).is_some() {
            let _ = std::fs::remove_dir_all(self.root.path().join(name));
        }
        Ok(())
    }

    fn list_pods(&self, _selector: &str) -> SandboxResult<Vec<PodInfo>> {
        Ok(self.pods.lock().unwrap().values().cloned().collect())
    }

    fn annotate_pod(&self, name: &str, annotations: &BTreeMap<String, String>) -> SandboxResult<()> {
        let mut pods = self.pods.lock().unwrap();
        let pod = pods
            .get_mut(name)
            .ok_or_else(|| SandboxError::unavailable(format!("pod {} not found", name)))?;
        pod.annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn exec(
        &self,
        pod: &str,
        _container: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
        capture_limit: usize,
    ) -> SandboxResult<Captured> {
        if !self.pod(pod).is_some_and(|p| p.is_ready()) {
            return Err(SandboxError::unavailable(format!("pod {} is not running", pod)));
        }
        let ws = self.workspace(pod);
        ws.ensure()?;

        if argv.first().map(String::as_str) == Some(INTERPRETER) {
            let payload: FilePayload = serde_json::from_slice(stdin.unwrap_or_default())
                .map_err(|e| SandboxError::invalid_request(e.to_string()))?;
            let reply = self.file_op(pod, payload);
            return Ok(Captured::from_output(&reply.to_string(), "", 0));
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(ws.root());
        Ok(process::run(cmd, stdin, timeout, capture_limit)?)
    }
}
