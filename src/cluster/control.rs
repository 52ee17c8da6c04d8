//! The cluster control plane, seen through a handful of pod operations.
//!
//! [`Kubectl`] drives a real cluster through the `kubectl` CLI. All methods
//! block; the provisioner calls them from `spawn_blocking`.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{SandboxError, SandboxResult};
use crate::process::{self, Captured};

/// Deadline for control calls (get/create/delete/annotate).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
const CONTROL_CAPTURE_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Pods in these phases never run commands again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// The parts of a pod object the provisioner looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub phase: PodPhase,
    pub ready: bool,
    /// A deletion timestamp is set; the pod is on its way out.
    pub deleting: bool,
    pub annotations: BTreeMap<String, String>,
}

impl PodInfo {
    pub fn from_json(value: &Value) -> SandboxResult<Self> {
        let name = value["metadata"]["name"]
            .as_str()
            .ok_or_else(|| SandboxError::invalid_response("pod object has no metadata.name"))?
            .to_string();
        let phase = PodPhase::parse(value["status"]["phase"].as_str().unwrap_or_default());
        let ready = value["status"]["conditions"]
            .as_array()
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c["type"] == "Ready" && c["status"] == "True")
            })
            .unwrap_or(false);
        let deleting = !value["metadata"]["deletionTimestamp"].is_null();
        let annotations = value["metadata"]["annotations"]
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name,
            phase,
            ready,
            deleting,
            annotations,
        })
    }

    /// Gone for good: finished, failed, or being deleted.
    pub fn is_terminal(&self) -> bool {
        self.deleting || self.phase.is_terminal()
    }

    pub fn is_ready(&self) -> bool {
        !self.is_terminal() && self.phase == PodPhase::Running && self.ready
    }

    /// Unix seconds of the last recorded use. `None` when the annotation is
    /// missing, unparsable or not positive.
    pub fn last_used(&self) -> Option<i64> {
        self.annotations
            .get(super::ANNOTATION_LAST_USED)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|ts| ts.is_finite() && *ts > 0.0)
            .map(|ts| ts as i64)
    }
}

/// Pod operations the provisioner needs from a cluster.
pub trait ControlPlane: Send + Sync + 'static {
    /// `None` when the pod does not exist.
    fn get_pod(&self, name: &str) -> SandboxResult<Option<PodInfo>>;

    /// Create from a manifest. Creating a pod that already exists is not an error.
    fn create_pod(&self, manifest: &Value) -> SandboxResult<()>;

    /// Delete if present; with `wait`, return only once it is gone.
    fn delete_pod(&self, name: &str, wait: bool) -> SandboxResult<()>;

    fn list_pods(&self, selector: &str) -> SandboxResult<Vec<PodInfo>>;

    /// Merge annotations into the pod, overwriting existing keys.
    fn annotate_pod(&self, name: &str, annotations: &BTreeMap<String, String>) -> SandboxResult<()>;

    /// Run `argv` in a container of the pod.
    ///
    /// Command failures come back in the capture; only failures to reach the
    /// pod at all are errors.
    fn exec(
        &self,
        pod: &str,
        container: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
        capture_limit: usize,
    ) -> SandboxResult<Captured>;
}

/// [`ControlPlane`] backed by the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
    context: Option<String>,
    namespace: String,
}

impl Kubectl {
    pub fn new(binary: impl Into<String>, context: Option<String>, namespace: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            context,
            namespace: namespace.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        cmd.arg("--namespace").arg(&self.namespace);
        cmd
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> SandboxResult<Captured> {
        let mut cmd = self.command();
        cmd.args(args);
        debug!(args = ?args, "kubectl");
        let captured = process::run(cmd, stdin, CONTROL_TIMEOUT, CONTROL_CAPTURE_LIMIT)?;
        self.check_reachable(&captured, args.first().copied().unwrap_or("kubectl"), CONTROL_TIMEOUT)?;
        Ok(captured)
    }

    /// Run and require exit 0, turning stderr into the error message.
    fn run_ok(&self, args: &[&str], stdin: Option<&[u8]>) -> SandboxResult<Captured> {
        let captured = self.run(args, stdin)?;
        if captured.exit_code != Some(0) {
            return Err(SandboxError::unavailable(format!(
                "kubectl {} failed: {}",
                args.first().copied().unwrap_or_default(),
                captured.stderr().trim()
            )));
        }
        Ok(captured)
    }

    fn check_reachable(&self, captured: &Captured, verb: &str, timeout: Duration) -> SandboxResult<()> {
        if captured.not_found {
            return Err(SandboxError::unavailable(format!(
                "kubectl binary '{}' is not installed",
                self.binary
            )));
        }
        if captured.timed_out {
            return Err(SandboxError::Timeout {
                operation: format!("kubectl {}", verb),
                seconds: timeout.as_secs(),
            });
        }
        Ok(())
    }
}

fn parse_json(captured: &Captured) -> SandboxResult<Value> {
    serde_json::from_str(&captured.stdout())
        .map_err(|e| SandboxError::invalid_response(format!("kubectl returned invalid JSON: {}", e)))
}

impl ControlPlane for Kubectl {
    fn get_pod(&self, name: &str) -> SandboxResult<Option<PodInfo>> {
        let captured = self.run_ok(&["get", "pod", name, "-o", "json", "--ignore-not-found"], None)?;
        if captured.stdout().trim().is_empty() {
            return Ok(None);
        }
        PodInfo::from_json(&parse_json(&captured)?).map(Some)
    }

    fn create_pod(&self, manifest: &Value) -> SandboxResult<()> {
        let body = serde_json::to_vec(manifest)
            .map_err(|e| SandboxError::invalid_request(format!("unserializable manifest: {}", e)))?;
        let captured = self.run(&["create", "-f", "-"], Some(&body))?;
        match captured.exit_code {
            Some(0) => Ok(()),
            _ if captured.stderr().contains("AlreadyExists") => {
                info!("pod already exists, reusing");
                Ok(())
            }
            _ => Err(SandboxError::unavailable(format!(
                "kubectl create failed: {}",
                captured.stderr().trim()
            ))),
        }
    }

    fn delete_pod(&self, name: &str, wait: bool) -> SandboxResult<()> {
        let wait = format!("--wait={}", wait);
        self.run_ok(&["delete", "pod", name, "--ignore-not-found", &wait], None)?;
        Ok(())
    }

    fn list_pods(&self, selector: &str) -> SandboxResult<Vec<PodInfo>> {
        let captured = self.run_ok(&["get", "pods", "-l", selector, "-o", "json"], None)?;
        let value = parse_json(&captured)?;
        value["items"]
            .as_array()
            .ok_or_else(|| SandboxError::invalid_response("pod list has no items"))?
            .iter()
            .map(PodInfo::from_json)
            .collect()
    }

    fn annotate_pod(&self, name: &str, annotations: &BTreeMap<String, String>) -> SandboxResult<()> {
        let pairs: Vec<String> = annotations.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args = vec!["annotate", "pod", name, "--overwrite"];
        args.extend(pairs.iter().map(String::as_str));
        self.run_ok(&args, None)?;
        Ok(())
    }

    fn exec(
        &self,
        pod: &str,
        container: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
        capture_limit: usize,
    ) -> SandboxResult<Captured> {
        let mut cmd = self.command();
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.args([pod, "-c", container, "--"]).args(argv);
        let captured = process::run(cmd, stdin, timeout, capture_limit)?;
        if captured.not_found {
            return Err(SandboxError::unavailable(format!(
                "kubectl binary '{}' is not installed",
                self.binary
            )));
        }
        Ok(captured)
    }
}
