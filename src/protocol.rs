//! Request and response types for every sandbox operation.
//!
//! The same types travel over the provisioner's HTTP surface and through the
//! in-process dispatch façade, so local, container and cluster callers all
//! see one shape.

use serde::{Deserialize, Serialize};

use crate::identity::SandboxIdentity;
use crate::paths::VIRTUAL_ROOT;

pub const DEFAULT_MAX_DEPTH: usize = 2;
pub const DEFAULT_MAX_ENTRIES: usize = 500;
pub const DEFAULT_MAX_LINES: usize = 2000;
pub const DEFAULT_RELEASE_REASON: &str = "manual";
const MAX_REASON_LEN: usize = 200;

fn default_path() -> String {
    VIRTUAL_ROOT.to_string()
}
fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}
fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}
fn default_max_lines() -> usize {
    DEFAULT_MAX_LINES
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    #[serde(flatten)]
    pub identity: SandboxIdentity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    #[serde(flatten)]
    pub identity: SandboxIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReleaseRequest {
    /// Free-form reason, trimmed and bounded for logging.
    pub fn reason(&self) -> String {
        let reason = self
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_RELEASE_REASON);
        reason.chars().take(MAX_REASON_LEN).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(flatten)]
    pub identity: SandboxIdentity,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(flatten)]
    pub identity: SandboxIdentity,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFileRequest {
    #[serde(flatten)]
    pub identity: SandboxIdentity,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileRequest {
    #[serde(flatten)]
    pub identity: SandboxIdentity,
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceRequest {
    #[serde(flatten)]
    pub identity: SandboxIdentity,
    pub path: String,
    pub old_text: String,
    pub new_text: String,
    #[serde(default)]
    pub replace_all: bool,
}

/// The concrete resource backing a logical sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub thread_id: String,
    pub thread_key: String,
    pub sandbox_id: String,
    pub resource_name: String,
    pub workspace_path: String,
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: bool,
    pub resource_name: String,
    pub sandbox_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(flatten)]
    pub lease: Lease,
    pub output: String,
    pub exit_code: i32,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(flatten)]
    pub lease: Lease,
    pub path: String,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFileResponse {
    #[serde(flatten)]
    pub lease: Lease,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileResponse {
    #[serde(flatten)]
    pub lease: Lease,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceResponse {
    #[serde(flatten)]
    pub lease: Lease,
    pub path: String,
    pub replaced: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub deleted: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub namespace: String,
    pub worker_image: String,
}

/// JSON body of every failed provisioner call.
///
/// `subject` names the action, operation or resource the error is about;
/// `reason` carries the variant's message without its display prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
}

/// Any sandbox operation, dispatched by the façade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SandboxRequest {
    Acquire(AcquireRequest),
    Release(ReleaseRequest),
    Execute(ExecuteRequest),
    #[serde(rename = "ls")]
    List(ListRequest),
    ReadFile(ReadFileRequest),
    WriteFile(WriteFileRequest),
    Replace(ReplaceRequest),
}

impl SandboxRequest {
    pub fn identity(&self) -> &SandboxIdentity {
        match self {
            Self::Acquire(r) => &r.identity,
            Self::Release(r) => &r.identity,
            Self::Execute(r) => &r.identity,
            Self::List(r) => &r.identity,
            Self::ReadFile(r) => &r.identity,
            Self::WriteFile(r) => &r.identity,
            Self::Replace(r) => &r.identity,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Acquire(_) => "acquire",
            Self::Release(_) => "release",
            Self::Execute(_) => "execute",
            Self::List(_) => "ls",
            Self::ReadFile(_) => "read_file",
            Self::WriteFile(_) => "write_file",
            Self::Replace(_) => "replace",
        }
    }
}

/// Result of a dispatched [`SandboxRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SandboxResponse {
    Acquire(Lease),
    Release(ReleaseResponse),
    Execute(ExecuteResponse),
    #[serde(rename = "ls")]
    List(ListResponse),
    ReadFile(ReadFileResponse),
    WriteFile(WriteFileResponse),
    Replace(ReplaceResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_request_defaults() {
        let req: ListRequest = serde_json::from_value(json!({"thread_id": "t"})).unwrap();
        assert_eq!(req.path, "/workspace");
        assert_eq!(req.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(req.max_entries, DEFAULT_MAX_ENTRIES);
        assert_eq!(req.identity.thread_id.as_deref(), Some("t"));
    }

    #[test]
    fn test_tagged_request() {
        let req: SandboxRequest = serde_json::from_value(json!({
            "op": "ls",
            "sandbox_id": "s1",
            "path": "/workspace/src",
            "max_depth": 0
        }))
        .unwrap();
        assert_eq!(req.name(), "ls");
        assert_eq!(req.identity().sandbox_id.as_deref(), Some("s1"));
        match req {
            SandboxRequest::List(list) => assert_eq!(list.max_depth, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_execute_response_flattens_lease() {
        let resp = ExecuteResponse {
            lease: Lease {
                thread_id: "t".into(),
                thread_key: "t".into(),
                sandbox_id: "t".into(),
                resource_name: "agent-sandbox-abc".into(),
                workspace_path: "/workspace".into(),
                reused: true,
            },
            output: "ok".into(),
            exit_code: 0,
            truncated: false,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["resource_name"], "agent-sandbox-abc");
        assert_eq!(value["reused"], true);
        assert_eq!(value["output"], "ok");
    }

    #[test]
    fn test_release_reason_is_bounded() {
        let req = ReleaseRequest {
            reason: Some("x".repeat(1000)),
            ..Default::default()
        };
        assert_eq!(req.reason().len(), 200);
        assert_eq!(ReleaseRequest::default().reason(), DEFAULT_RELEASE_REASON);
    }
}
