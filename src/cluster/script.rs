//! One-shot file operations run inside a sandbox pod.
//!
//! Each call execs `python3 -c <SCRIPT>` in the worker container and feeds a
//! JSON payload on stdin. The script answers with a single JSON object,
//! `{"ok": true, ...}` or `{"ok": false, "error": ..., "kind": ...}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PathError, SandboxError, SandboxResult};
use crate::process::Captured;

pub const SCRIPT: &str = include_str!("worker_op.py");

/// Interpreter the worker image must provide.
pub const INTERPRETER: &str = "python3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    #[serde(rename = "ls")]
    List {
        path: String,
        max_depth: usize,
        max_entries: usize,
    },
    ReadFile {
        path: String,
        start_line: Option<usize>,
        end_line: Option<usize>,
        max_lines: usize,
    },
    WriteFile {
        path: String,
        content: String,
        append: bool,
    },
    Replace {
        path: String,
        old_text: String,
        new_text: String,
        replace_all: bool,
    },
}

impl FileOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::List { .. } => "ls",
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::Replace { .. } => "replace",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::List { path, .. }
            | Self::ReadFile { path, .. }
            | Self::WriteFile { path, .. }
            | Self::Replace { path, .. } => path,
        }
    }
}

/// What goes down the pipe: the op plus where the workspace is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    #[serde(flatten)]
    pub op: FileOp,
    /// Mount path inside the container.
    pub root: String,
    /// Prefix agents address the workspace by.
    pub virtual_root: String,
}

impl FilePayload {
    pub fn to_bytes(&self) -> SandboxResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SandboxError::invalid_request(format!("unserializable file op: {}", e)))
    }
}

pub fn argv() -> Vec<String> {
    vec![INTERPRETER.to_string(), "-c".to_string(), SCRIPT.to_string()]
}

#[derive(Debug, Deserialize)]
pub struct ListReply {
    pub entries: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadReply {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteReply {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceReply {
    pub replaced: usize,
}

/// Decode the script's answer for `op`.
///
/// A non-zero exit with no JSON (interpreter missing, script crashed) is an
/// action failure carrying stderr; anything that is not a JSON object is an
/// invalid response.
pub fn parse_reply<T: DeserializeOwned>(op: &FileOp, captured: &Captured) -> SandboxResult<T> {
    let action = op.name();
    let stdout = captured.stdout();
    let value: Value = match serde_json::from_str(stdout.trim()) {
        Ok(value) => value,
        Err(_) if captured.exit_code != Some(0) => {
            let stderr = captured.stderr();
            let reason = match stderr.trim() {
                "" => match captured.exit_code {
                    Some(code) => format!("worker exited with code {}", code),
                    None => "worker was killed by a signal".to_string(),
                },
                msg => msg.to_string(),
            };
            return Err(SandboxError::action(action, reason));
        }
        Err(e) => {
            return Err(SandboxError::invalid_response(format!(
                "{} reply is not JSON: {}",
                action, e
            )))
        }
    };

    let Value::Object(mut map) = value else {
        return Err(SandboxError::invalid_response(format!(
            "{} reply is not a JSON object",
            action
        )));
    };
    match map.get("ok").and_then(Value::as_bool) {
        Some(true) => {}
        Some(false) => {
            let error = map
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(match map.get("kind").and_then(Value::as_str) {
                Some("path_traversal") => PathError::OutsideWorkspace(op.path().to_string()).into(),
                Some("path_invalid") => SandboxError::invalid_request(error),
                _ => SandboxError::action(action, error),
            });
        }
        None => {
            return Err(SandboxError::invalid_response(format!(
                "{} reply has no ok field",
                action
            )))
        }
    }
    map.remove("ok");
    serde_json::from_value(Value::Object(map))
        .map_err(|e| SandboxError::invalid_response(format!("{} reply: {}", action, e)))
}
