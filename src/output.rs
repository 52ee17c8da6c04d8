//! Output capping and the uniform command result.

use serde::{Deserialize, Serialize};

use crate::config::SandboxMode;

/// Placeholder returned when a command printed nothing.
pub const NO_OUTPUT: &str = "<no output>";

/// Exit code reported when a command hit its deadline.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code reported when the interpreter or binary could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Truncate `text` to at most `max_bytes` bytes on a char boundary.
///
/// Returns the (possibly shortened) text and whether anything was cut. When
/// the budget leaves room, a marker is appended inside the budget.
pub fn cap_output(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let marker = if max_bytes >= TRUNCATION_MARKER.len() * 2 {
        TRUNCATION_MARKER
    } else {
        ""
    };
    let end = floor_char_boundary(text, max_bytes - marker.len());
    let mut capped = String::with_capacity(end + marker.len());
    capped.push_str(&text[..end]);
    capped.push_str(marker);
    (capped, true)
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut end = index.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Message used as the output of a command that ran out of time.
pub fn timeout_message(seconds: u64) -> String {
    format!("Command timed out after {} seconds and was terminated.", seconds)
}

/// Result of an `execute` call, identical in shape for every backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub mode: SandboxMode,
    pub workspace_path: String,
    pub output: String,
    pub exit_code: i32,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
}
