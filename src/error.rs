//! Error types shared by every backend and the provisioner.

use thiserror::Error;

use crate::protocol::ErrorBody;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Rejections produced while validating an agent-supplied path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path must not be empty")]
    Empty,

    #[error("path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("path escapes the workspace: {0}")]
    Traversal(String),

    /// The host location resolved (e.g. through a symlink) outside the workspace root.
    #[error("path resolves outside the workspace: {0}")]
    OutsideWorkspace(String),
}

/// Sandbox errors.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("sandbox is disabled")]
    Disabled,

    #[error("command refused: {reason}")]
    CommandRefused { reason: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("sandbox {resource} failed to start: {reason}")]
    StartupFailed { resource: String, reason: String },

    #[error("{action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("configuration error: {reason}")]
    InvalidConfig { reason: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("provisioner returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ActionFailed {
            action: action.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Stable tag used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Path(PathError::Traversal(_)) | Self::Path(PathError::OutsideWorkspace(_)) => {
                "path_traversal"
            }
            Self::Path(_) => "path_invalid",
            Self::Disabled => "disabled",
            Self::CommandRefused { .. } => "command_refused",
            Self::Timeout { .. } => "timeout",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::StartupFailed { .. } => "startup_failed",
            Self::ActionFailed { .. } => "action_failed",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::Unauthorized => "unauthorized",
            Self::Remote { .. } => "remote",
            Self::Io(_) => "io",
        }
    }
}

impl SandboxError {
    /// Wire form for HTTP error responses.
    pub fn to_body(&self) -> ErrorBody {
        let (subject, reason, seconds) = match self {
            Self::Path(PathError::Empty) => (None, Some(String::new()), None),
            Self::Disabled | Self::Unauthorized => (None, None, None),
            Self::Path(
                PathError::NotAbsolute(path)
                | PathError::Traversal(path)
                | PathError::OutsideWorkspace(path),
            ) => (None, Some(path.clone()), None),
            Self::Timeout { operation, seconds } => (Some(operation.clone()), None, Some(*seconds)),
            Self::StartupFailed { resource, reason } => {
                (Some(resource.clone()), Some(reason.clone()), None)
            }
            Self::ActionFailed { action, reason } => (Some(action.clone()), Some(reason.clone()), None),
            Self::CommandRefused { reason }
            | Self::BackendUnavailable { reason }
            | Self::InvalidResponse { reason }
            | Self::InvalidRequest { reason }
            | Self::InvalidConfig { reason } => (None, Some(reason.clone()), None),
            Self::Remote { message, .. } => (None, Some(message.clone()), None),
            Self::Io(e) => (None, Some(e.to_string()), None),
        };
        ErrorBody {
            error: self.to_string(),
            kind: self.kind().to_string(),
            subject,
            reason,
            seconds,
        }
    }

    /// Rebuild the typed error a provisioner reported. Kinds that describe
    /// the provisioner's own state rather than the caller's request stay
    /// [`SandboxError::Remote`].
    pub fn from_body(status: u16, body: ErrorBody) -> Self {
        let reason = body.reason.unwrap_or_else(|| body.error.clone());
        match body.kind.as_str() {
            "path_traversal" => PathError::Traversal(reason).into(),
            "path_invalid" if reason.is_empty() => PathError::Empty.into(),
            "path_invalid" => PathError::NotAbsolute(reason).into(),
            "disabled" => Self::Disabled,
            "command_refused" => Self::CommandRefused { reason },
            "timeout" => Self::Timeout {
                operation: body.subject.unwrap_or_else(|| "provisioner call".to_string()),
                seconds: body.seconds.unwrap_or_default(),
            },
            "backend_unavailable" => Self::BackendUnavailable { reason },
            "startup_failed" => Self::StartupFailed {
                resource: body.subject.unwrap_or_default(),
                reason,
            },
            "action_failed" => Self::ActionFailed {
                action: body.subject.unwrap_or_else(|| "remote action".to_string()),
                reason,
            },
            "invalid_request" => Self::InvalidRequest { reason },
            "invalid_response" => Self::InvalidResponse { reason },
            "unauthorized" => Self::Unauthorized,
            _ => Self::Remote {
                status,
                message: body.error,
            },
        }
    }
}

impl From<tokio::task::JoinError> for SandboxError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::unavailable(format!("worker thread failed: {}", err))
    }
}
