//! Agent Sandbox - isolated command execution and file access for AI agents.
//!
//! Three interchangeable backends serve the same operations:
//! - local: child processes in a per-sandbox host directory
//! - container: one reusable container per sandbox
//! - cluster: one pod per sandbox, managed by the provisioner service
//!
//! [`dispatch::SandboxService`] routes each request to the backend its
//! [`config::SandboxConfig`] selects.

pub mod client;
pub mod cluster;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod http_server;
pub mod identity;
pub mod local;
pub mod output;
pub mod paths;
pub mod process;
pub mod protocol;
pub mod state;
pub mod workspace;

pub use config::{SandboxConfig, SandboxMode, SandboxOverrides};
pub use dispatch::SandboxService;
pub use error::{PathError, SandboxError, SandboxResult};
pub use identity::SandboxIdentity;
pub use output::CommandResult;
