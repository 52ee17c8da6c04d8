//! Cluster backend: one pod per sandbox, managed by the provisioner service.

pub mod config;
pub mod control;
pub mod manifest;
pub mod provisioner;
pub mod reaper;
pub mod script;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ProvisionerConfig;
pub use control::{ControlPlane, Kubectl, PodInfo, PodPhase};
pub use provisioner::Provisioner;
pub use reaper::spawn_idle_reaper;

pub const MANAGED_LABEL_KEY: &str = "agent-sandbox.io/managed";
pub const LABEL_SANDBOX_ID: &str = "agent-sandbox.io/sandbox-id";
pub const ANNOTATION_CREATED_AT: &str = "agent-sandbox.io/created-at";
pub const ANNOTATION_LAST_USED: &str = "agent-sandbox.io/last-used-ts";
pub const ANNOTATION_THREAD_ID: &str = "agent-sandbox.io/thread-id";
pub const ANNOTATION_THREAD_KEY: &str = "agent-sandbox.io/thread-key";
pub const ANNOTATION_SANDBOX_ID: &str = "agent-sandbox.io/sandbox-id";

/// Label selector matching every pod the provisioner owns.
pub fn managed_selector() -> String {
    format!("{}=true", MANAGED_LABEL_KEY)
}
