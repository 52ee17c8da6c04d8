//! Shared application state for the provisioner's HTTP handlers.

use std::sync::Arc;

use crate::cluster::Provisioner;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub provisioner: Arc<Provisioner>,
    /// Bearer token required on `/v1` routes; `None` disables auth.
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        let api_key = provisioner
            .config()
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(Arc::from);
        Self {
            provisioner,
            api_key,
        }
    }
}
