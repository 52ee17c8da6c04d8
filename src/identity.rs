//! Sandbox identity: which logical session a request belongs to and the
//! deterministic resource name backing it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SandboxError, SandboxResult};

/// Longest name accepted by the container runtime and the cluster (DNS label).
pub const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Hex digits of the identity hash kept in resource names.
const HASH_LEN: usize = 16;

/// Identity fields as callers send them; any one is enough.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
}

impl SandboxIdentity {
    pub fn for_sandbox(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: Some(sandbox_id.into()),
            ..Default::default()
        }
    }

    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Default::default()
        }
    }

    /// Apply the fallback chain: `thread_key` slugs `thread_key` or
    /// `thread_id`, `sandbox_id` slugs `sandbox_id` or the thread key.
    pub fn resolve(&self) -> SandboxResult<ResolvedIdentity> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let thread_id = non_empty(&self.thread_id);
        let sandbox_raw = non_empty(&self.sandbox_id);

        let thread_key = non_empty(&self.thread_key)
            .or_else(|| thread_id.clone())
            .or_else(|| sandbox_raw.clone())
            .map(|raw| slugify(&raw))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                SandboxError::invalid_request("one of thread_id, thread_key or sandbox_id is required")
            })?;
        let sandbox_id = sandbox_raw
            .map(|raw| slugify(&raw))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| thread_key.clone());

        Ok(ResolvedIdentity {
            thread_id: thread_id.unwrap_or_default(),
            thread_key,
            sandbox_id,
        })
    }
}

/// Identity after the fallback chain, every field resource-name safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub thread_id: String,
    pub thread_key: String,
    pub sandbox_id: String,
}

/// Lowercase alphanumerics joined by single hyphens, at most 63 chars.
pub fn slugify(input: &str) -> String {
    let slug = input
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            _ => '-',
        })
        .collect::<String>()
        .split('-')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    truncate_slug(&slug, MAX_RESOURCE_NAME_LEN)
}

fn truncate_slug(slug: &str, max: usize) -> String {
    if slug.len() <= max {
        return slug.to_string();
    }
    slug[..max].trim_end_matches('-').to_string()
}

/// Deterministic resource name for a sandbox id: `<prefix>-<hash>`.
///
/// The prefix is sanitized and shortened so the result never exceeds
/// [`MAX_RESOURCE_NAME_LEN`]; an empty prefix falls back to `sbx`.
pub fn derive_resource_name(sandbox_id: &str, prefix: &str) -> String {
    let digest = Sha256::digest(sandbox_id.as_bytes());
    let hash = &hex::encode(digest)[..HASH_LEN];

    let prefix = slugify(prefix);
    let prefix = if prefix.is_empty() { "sbx".to_string() } else { prefix };
    let prefix = truncate_slug(&prefix, MAX_RESOURCE_NAME_LEN - HASH_LEN - 1);
    format!("{}-{}", prefix, hash)
}
