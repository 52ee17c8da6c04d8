//! Agent-facing virtual paths and their host mapping.
//!
//! Agents always address files as absolute paths under [`VIRTUAL_ROOT`],
//! whatever backend serves them. [`normalize`] validates the string form
//! before any I/O; [`resolve_host_path`] repeats the containment check on the
//! real filesystem so a symlink inside the workspace cannot point outside it.

use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Root every agent-visible path is anchored at.
pub const VIRTUAL_ROOT: &str = "/workspace";

/// Canonicalize a virtual path.
///
/// `/workspace/a/./b` and `/a/b` both become `/workspace/a/b`. Any `..`
/// segment is rejected rather than collapsed.
pub fn normalize(path: &str) -> Result<String, PathError> {
    let rel = relative_segments(path)?;
    if rel.is_empty() {
        Ok(VIRTUAL_ROOT.to_string())
    } else {
        Ok(format!("{}/{}", VIRTUAL_ROOT, rel.join("/")))
    }
}

/// Root-relative segments of a virtual path, validated like [`normalize`].
pub fn relative_segments(path: &str) -> Result<Vec<&str>, PathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    if !trimmed.starts_with('/') {
        return Err(PathError::NotAbsolute(trimmed.to_string()));
    }

    let remainder = match trimmed.strip_prefix(VIRTUAL_ROOT) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => trimmed,
    };

    let mut segments = Vec::new();
    for segment in remainder.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(trimmed.to_string())),
            other => segments.push(other),
        }
    }
    Ok(segments)
}

/// Map a virtual path onto `root`, verifying the result stays inside it.
///
/// The target does not need to exist: the deepest existing ancestor is
/// canonicalized and must still live under the canonical root.
pub fn resolve_host_path(root: &Path, path: &str) -> Result<PathBuf, PathError> {
    let segments = relative_segments(path)?;
    let canonical_root = root
        .canonicalize()
        .map_err(|_| PathError::OutsideWorkspace(root.display().to_string()))?;

    let mut candidate = canonical_root.clone();
    for segment in &segments {
        candidate.push(segment);
    }

    let mut existing = candidate.as_path();
    let mut pending = Vec::new();
    loop {
        if existing.symlink_metadata().is_ok() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                pending.push(name.to_os_string());
                existing = parent;
            }
            _ => return Err(PathError::OutsideWorkspace(path.to_string())),
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|_| PathError::OutsideWorkspace(path.to_string()))?;
    if !resolved.starts_with(&canonical_root) {
        return Err(PathError::OutsideWorkspace(path.to_string()));
    }
    for name in pending.into_iter().rev() {
        resolved.push(name);
    }
    if resolved
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(PathError::Traversal(path.to_string()));
    }
    Ok(resolved)
}
