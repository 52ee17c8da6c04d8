//! File operations against a workspace directory on the host.
//!
//! Used directly by the local and container backends (whose workspaces are
//! host directories) and mirrored by the one-shot worker script that runs
//! inside cluster pods. Every path goes through [`paths::resolve_host_path`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{SandboxError, SandboxResult};
use crate::paths;

/// A per-identifier workspace rooted at a host directory.
#[derive(Debug, Clone)]
pub struct HostWorkspace {
    root: PathBuf,
}

impl HostWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if needed; returns whether it already existed.
    pub fn ensure(&self) -> SandboxResult<bool> {
        let existed = self.root.is_dir();
        if !existed {
            fs::create_dir_all(&self.root)?;
        }
        Ok(existed)
    }

    fn resolve(&self, path: &str) -> SandboxResult<PathBuf> {
        paths::normalize(path)?;
        self.ensure()?;
        Ok(paths::resolve_host_path(&self.root, path)?)
    }

    /// Bounded-depth listing. `max_depth == 0` lists direct children only.
    pub fn list(&self, path: &str, max_depth: usize, max_entries: usize) -> SandboxResult<Vec<String>> {
        let target = self.resolve(path)?;
        if !target.exists() {
            return Err(SandboxError::action("ls", format!("path not found: {}", path)));
        }
        if !target.is_dir() {
            return Err(SandboxError::action("ls", format!("not a directory: {}", path)));
        }
        let base = paths::normalize(path)?;
        let mut entries = Vec::new();
        walk(&target, &base, 0, max_depth, max_entries, &mut entries)?;
        Ok(entries)
    }

    /// 1-indexed inclusive line window rendered as `N|content`.
    pub fn read(
        &self,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
        max_lines: usize,
    ) -> SandboxResult<String> {
        let target = self.resolve(path)?;
        if !target.is_file() {
            return Err(SandboxError::action("read_file", format!("file not found: {}", path)));
        }
        let bytes = fs::read(&target)?;
        let text = String::from_utf8(bytes).map_err(|_| {
            SandboxError::action("read_file", format!("{} is not a UTF-8 text file", path))
        })?;
        render_window(&text, start_line, end_line, max_lines)
    }

    /// Create or append; parent directories are created as needed.
    pub fn write(&self, path: &str, content: &str, append: bool) -> SandboxResult<String> {
        let target = self.resolve(path)?;
        if target.is_dir() {
            return Err(SandboxError::action("write_file", format!("{} is a directory", path)));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&target)?;
        file.write_all(content.as_bytes())?;
        Ok(paths::normalize(path)?)
    }

    /// Exact substring replacement; returns the number of replacements.
    pub fn replace(
        &self,
        path: &str,
        old_text: &str,
        new_text: &str,
        replace_all: bool,
    ) -> SandboxResult<usize> {
        let target = self.resolve(path)?;
        if !target.is_file() {
            return Err(SandboxError::action("replace", format!("file not found: {}", path)));
        }
        let bytes = fs::read(&target)?;
        let text = String::from_utf8(bytes).map_err(|_| {
            SandboxError::action("replace", format!("{} is not a UTF-8 text file", path))
        })?;
        let (updated, count) = replace_text(&text, old_text, new_text, replace_all)?;
        fs::write(&target, updated)?;
        Ok(count)
    }
}

fn walk(
    dir: &Path,
    virtual_dir: &str,
    depth: usize,
    max_depth: usize,
    max_entries: usize,
    entries: &mut Vec<String>,
) -> SandboxResult<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());
    for child in children {
        if entries.len() >= max_entries {
            return Ok(());
        }
        let name = child.file_name().to_string_lossy().into_owned();
        let virtual_path = format!("{}/{}", virtual_dir, name);
        let file_type = child.file_type()?;
        // symlinked directories are listed but never followed
        if file_type.is_dir() {
            entries.push(format!("{}/", virtual_path));
            if depth < max_depth {
                walk(&child.path(), &virtual_path, depth + 1, max_depth, max_entries, entries)?;
            }
        } else {
            entries.push(virtual_path);
        }
    }
    Ok(())
}

/// Render lines `[start, end]` of `text` (1-indexed), at most `max_lines` of them.
pub fn render_window(
    text: &str,
    start_line: Option<usize>,
    end_line: Option<usize>,
    max_lines: usize,
) -> SandboxResult<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = start_line.unwrap_or(1);
    if start == 0 {
        return Err(SandboxError::action("read_file", "start_line is 1-indexed"));
    }
    if lines.is_empty() && start == 1 {
        return Ok(String::new());
    }
    if start > lines.len() {
        return Err(SandboxError::action(
            "read_file",
            format!("start_line {} is beyond end of file ({} lines)", start, lines.len()),
        ));
    }
    let budget_end = start.saturating_add(max_lines.max(1) - 1);
    let end = end_line.unwrap_or(budget_end).min(budget_end).min(lines.len());
    if end < start {
        return Err(SandboxError::action(
            "read_file",
            format!("end_line {} is before start_line {}", end, start),
        ));
    }
    Ok(lines[start - 1..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}|{}", start + i, line))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Apply an exact replacement, refusing ambiguous or empty matches.
pub fn replace_text(
    text: &str,
    old_text: &str,
    new_text: &str,
    replace_all: bool,
) -> SandboxResult<(String, usize)> {
    if old_text.is_empty() {
        return Err(SandboxError::action("replace", "old_text must not be empty"));
    }
    let count = text.matches(old_text).count();
    if count == 0 {
        return Err(SandboxError::action("replace", "old_text not found"));
    }
    if count > 1 && !replace_all {
        return Err(SandboxError::action(
            "replace",
            format!(
                "old_text occurs {} times; make it unique or set replace_all",
                count
            ),
        ));
    }
    if replace_all {
        Ok((text.replace(old_text, new_text), count))
    } else {
        Ok((text.replacen(old_text, new_text, 1), 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, HostWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = HostWorkspace::new(dir.path().join("ws"));
        (dir, ws)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, ws) = workspace();
        let path = ws.write("/workspace/a/b.txt", "hi", false).unwrap();
        assert_eq!(path, "/workspace/a/b.txt");
        assert_eq!(ws.read("/workspace/a/b.txt", None, None, 100).unwrap(), "1|hi");
    }

    #[test]
    fn test_append() {
        let (_dir, ws) = workspace();
        ws.write("/workspace/log.txt", "one\n", false).unwrap();
        ws.write("/workspace/log.txt", "two\n", true).unwrap();
        assert_eq!(
            ws.read("/workspace/log.txt", None, None, 100).unwrap(),
            "1|one\n2|two"
        );
    }

    #[test]
    fn test_read_window() {
        let text = "a\nb\nc\nd\ne";
        assert_eq!(render_window(text, Some(2), Some(3), 100).unwrap(), "2|b\n3|c");
        assert_eq!(render_window(text, Some(4), None, 100).unwrap(), "4|d\n5|e");
        assert_eq!(render_window(text, None, None, 2).unwrap(), "1|a\n2|b");
        assert_eq!(render_window(text, Some(3), Some(99), 100).unwrap(), "3|c\n4|d\n5|e");
        assert!(render_window(text, Some(6), None, 100).is_err());
        assert!(render_window(text, Some(0), None, 100).is_err());
        assert!(render_window(text, Some(3), Some(2), 100).is_err());
        assert_eq!(render_window("", None, None, 100).unwrap(), "");
    }

    #[test]
    fn test_read_window_huge_max_lines() {
        let text = "a\nb\nc";
        assert_eq!(render_window(text, Some(2), None, usize::MAX).unwrap(), "2|b\n3|c");
        assert_eq!(render_window(text, Some(3), Some(usize::MAX), usize::MAX).unwrap(), "3|c");
    }

    #[test]
    fn test_read_rejects_binary() {
        let (_dir, ws) = workspace();
        ws.ensure().unwrap();
        fs::write(ws.root().join("bin.dat"), [0xff, 0xfe, 0x00]).unwrap();
        let err = ws.read("/workspace/bin.dat", None, None, 10).unwrap_err();
        assert!(matches!(err, SandboxError::ActionFailed { .. }));
    }

    #[test]
    fn test_list_respects_depth() {
        let (_dir, ws) = workspace();
        ws.write("/workspace/a/b.txt", "x", false).unwrap();
        ws.write("/workspace/c.txt", "y", false).unwrap();

        let top = ws.list("/workspace", 0, 100).unwrap();
        assert_eq!(top, vec!["/workspace/a/", "/workspace/c.txt"]);

        let deep = ws.list("/workspace", 1, 100).unwrap();
        assert_eq!(
            deep,
            vec!["/workspace/a/", "/workspace/a/b.txt", "/workspace/c.txt"]
        );

        let capped = ws.list("/workspace", 5, 1).unwrap();
        assert_eq!(capped.len(), 1);

        let sub = ws.list("/workspace/a", 0, 100).unwrap();
        assert_eq!(sub, vec!["/workspace/a/b.txt"]);
    }

    #[test]
    fn test_list_missing_path() {
        let (_dir, ws) = workspace();
        assert!(ws.list("/workspace/nope", 1, 10).is_err());
    }

    #[test]
    fn test_ambiguous_replace_leaves_file_unchanged() {
        let (_dir, ws) = workspace();
        ws.write("/workspace/f.txt", "foo bar foo", false).unwrap();
        let before = ws.read("/workspace/f.txt", None, None, 100).unwrap();

        let err = ws.replace("/workspace/f.txt", "foo", "baz", false).unwrap_err();
        assert!(err.to_string().contains("2 times"));
        assert_eq!(ws.read("/workspace/f.txt", None, None, 100).unwrap(), before);
    }

    #[test]
    fn test_replace_all_counts() {
        let (_dir, ws) = workspace();
        ws.write("/workspace/f.txt", "foo bar foo foo", false).unwrap();
        assert_eq!(ws.replace("/workspace/f.txt", "foo", "baz", true).unwrap(), 3);
        assert_eq!(
            ws.read("/workspace/f.txt", None, None, 100).unwrap(),
            "1|baz bar baz baz"
        );
        assert_eq!(ws.replace("/workspace/f.txt", "bar", "qux", false).unwrap(), 1);
    }

    #[test]
    fn test_replace_missing_text() {
        assert!(replace_text("abc", "zzz", "y", false).is_err());
        assert!(replace_text("abc", "", "y", true).is_err());
    }

    #[test]
    fn test_traversal_rejected_before_io() {
        let (_dir, ws) = workspace();
        let err = ws.write("/workspace/../escape.txt", "x", false).unwrap_err();
        assert!(matches!(err, SandboxError::Path(_)));
    }
}
