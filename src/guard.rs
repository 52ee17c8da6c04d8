//! Refuses commands that would park a long-lived process in the sandbox.

use std::sync::LazyLock;

use regex::RegexSet;

use crate::error::{SandboxError, SandboxResult};

static LONG_LIVED: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        // package-manager dev servers and watchers
        r"\b(npm|pnpm|yarn|bun)\s+(run\s+)?(dev|start|serve|watch)\b",
        r"\bnpx\s+(next|vite|nodemon|serve)\b",
        r"\bnext\s+(dev|start)\b",
        r"\bvite\s+(dev|serve|preview)\b",
        r"(^|[;&|]\s*)vite\s*$",
        r"\bng\s+serve\b",
        r"\b(nodemon|webpack-dev-server|live-server|http-server)\b",
        r"--watch\b",
        // python / ruby / php servers
        r"\bpython[0-9.]*\s+-m\s+http\.server\b",
        r"\bflask\s+run\b",
        r"\b(uvicorn|gunicorn|hypercorn)\b",
        r"\bmanage\.py\s+runserver\b",
        r"\brails\s+(s|server)\b",
        r"\bphp\s+-S\b",
        r"\bjupyter\s+(notebook|lab)\b",
        r"\bhugo\s+server\b",
        // followers
        r"\btail\s+(\S+\s+)*-[a-zA-Z]*[fF]\b",
        r"\btail\s+(\S+\s+)*--follow\b",
        r"(^|[;&|]\s*)watch\s+\S",
        r"\bdocker(-compose|\s+compose)\s+up\b\s*$",
    ])
    .expect("static long-lived command patterns are valid")
});

/// Whether `command` looks like a dev server, watcher or follow-mode tail.
pub fn looks_long_lived(command: &str) -> bool {
    LONG_LIVED.is_match(command.trim())
}

/// Refuse a long-lived command before any backend is touched.
pub fn check_command(command: &str) -> SandboxResult<()> {
    if command.trim().is_empty() {
        return Err(SandboxError::invalid_request("command must not be empty"));
    }
    if looks_long_lived(command) {
        return Err(SandboxError::CommandRefused {
            reason: format!(
                "'{}' looks like a long-running server or watcher; run a bounded command instead \
                 (e.g. a build or a single test run)",
                command.trim()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_servers_are_long_lived() {
        for cmd in [
            "npm run dev",
            "npm start",
            "cd app && yarn dev",
            "pnpm run serve",
            "npx next dev",
            "vite",
            "tsc --watch",
            "python -m http.server 8000",
            "python3 manage.py runserver",
            "uvicorn main:app --reload",
            "flask run",
            "tail -f /var/log/syslog",
            "tail -n 20 -F app.log",
            "watch ls",
        ] {
            assert!(looks_long_lived(cmd), "{cmd}");
        }
    }

    #[test]
    fn test_bounded_commands_are_allowed() {
        for cmd in [
            "ls -la",
            "npm run build",
            "npm test",
            "vite build",
            "cargo test",
            "tail -n 20 app.log",
            "python script.py",
            "echo start",
            "grep -r watch src",
        ] {
            assert!(!looks_long_lived(cmd), "{cmd}");
        }
    }

    #[test]
    fn test_check_command() {
        assert!(check_command("ls").is_ok());
        assert!(matches!(
            check_command("npm run dev"),
            Err(SandboxError::CommandRefused { .. })
        ));
        assert!(matches!(
            check_command("  "),
            Err(SandboxError::InvalidRequest { .. })
        ));
    }
}
