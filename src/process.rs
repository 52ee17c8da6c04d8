//! Blocking child-process runner with a deadline and bounded capture.
//!
//! Every call here blocks the current thread; async callers go through
//! `tokio::task::spawn_blocking`.

use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::output::{cap_output, timeout_message, EXIT_NOT_FOUND, EXIT_TIMEOUT, NO_OUTPUT};

/// How long reader threads may keep draining after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

enum Event {
    Line(Stream, Vec<u8>),
    Overflow,
    Eof,
}

/// Everything a finished (or killed) child produced.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    lines: Vec<(Stream, String)>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Set when the child could not be spawned because the binary is missing.
    pub not_found: bool,
    /// Set when more output arrived than the capture limit allowed.
    pub overflowed: bool,
}

impl Captured {
    #[cfg(test)]
    pub(crate) fn from_output(stdout: &str, stderr: &str, exit_code: i32) -> Self {
        let mut lines = Vec::new();
        if !stdout.is_empty() {
            lines.push((Stream::Stdout, stdout.to_string()));
        }
        if !stderr.is_empty() {
            lines.push((Stream::Stderr, stderr.to_string()));
        }
        Self {
            lines,
            exit_code: Some(exit_code),
            ..Default::default()
        }
    }

    /// stdout only, in arrival order.
    pub fn stdout(&self) -> String {
        self.collect(Stream::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.collect(Stream::Stderr)
    }

    fn collect(&self, which: Stream) -> String {
        self.lines
            .iter()
            .filter(|(s, _)| *s == which)
            .map(|(_, l)| l.as_str())
            .collect()
    }

    /// stdout and stderr interleaved, stderr lines prefixed with `[stderr]`.
    pub fn combined(&self) -> String {
        let mut out = String::new();
        for (stream, line) in &self.lines {
            if *stream == Stream::Stderr {
                out.push_str("[stderr] ");
            }
            out.push_str(line);
            if !line.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// `(output, exit_code, truncated)` as every backend reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub output: String,
    pub exit_code: i32,
    pub truncated: bool,
}

impl CommandOutcome {
    /// Render a capture for an agent: timeout and missing-binary become
    /// synthetic results, empty output becomes [`NO_OUTPUT`].
    pub fn from_captured(captured: &Captured, timeout: Duration, max_output_bytes: usize) -> Self {
        if captured.not_found {
            let (output, truncated) = cap_output(&captured.combined(), max_output_bytes);
            return Self {
                output,
                exit_code: EXIT_NOT_FOUND,
                truncated: truncated || captured.overflowed,
            };
        }
        if captured.timed_out {
            let mut text = captured.combined();
            text.push_str(&timeout_message(timeout.as_secs()));
            let (output, truncated) = cap_output(&text, max_output_bytes);
            return Self {
                output,
                exit_code: EXIT_TIMEOUT,
                truncated: truncated || captured.overflowed,
            };
        }
        let combined = captured.combined();
        let text = if combined.trim().is_empty() {
            NO_OUTPUT.to_string()
        } else {
            combined.trim_end_matches('\n').to_string()
        };
        let (output, truncated) = cap_output(&text, max_output_bytes);
        Self {
            output,
            exit_code: captured.exit_code.unwrap_or(-1),
            truncated: truncated || captured.overflowed,
        }
    }
}

/// Run `command` to completion or until `timeout` expires.
///
/// The child gets its own process group so a timeout kills everything it
/// spawned. Descendants still holding the output pipes after the child exits
/// are killed too. At most `capture_limit` bytes of output are retained: a
/// line that does not fit is cut at the budget and everything after it is
/// drained and dropped. Spawn failures other than a missing binary are
/// returned as errors.
pub fn run(
    mut command: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    capture_limit: usize,
) -> std::io::Result<Captured> {
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(program = %program, "executable not found");
            return Ok(Captured {
                lines: vec![(Stream::Stderr, format!("{}: command not found\n", program))],
                exit_code: Some(EXIT_NOT_FOUND),
                not_found: true,
                ..Default::default()
            });
        }
        Err(e) => return Err(e),
    };

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let data = data.to_vec();
        thread::spawn(move || {
            let _ = pipe.write_all(&data);
        });
    }

    let (tx, rx) = mpsc::channel();
    let mut readers = 0;
    if let Some(out) = child.stdout.take() {
        spawn_reader(out, Stream::Stdout, tx.clone(), capture_limit);
        readers += 1;
    }
    if let Some(err) = child.stderr.take() {
        spawn_reader(err, Stream::Stderr, tx.clone(), capture_limit);
        readers += 1;
    }
    drop(tx);

    let (status, timed_out) = match child.wait_timeout(timeout)? {
        Some(status) => (Some(status), false),
        None => {
            warn!(program = %program, timeout_secs = timeout.as_secs(), "deadline exceeded, killing process group");
            kill_group(&mut child);
            (child.wait().ok(), true)
        }
    };

    let mut captured = Captured {
        exit_code: status.and_then(|s| s.code()),
        timed_out,
        ..Default::default()
    };
    let mut retained = 0usize;
    let deadline = Instant::now() + DRAIN_GRACE;
    while readers > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Event::Line(stream, bytes)) => {
                if captured.overflowed {
                    continue;
                }
                let room = capture_limit - retained;
                let keep = bytes.len().min(room);
                if keep > 0 {
                    retained += keep;
                    captured
                        .lines
                        .push((stream, String::from_utf8_lossy(&bytes[..keep]).into_owned()));
                }
                if keep < bytes.len() {
                    captured.overflowed = true;
                }
            }
            Ok(Event::Overflow) => captured.overflowed = true,
            Ok(Event::Eof) => readers -= 1,
            Err(_) => break,
        }
    }
    if readers > 0 && !timed_out {
        debug!(program = %program, "output pipes still open after exit, killing process group");
        kill_group(&mut child);
    }
    Ok(captured)
}

/// Per-stream budget for one reader thread.
struct LineSink {
    stream: Stream,
    tx: mpsc::Sender<Event>,
    limit: usize,
    sent: usize,
    full: bool,
}

impl LineSink {
    /// Forward as much of `bytes` as the budget allows. Returns false once
    /// the receiver is gone.
    fn offer(&mut self, bytes: &[u8]) -> bool {
        let room = self.limit - self.sent;
        if bytes.len() <= room {
            self.sent += bytes.len();
            return self.tx.send(Event::Line(self.stream, bytes.to_vec())).is_ok();
        }
        self.full = true;
        self.sent = self.limit;
        if room > 0 && self.tx.send(Event::Line(self.stream, bytes[..room].to_vec())).is_err() {
            return false;
        }
        self.tx.send(Event::Overflow).is_ok()
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    stream: Stream,
    tx: mpsc::Sender<Event>,
    limit: usize,
) {
    thread::spawn(move || {
        let mut sink = LineSink {
            stream,
            tx,
            limit,
            sent: 0,
            full: false,
        };
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            // keep draining so the child never blocks on a full pipe
            if sink.full {
                continue;
            }
            pending.extend_from_slice(&chunk[..n]);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if !sink.offer(&line) {
                    return;
                }
                if sink.full {
                    pending.clear();
                    break;
                }
            }
            // an unterminated tail already past the budget is cut now
            if !sink.full && sink.sent + pending.len() > sink.limit {
                let tail = std::mem::take(&mut pending);
                if !sink.offer(&tail) {
                    return;
                }
            }
        }
        if !sink.full && !pending.is_empty() && !sink.offer(&pending) {
            return;
        }
        let _ = sink.tx.send(Event::Eof);
    });
}

#[cfg(unix)]
fn kill_group(child: &mut std::process::Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    if killpg(pgid, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut std::process::Child) {
    let _ = child.kill();
}
