use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::collaborators::{CommandOutcome, CommandSink};
use crate::config::CommandConfig;

/// Runs commands through `sh -c` inside a fixed working directory.
#[derive(Debug, Clone)]
pub struct ShellCommandSink {
    working_dir: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ShellCommandSink {
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>, config: &CommandConfig) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

impl CommandSink for ShellCommandSink {
    fn execute(&self, user_id: &str, command: &str) -> CommandOutcome {
        debug!(user = user_id, command, "launching host command");

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                warn!(user = user_id, %error, "failed to launch host command");
                return CommandOutcome {
                    success: false,
                    output: Some(format!("Failed to launch command: {error}")),
                };
            }
        };

        // Both pipes are drained while the child runs.
        let keep = self.max_output_bytes.saturating_add(1);
        let readers = spawn_drain("stdout", child.stdout.take(), keep).and_then(|stdout| {
            spawn_drain("stderr", child.stderr.take(), keep).map(|stderr| (stdout, stderr))
        });
        let (stdout_reader, stderr_reader) = match readers {
            Ok(readers) => readers,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(user = user_id, %error, "failed to start output readers");
                return CommandOutcome {
                    success: false,
                    output: Some(format!("Failed to capture command output: {error}")),
                };
            }
        };

        let timeout_secs = self.timeout.as_secs();
        let waited = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => Ok((false, status)),
            Ok(None) => {
                let _ = child.kill();
                child
                    .wait()
                    .map(|status| (true, status))
                    .map_err(|error| {
                        format!("Command timed out after {timeout_secs}s and wait failed: {error}")
                    })
            }
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(format!("Failed waiting for command: {error}"))
            }
        };

        let stdout = join_drain(stdout_reader);
        let stderr = join_drain(stderr_reader);
        let (timed_out, status) = match waited {
            Ok(waited) => waited,
            Err(message) => {
                return CommandOutcome {
                    success: false,
                    output: Some(message),
                };
            }
        };

        let mut combined = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        let status_label = if timed_out {
            format!("timeout after {timeout_secs}s")
        } else {
            format_exit_status(status)
        };
        debug!(user = user_id, status = %status_label, "host command finished");

        let success = !timed_out && status.success();
        let output = if combined.trim().is_empty() {
            if success {
                None
            } else {
                Some(format!("status: {status_label}"))
            }
        } else if success {
            Some(truncate_to_byte_limit(combined, self.max_output_bytes))
        } else {
            Some(truncate_to_byte_limit(
                format!("status: {status_label}\n{combined}"),
                self.max_output_bytes,
            ))
        };

        CommandOutcome { success, output }
    }
}

type Drain = Option<JoinHandle<Vec<u8>>>;

fn spawn_drain<R>(label: &str, pipe: Option<R>, keep: usize) -> io::Result<Drain>
where
    R: Read + Send + 'static,
{
    pipe.map(|pipe| {
        thread::Builder::new()
            .name(format!("session-agent-{label}"))
            .spawn(move || drain_pipe(pipe, keep))
    })
    .transpose()
}

fn join_drain(reader: Drain) -> Vec<u8> {
    reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default()
}

/// Reads `pipe` to EOF, keeping at most `keep` bytes.
fn drain_pipe(mut pipe: impl Read, keep: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0_u8; 8192];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                let room = keep.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..read.min(room)]);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    kept
}

pub(crate) fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = max_bytes.min(content.len());
    while cutoff > 0 && !content.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = content[..cutoff].to_string();
    truncated.push_str("\n[truncated]");
    truncated
}

fn format_exit_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit_code={code}"),
        None => "exit_code=terminated_by_signal".to_string(),
    }
}
