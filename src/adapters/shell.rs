//! Shell command runner.
//!
//! Rule `command` actions run through `sh -c`.  The child is spawned on
//! the calling thread, so a missing shell is reported straight away, and
//! then handed to a supervisor thread that enforces the timeout, kills
//! the child when it expires and logs the exit status together with the
//! first [`OUTPUT_LIMIT`] bytes of output.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::app::ports::CommandRunner;
use crate::error::CommandError;

/// Output kept per stream for the log line.
pub const OUTPUT_LIMIT: usize = 512;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
    /// Captured stdout followed by stderr, truncated.
    pub output: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Run `command` to completion on the current thread.
    pub fn run_blocking(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome, CommandError> {
        let child = self.spawn(command)?;
        supervise(child, command, timeout)
    }

    fn spawn(&self, command: &str) -> Result<Child, CommandError> {
        Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CommandError::SpawnFailed(format!("{}: {}", command, e)))
    }
}

impl CommandRunner for ShellRunner {
    fn run(&mut self, command: &str, timeout: Duration) -> Result<(), CommandError> {
        let child = self.spawn(command)?;
        let owned = command.to_owned();
        thread::Builder::new()
            .name("growctl-cmd".into())
            .spawn(move || match supervise(child, &owned, timeout) {
                Ok(outcome) if outcome.success() => {
                    info!("Command: '{}' ok {}", owned, outcome.output.trim());
                }
                Ok(outcome) => {
                    warn!(
                        "Command: '{}' exited {:?}: {}",
                        owned,
                        outcome.status,
                        outcome.output.trim()
                    );
                }
                Err(e) => warn!("Command: {}", e),
            })
            .map_err(|e| CommandError::SpawnFailed(e.to_string()))?;
        Ok(())
    }
}

/// Wait for `child`, killing it once `timeout` has elapsed.
fn supervise(
    mut child: Child,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutcome, CommandError> {
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::Timeout {
                    command: command.to_owned(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(CommandError::SpawnFailed(e.to_string())),
        }
    };

    let mut output = String::new();
    for reader in [stdout, stderr].into_iter().flatten() {
        if let Ok(text) = reader.join() {
            output.push_str(&text);
        }
    }
    Ok(CommandOutcome {
        status: status.code(),
        output,
    })
}

/// Read a stream to EOF on its own thread, keeping the first
/// [`OUTPUT_LIMIT`] bytes.
fn drain<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut kept = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 {
                break;
            }
            let room = OUTPUT_LIMIT.saturating_sub(kept.len());
            kept.extend_from_slice(&buf[..n.min(room)]);
        }
        String::from_utf8_lossy(&kept).into_owned()
    })
}
