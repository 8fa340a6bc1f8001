//! Process supervision for the external agent computation.
//!
//! Launches the agent as a child process with piped stdio, streams stdout
//! line by line, keeps a bounded tail of stderr for last-resort diagnostics,
//! and wires cancellation to an escalating graceful-then-forceful kill.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use anyhow::Context;

const STDERR_TAIL_LINES: usize = 40;

/// What to launch. Building the command line and environment policy is the
/// caller's job; the supervisor only runs what it is given.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin_payload: Option<String>,
}

/// Output of a supervised process, in emission order. `Exited` arrives
/// exactly once, after the final stdout line.
#[derive(Debug, PartialEq)]
pub enum ProcessEvent {
    Stdout(String),
    Exited { code: Option<i32> },
}

/// Handle to a launched process. Dropping the handle does not kill the
/// process; only `cancel` does.
pub struct ProcessHandle {
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    cancel: CancellationToken,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessHandle {
    /// Request termination. Idempotent: the first call starts the graceful
    /// signal and arms the forceful escalation; later calls do nothing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Recent stderr output, for error extraction after an abnormal exit.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

pub struct ProcessSupervisor {
    kill_escalation: Duration,
}

impl ProcessSupervisor {
    pub fn new(kill_escalation: Duration) -> Self {
        Self { kill_escalation }
    }

    pub fn launch(&self, spec: ProcessSpec) -> anyhow::Result<ProcessHandle> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch agent process `{}`", spec.program))?;
        let pid = child.id();

        if let Some(payload) = spec.stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                        warn!("failed to write agent stdin: {err}");
                    }
                    // stdin drops here, closing the pipe
                });
            }
        }

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock();
                    if tail.len() >= STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .context("agent process stdout was not piped")?;

        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();

        // Escalating kill watchdog: graceful signal on cancellation, forceful
        // after the escalation window unless the process exits first.
        {
            let cancel = cancel.clone();
            let exited = exited.clone();
            let escalation = self.kill_escalation;
            tokio::spawn(async move {
                tokio::select! {
                    _ = exited.cancelled() => return,
                    _ = cancel.cancelled() => {}
                }
                debug!("sending graceful termination signal to agent process");
                send_term(pid);
                tokio::select! {
                    _ = exited.cancelled() => {}
                    _ = tokio::time::sleep(escalation) => {
                        warn!("agent process ignored graceful stop, killing");
                        send_kill(pid);
                    }
                }
            });
        }

        let (tx, events) = mpsc::unbounded_channel();
        {
            let exited = exited.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(ProcessEvent::Stdout(line)).is_err() {
                        break;
                    }
                }
                let code = child.wait().await.ok().and_then(|status| status.code());
                exited.cancel();
                let _ = tx.send(ProcessEvent::Exited { code });
            });
        }

        Ok(ProcessHandle {
            events,
            cancel,
            stderr_tail,
        })
    }
}

#[cfg(unix)]
fn send_term(pid: Option<u32>) {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn send_kill(pid: Option<u32>) {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    let Some(pid) = pid else { return };
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
}

#[cfg(not(unix))]
fn send_term(pid: Option<u32>) {
    // No portable graceful signal off unix; go straight to taskkill.
    send_kill(pid);
}

#[cfg(not(unix))]
fn send_kill(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output();
}
