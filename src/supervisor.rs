//! Supervisor of one child process.
//!
//! Each Supervisor runs on its own task and owns exactly one
//! [`tokio::process::Child`] across its lifetime. It speaks the six-token
//! control grammar from [`crate::proto::SupervisorToken`] to the Process
//! Manager: it announces readiness and lifecycle transitions on an
//! outbound channel, and is driven by `launch`/`relaunch` directives sent
//! back on an inbound channel.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::proto::SupervisorToken;

/// How long to wait before relaunching a child that died, as an endless
/// or finite sequence of delays consumed one per crash.
pub trait RestartPolicy: Send + Sync + 'static {
    fn retries(&self) -> Box<dyn Iterator<Item = Duration> + Send + 'static>;
}

impl<T> RestartPolicy for T
where
    T: Iterator<Item = Duration> + Clone + Send + Sync + 'static,
{
    fn retries(&self) -> Box<dyn Iterator<Item = Duration> + Send + 'static> {
        Box::new(self.clone())
    }
}

/// The default policy: relaunch immediately, forever. Matches the
/// original tool's unbounded, no-backoff restart behavior.
pub fn unbounded_no_backoff() -> Box<dyn RestartPolicy> {
    Box::new(std::iter::repeat(Duration::ZERO))
}

/// Which lifecycle event, if any, the Console is waiting to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Launched,
    Finished,
}

/// State shared between the Supervisor's own task and `stop`, called from
/// the Process Manager's main task. Only the done flag and the running
/// child's pid need to cross the task boundary; the `Child` itself (and
/// the blocking wait on it) stays owned by the Supervisor task.
struct Shared {
    done: bool,
    pid: Option<u32>,
}

/// A Process Manager's handle to one running Supervisor task.
pub struct SupervisorHandle {
    pub alias: String,
    pub interest: Option<Interest>,
    directives: mpsc::UnboundedSender<SupervisorToken>,
    shared: Arc<Mutex<Shared>>,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Spawns the Supervisor task. `tokens` is a channel shared by every
    /// Supervisor on this Process Manager; tokens are tagged with `alias`
    /// so the main readiness loop can multiplex them with one `recv`.
    pub fn spawn(
        alias: String,
        command_line: String,
        cwd: PathBuf,
        interest: Interest,
        tokens: mpsc::UnboundedSender<(String, SupervisorToken)>,
    ) -> Self {
        Self::spawn_with_restart_policy(
            alias,
            command_line,
            cwd,
            interest,
            tokens,
            unbounded_no_backoff(),
        )
    }

    /// As [`Self::spawn`], but with an explicit restart policy in place
    /// of the default unbounded, no-backoff one.
    pub fn spawn_with_restart_policy(
        alias: String,
        command_line: String,
        cwd: PathBuf,
        interest: Interest,
        tokens: mpsc::UnboundedSender<(String, SupervisorToken)>,
        restart_policy: Box<dyn RestartPolicy>,
    ) -> Self {
        let (directives_tx, directives_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            done: false,
            pid: None,
        }));
        let task_alias = alias.clone();
        let task_shared = shared.clone();
        let join = tokio::spawn(async move {
            run(
                task_alias,
                command_line,
                cwd,
                tokens,
                directives_rx,
                task_shared,
                restart_policy.retries(),
            )
            .await
        });
        SupervisorHandle {
            alias,
            interest: Some(interest),
            directives: directives_tx,
            shared,
            join,
        }
    }

    /// Sends a `launch` or `relaunch` directive. Errors are ignored: if
    /// the task has already exited the directive is simply never read.
    pub fn send_directive(&self, token: SupervisorToken) {
        let _ = self.directives.send(token);
    }

    /// Idempotent stop: marks the Supervisor done so it forks no further
    /// child, and signals the currently-running child (if any) to
    /// terminate. A send failure because the child already exited is not
    /// an error (mirrors the original tool's `terminate()` try/except).
    pub async fn stop(&self) {
        let mut guard = self.shared.lock().await;
        if guard.done {
            return;
        }
        guard.done = true;
        if let Some(pid) = guard.pid {
            // SAFETY: signalling a pid we hold a live handle for; ESRCH
            // (already exited) is an expected, ignored outcome.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    /// Awaits task completion. The task is guaranteed to exit once its
    /// child (if any) has exited and no further directive is pending, or
    /// once its directive channel is closed (see `drop`).
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

async fn run(
    alias: String,
    command_line: String,
    cwd: PathBuf,
    tokens: mpsc::UnboundedSender<(String, SupervisorToken)>,
    mut directives: mpsc::UnboundedReceiver<SupervisorToken>,
    shared: Arc<Mutex<Shared>>,
    mut retries: Box<dyn Iterator<Item = Duration> + Send>,
) {
    loop {
        log::debug!(alias = alias.as_str(); "ready");
        if tokens.send((alias.clone(), SupervisorToken::Ready)).is_err() {
            return;
        }

        // BLOCKED-ON-LAUNCH: any input other than `launch`, or channel
        // close, is TERMINAL.
        match directives.recv().await {
            Some(SupervisorToken::Launch) => {}
            _ => return,
        }

        let log_path = PathBuf::from(format!("{alias}_proc.log"));
        if let Err(e) = rotate_log(&log_path) {
            log::warn!(alias = alias.as_str(); "failed to rotate log file: {e:#}");
        }

        let mut child = {
            let mut guard = shared.lock().await;
            if guard.done {
                // stop() arrived while we were blocked awaiting launch.
                return;
            }
            match spawn_child(&command_line, &cwd, &log_path) {
                Ok(child) => {
                    guard.pid = child.id();
                    child
                }
                Err(e) => {
                    log::error!(alias = alias.as_str(); "failed to spawn child: {e:#}");
                    return;
                }
            }
        };

        log::info!(alias = alias.as_str(); "launched");
        if tokens
            .send((alias.clone(), SupervisorToken::Launched))
            .is_err()
        {
            let _ = child.kill().await;
            return;
        }

        let wait_result = child.wait().await;
        let stopped = shared.lock().await.done;

        if stopped {
            // stop() was called before or during RUNNING: no further
            // token beyond what was already in flight.
            return;
        }

        match wait_result {
            Ok(status) if status.success() => {
                log::info!(alias = alias.as_str(); "finished");
                let _ = tokens.send((alias.clone(), SupervisorToken::Finished));
                return;
            }
            Ok(status) => {
                log::warn!(alias = alias.as_str(); "died: {status}");
            }
            Err(e) => {
                log::warn!(alias = alias.as_str(); "died: wait() failed: {e}");
            }
        }

        if tokens.send((alias.clone(), SupervisorToken::Died)).is_err() {
            return;
        }

        // BLOCKED-ON-RELAUNCH
        match directives.recv().await {
            Some(SupervisorToken::Relaunch) => {
                if let Some(delay) = retries.next() {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                } else {
                    return;
                }
                continue;
            }
            _ => return,
        }
    }
}

/// Renames an existing log file out of the way with a suffix distinct
/// from any existing file, so the new launch gets a clean file.
fn rotate_log(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    loop {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let candidate = PathBuf::from(format!("{}_{suffix}", path.display()));
        if !candidate.exists() {
            fs::rename(path, &candidate)
                .with_context(|| format!("renaming {} to {}", path.display(), candidate.display()))?;
            return Ok(());
        }
    }
}

/// Forks the child with its executable search path extended to include
/// `cwd`, stdin as an open pipe, and stdout/stderr redirected to the
/// rotated log file.
fn spawn_child(command_line: &str, cwd: &Path, log_path: &Path) -> Result<Child> {
    let mut argv = shell_words::split(command_line)
        .with_context(|| format!("splitting command line {command_line:?}"))?;
    if argv.is_empty() {
        bail!("empty command line");
    }
    let program = argv.remove(0);

    let log_out = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;
    let log_err = log_out.try_clone().context("cloning log file handle")?;

    let mut path = OsString::from(cwd.as_os_str());
    if let Some(existing) = std::env::var_os("PATH") {
        path.push(":");
        path.push(existing);
    }

    Command::new(&program)
        .args(&argv)
        .current_dir(cwd)
        .env("PATH", path)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(log_out))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {program:?}"))
}
