//! Agent subprocess supervision.
//!
//! Spawns the configured agent command with the task prompt appended,
//! wires both output streams into the task's capture, and watches for
//! exit.  The `exit`/kill/escalation races collapse into exactly one
//! [`ProcessExit`] delivered over a oneshot channel.
//!
//! Kill protocol: SIGTERM first, SIGKILL after a grace period if the
//! process has not exited.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use overseer_store::OutputStream;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use overseer_kernel::{TaskError, TaskResult};

use crate::capture::OutputCapture;

/// Why a kill was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The caller cancelled the task.
    Cancel,
    /// The task's wall-clock timeout fired.
    Timeout,
    /// The daemon is shutting down.
    Shutdown,
}

/// Terminal classification of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit code 0 with no kill in flight.
    Completed,
    /// Non-zero exit code, or signal-terminated with no kill in flight.
    Failed,
    /// Killed because of cancellation or shutdown.
    Cancelled,
    /// Killed because the timeout timer fired.
    TimedOut,
}

/// The single exit report for one supervised process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    pub class: ExitClass,
    /// The OS exit code, absent for signal-terminated processes.
    pub exit_code: Option<i32>,
}

/// Cloneable handle used to request a kill.
#[derive(Clone, Debug)]
pub struct ProcessKiller {
    tx: mpsc::UnboundedSender<KillReason>,
}

impl ProcessKiller {
    /// Request termination.  Later requests for the same process are
    /// ignored by the supervise loop.
    pub fn kill(&self, reason: KillReason) {
        let _ = self.tx.send(reason);
    }
}

/// A live supervised process.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub pid: u32,
    killer: ProcessKiller,
}

impl SupervisedProcess {
    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }
}

/// Spawns and supervises agent subprocesses.
#[derive(Clone)]
pub struct ProcessSupervisor {
    /// Argv prefix; the prompt is appended as the final argument.
    agent_command: Vec<String>,
    /// SIGTERM-to-SIGKILL grace window.
    kill_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(agent_command: Vec<String>, kill_grace: Duration) -> Self {
        debug_assert!(!agent_command.is_empty());
        Self {
            agent_command,
            kill_grace,
        }
    }

    /// Spawn the agent for one task.
    ///
    /// Returns the live process handle plus the oneshot that will carry
    /// its single exit report.
    pub async fn spawn(
        &self,
        prompt: &str,
        working_directory: Option<&str>,
        capture: Arc<OutputCapture>,
    ) -> TaskResult<(SupervisedProcess, oneshot::Receiver<ProcessExit>)> {
        let (program, args) = self
            .agent_command
            .split_first()
            .ok_or_else(|| TaskError::spawn_failed("agent command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = working_directory {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TaskError::spawn_failed(format!("failed to spawn agent `{program}`: {e}"))
                .with_context("program", program.clone())
        })?;

        let pid = child
            .id()
            .ok_or_else(|| TaskError::spawn_failed("spawned agent has no pid"))?;

        // Wire both streams into the capture before watching for exit so
        // no early output is lost.
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, Arc::clone(&capture)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, Arc::clone(&capture)));
        }

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        supervise(child, pid, kill_rx, exit_tx, self.kill_grace, readers);

        debug!(pid, "agent process spawned");
        Ok((
            SupervisedProcess {
                pid,
                killer: ProcessKiller { tx: kill_tx },
            },
            exit_rx,
        ))
    }
}

/// Forward one pipe into the capture until EOF.
fn spawn_reader(
    mut pipe: impl AsyncReadExt + Unpin + Send + 'static,
    stream: OutputStream,
    capture: Arc<OutputCapture>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 8_192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    capture.append(stream, &chunk);
                }
                Err(err) => {
                    trace!(?stream, %err, "pipe read ended");
                    break;
                }
            }
        }
    })
}

/// Watch for exit and kill requests; deliver exactly one classification.
fn supervise(
    mut child: Child,
    pid: u32,
    mut kill_rx: mpsc::UnboundedReceiver<KillReason>,
    exit_tx: oneshot::Sender<ProcessExit>,
    grace: Duration,
    readers: Vec<tokio::task::JoinHandle<()>>,
) {
    tokio::spawn(async move {
        let mut kill_reason: Option<KillReason> = None;
        let mut escalate_at: Option<Instant> = None;
        let mut kill_closed = false;

        let status = loop {
            let escalate = async {
                match escalate_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                status = child.wait() => break status,
                maybe = kill_rx.recv(), if !kill_closed => {
                    match maybe {
                        Some(reason) if kill_reason.is_none() => {
                            kill_reason = Some(reason);
                            debug!(pid, ?reason, "sending SIGTERM");
                            // SAFETY: pid came from a child we spawned.
                            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                            if ret != 0 {
                                warn!(pid, "SIGTERM delivery failed");
                            }
                            escalate_at = Some(Instant::now() + grace);
                        }
                        Some(reason) => {
                            trace!(pid, ?reason, "kill already in flight, ignoring");
                        }
                        None => kill_closed = true,
                    }
                }
                _ = escalate => {
                    debug!(pid, "grace period expired, sending SIGKILL");
                    let _ = child.kill().await;
                    escalate_at = None;
                }
            }
        };

        // Drain the pipe readers before reporting so the capture holds
        // everything the process wrote.  Bounded wait: a grandchild that
        // inherited the pipe could hold it open indefinitely.
        let drain = async {
            for reader in readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), drain).await.is_err() {
            warn!(pid, "output readers still draining after exit, reporting anyway");
        }

        let exit = classify(status, kill_reason);
        debug!(pid, class = ?exit.class, exit_code = ?exit.exit_code, "process exited");
        // The receiver may be gone during shutdown; that is fine.
        let _ = exit_tx.send(exit);
    });
}

/// Collapse the exit status and any in-flight kill into one class.
fn classify(
    status: std::io::Result<std::process::ExitStatus>,
    kill_reason: Option<KillReason>,
) -> ProcessExit {
    let code = status.as_ref().ok().and_then(|s| s.code());
    let class = match kill_reason {
        Some(KillReason::Timeout) => ExitClass::TimedOut,
        Some(KillReason::Cancel) | Some(KillReason::Shutdown) => ExitClass::Cancelled,
        None => match code {
            Some(0) => ExitClass::Completed,
            // Non-zero exit, signal termination, or a wait error.
            Some(_) | None => ExitClass::Failed,
        },
    };
    ProcessExit {
        class,
        exit_code: code,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(
            vec!["sh".into(), "-c".into()],
            Duration::from_millis(200),
        )
    }

    fn test_capture(dir: &tempfile::TempDir) -> Arc<OutputCapture> {
        Arc::new(OutputCapture::new("t1", 1 << 20, dir.path()))
    }

    #[tokio::test]
    async fn echo_completes_with_captured_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let capture = test_capture(&dir);
        let supervisor = shell_supervisor();

        let (process, exit_rx) = supervisor
            .spawn("echo hello", None, Arc::clone(&capture))
            .await
            .unwrap();
        assert!(process.pid > 0);

        let exit = exit_rx.await.unwrap();
        assert_eq!(exit.class, ExitClass::Completed);
        assert_eq!(exit.exit_code, Some(0));

        // Readers drain asynchronously; give them a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(capture.snapshot().stdout, vec!["hello"]);
    }

    #[tokio::test]
    async fn nonzero_exit_classifies_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = shell_supervisor();

        let (_process, exit_rx) = supervisor
            .spawn("echo oops >&2; exit 3", None, test_capture(&dir))
            .await
            .unwrap();

        let exit = exit_rx.await.unwrap();
        assert_eq!(exit.class, ExitClass::Failed);
        assert_eq!(exit.exit_code, Some(3));
    }

    #[tokio::test]
    async fn stderr_is_kept_separate() {
        let dir = tempfile::tempdir().unwrap();
        let capture = test_capture(&dir);
        let supervisor = shell_supervisor();

        let (_process, exit_rx) = supervisor
            .spawn("echo out; echo err >&2", None, Arc::clone(&capture))
            .await
            .unwrap();
        exit_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let output = capture.snapshot();
        assert_eq!(output.stdout, vec!["out"]);
        assert_eq!(output.stderr, vec!["err"]);
    }

    #[tokio::test]
    async fn cancel_kill_classifies_as_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = shell_supervisor();

        let (process, exit_rx) = supervisor
            .spawn("sleep 30", None, test_capture(&dir))
            .await
            .unwrap();

        process.killer().kill(KillReason::Cancel);
        let exit = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .expect("kill should terminate the process")
            .unwrap();
        assert_eq!(exit.class, ExitClass::Cancelled);
        assert_eq!(exit.exit_code, None);
    }

    #[tokio::test]
    async fn timeout_kill_classifies_as_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = shell_supervisor();

        let (process, exit_rx) = supervisor
            .spawn("sleep 30", None, test_capture(&dir))
            .await
            .unwrap();

        process.killer().kill(KillReason::Timeout);
        let exit = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .expect("kill should terminate the process")
            .unwrap();
        assert_eq!(exit.class, ExitClass::TimedOut);
    }

    #[tokio::test]
    async fn sigterm_ignoring_process_is_sigkilled_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = shell_supervisor();

        // Trap and ignore SIGTERM; only SIGKILL can end this.
        let (process, exit_rx) = supervisor
            .spawn("trap '' TERM; sleep 30", None, test_capture(&dir))
            .await
            .unwrap();

        // Let the shell install the trap before killing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.killer().kill(KillReason::Cancel);

        let exit = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .expect("escalation should terminate the process")
            .unwrap();
        assert_eq!(exit.class, ExitClass::Cancelled);
    }

    #[tokio::test]
    async fn duplicate_kills_deliver_one_exit() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = shell_supervisor();

        let (process, exit_rx) = supervisor
            .spawn("sleep 30", None, test_capture(&dir))
            .await
            .unwrap();

        let killer = process.killer();
        killer.kill(KillReason::Cancel);
        killer.kill(KillReason::Timeout);
        killer.kill(KillReason::Cancel);

        // The first reason wins; the oneshot delivers exactly once.
        let exit = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.class, ExitClass::Cancelled);
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failed() {
        let supervisor = ProcessSupervisor::new(
            vec!["/nonexistent/agent/binary".into()],
            Duration::from_millis(200),
        );
        let dir = tempfile::tempdir().unwrap();

        let err = supervisor
            .spawn("anything", None, test_capture(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), overseer_kernel::ErrorKind::SpawnFailed);
    }

    #[tokio::test]
    async fn working_directory_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let capture = test_capture(&dir);
        let supervisor = shell_supervisor();

        let (_process, exit_rx) = supervisor
            .spawn(
                "pwd",
                Some(dir.path().to_str().unwrap()),
                Arc::clone(&capture),
            )
            .await
            .unwrap();
        exit_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stdout = capture.snapshot().stdout;
        let reported = std::fs::canonicalize(&stdout[0]).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(reported, expected);
    }
}
