//! Supervised external processes with exactly-once termination.
//!
//! Termination is signal based: SIGTERM first, then a forced kill once the
//! grace period runs out. Whichever path ends the process (normal exit,
//! explicit terminate or drop) publishes one [`ProcessExit`] on a watch
//! channel.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited on its own
    Completed,
    /// Exited after SIGTERM
    Terminated,
    /// Did not honour SIGTERM within the grace period and was killed
    Killed,
}

/// Final outcome of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub reason: ExitReason,
    /// Exit status when it could be collected
    pub status: Option<ExitStatus>,
}

impl ProcessExit {
    /// Exit code, `None` when killed by a signal or not collected.
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    /// Whether the process completed on its own with status 0.
    pub fn success(&self) -> bool {
        self.reason == ExitReason::Completed && self.status.is_some_and(|status| status.success())
    }
}

/// Child process that is terminated exactly once.
pub struct ManagedProcess {
    label: String,
    pid: Option<u32>,
    child: Option<Child>,
    grace: Duration,
    exit_tx: watch::Sender<Option<ProcessExit>>,
}

impl ManagedProcess {
    /// Takes ownership of a spawned child.
    ///
    /// The child should be spawned with `kill_on_drop(true)` so that it cannot
    /// outlive its supervisor even if termination never runs.
    pub fn new(child: Child, label: impl Into<String>, grace: Duration) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            label: label.into(),
            pid: child.id(),
            child: Some(child),
            grace,
            exit_tx,
        }
    }

    /// OS process id, if the process was running when supervised.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Label used in log lines.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Receiver that observes the process exit once it happens.
    pub fn exit_watcher(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_tx.subscribe()
    }

    /// Whether the process has already ended or is being terminated.
    pub fn is_finished(&self) -> bool {
        self.child.is_none()
    }

    /// Waits for the process to exit on its own. Cancel safe.
    ///
    /// # Errors
    /// - `std::io::Error` - Waiting on the child failed
    pub async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let Some(child) = self.child.as_mut() else {
            return Ok(self.recorded_exit());
        };

        let status = child.wait().await?;
        self.child = None;
        debug!("{} exited with {}", self.label, status);
        Ok(publish(&self.exit_tx, ExitReason::Completed, Some(status)))
    }

    /// Terminates the process: SIGTERM, then a forced kill after the grace period.
    ///
    /// Only the first call signals the process; later calls return the
    /// recorded outcome.
    pub async fn terminate(&mut self) -> ProcessExit {
        match self.child.take() {
            Some(child) => {
                shutdown_child(child, self.label.clone(), self.grace, self.exit_tx.clone()).await
            }
            None => self.recorded_exit(),
        }
    }

    fn recorded_exit(&self) -> ProcessExit {
        (*self.exit_tx.borrow()).unwrap_or(ProcessExit {
            reason: ExitReason::Terminated,
            status: None,
        })
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(shutdown_child(
                    child,
                    self.label.clone(),
                    self.grace,
                    self.exit_tx.clone(),
                ));
            }
            Err(_) => {
                let _ = child.start_kill();
                publish(&self.exit_tx, ExitReason::Killed, None);
            }
        }
    }
}

fn publish(
    exit_tx: &watch::Sender<Option<ProcessExit>>,
    reason: ExitReason,
    status: Option<ExitStatus>,
) -> ProcessExit {
    let exit = ProcessExit { reason, status };
    exit_tx.send_replace(Some(exit));
    exit
}

async fn shutdown_child(
    mut child: Child,
    label: String,
    grace: Duration,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) -> ProcessExit {
    if let Ok(Some(status)) = child.try_wait() {
        return publish(&exit_tx, ExitReason::Completed, Some(status));
    }

    if let Err(e) = send_terminate(&mut child) {
        debug!("Failed to signal {}: {}", label, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("{} terminated with {}", label, status);
            publish(&exit_tx, ExitReason::Terminated, Some(status))
        }
        Ok(Err(e)) => {
            warn!("Failed to wait for {} after termination: {}", label, e);
            publish(&exit_tx, ExitReason::Terminated, None)
        }
        Err(_) => {
            warn!("{} ignored SIGTERM for {:?}, killing", label, grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", label, e);
            }
            let status = child.try_wait().ok().flatten();
            publish(&exit_tx, ExitReason::Killed, status)
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Stdio;

    use tokio::process::Command;

    use super::*;

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_wait_reports_completion() {
        let mut process = ManagedProcess::new(spawn_sh("exit 3"), "exit3", Duration::from_secs(1));
        let exit = process.wait().await.unwrap();

        assert_eq!(exit.reason, ExitReason::Completed);
        assert_eq!(exit.code(), Some(3));
        assert!(!exit.success());
        assert!(process.is_finished());
    }

    #[tokio::test]
    async fn test_terminate_runs_once() {
        let mut process =
            ManagedProcess::new(spawn_sh("exec sleep 30"), "sleeper", Duration::from_secs(2));
        let watcher = process.exit_watcher();

        let first = process.terminate().await;
        assert_eq!(first.reason, ExitReason::Terminated);
        assert_eq!(first.code(), None);

        let second = process.terminate().await;
        assert_eq!(second, first);
        assert_eq!(*watcher.borrow(), Some(first));
    }

    #[tokio::test]
    async fn test_forced_kill_after_grace() {
        let mut process = ManagedProcess::new(
            spawn_sh("trap '' TERM; while true; do sleep 0.05; done"),
            "stubborn",
            Duration::from_millis(200),
        );

        let exit = process.terminate().await;
        assert_eq!(exit.reason, ExitReason::Killed);
    }

    #[tokio::test]
    async fn test_drop_terminates_process() {
        let process = ManagedProcess::new(spawn_sh("exec sleep 30"), "dropped", Duration::from_secs(2));
        let mut watcher = process.exit_watcher();
        drop(process);

        let exit = *tokio::time::timeout(Duration::from_secs(5), watcher.wait_for(Option::is_some))
            .await
            .expect("process should exit after drop")
            .unwrap();
        assert_eq!(exit.map(|e| e.reason), Some(ExitReason::Terminated));
    }
}
