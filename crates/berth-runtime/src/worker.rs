//! Worker processes.
//!
//! A worker is one OS process running the image's start command. It moves
//! `Starting → Running → {Crashed | Terminated}` and is owned by exactly one
//! supervisor slot.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use berth_common::constants::{APP_LOAD_ERROR_EXIT_CODE, WORKER_ID_ENV};
use berth_common::error::{BerthError, Result};
use berth_common::types::WorkerState;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::envfile::Environment;
use crate::listener::SharedListener;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed.
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// Converts an OS exit status.
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Exit 0, or death by a shutdown signal.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        match (self.code, self.signal) {
            (Some(code), _) => code == 0,
            (None, Some(sig)) => sig == libc::SIGTERM || sig == libc::SIGINT,
            (None, None) => false,
        }
    }

    /// Returns whether the application failed to load.
    #[must_use]
    pub const fn is_load_failure(&self) -> bool {
        matches!(self.code, Some(APP_LOAD_ERROR_EXIT_CODE))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(signal) => write!(f, "killed by {}", signal.as_str()),
                Err(_) => write!(f, "killed by signal {sig}"),
            },
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Everything needed to start a worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Resolved program path.
    pub program: PathBuf,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub workdir: PathBuf,
    /// Merged environment.
    pub env: Environment,
    /// File receiving stdout and stderr; inherited when absent.
    pub log_file: Option<PathBuf>,
}

/// Point-in-time view of a worker, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Slot index.
    pub slot: usize,
    /// Process id of the current or last process.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Restarts of this slot so far.
    pub restarts: u32,
    /// Milliseconds since the current process started.
    pub uptime_ms: u64,
    /// How the last process ended.
    pub last_exit: Option<WorkerExit>,
}

/// A spawned worker process.
#[derive(Debug)]
pub struct Worker {
    slot: usize,
    pid: u32,
    child: Child,
    state: WorkerState,
    started_at: Instant,
}

impl Worker {
    /// Spawns a worker for `slot`, sharing `listener` when given.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::EntryPoint` if the process cannot be started, or
    /// an I/O error if the log file cannot be opened.
    pub fn spawn(slot: usize, spec: &WorkerSpec, listener: Option<&SharedListener>) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        let _ = cmd
            .args(&spec.args)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter())
            .env(WORKER_ID_ENV, slot.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = &spec.log_file {
            let out = crate::logs::open_append(path)?;
            let err = out.try_clone().map_err(|e| BerthError::io(path, e))?;
            let _ = cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }
        if let Some(listener) = listener {
            listener.share_with(&mut cmd);
        }

        let child = cmd.spawn().map_err(|e| BerthError::EntryPoint {
            message: format!("cannot start `{}`: {e}", spec.program.display()),
        })?;
        let pid = child.id().ok_or_else(|| BerthError::EntryPoint {
            message: format!("worker {slot} exited before it was tracked"),
        })?;
        tracing::debug!(worker = slot, pid, program = %spec.program.display(), "worker spawned");
        Ok(Self {
            slot,
            pid,
            child,
            state: WorkerState::Starting,
            started_at: Instant::now(),
        })
    }

    /// Returns the slot index.
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Returns the process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// Returns how long the process has been alive.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Promotes a starting worker that survived the readiness window.
    ///
    /// Returns whether the state changed.
    pub fn promote_if_ready(&mut self, ready_after: Duration) -> bool {
        if self.state == WorkerState::Starting && self.uptime() >= ready_after {
            self.state = WorkerState::Running;
            return true;
        }
        false
    }

    /// Polls for exit without blocking, recording the final state.
    ///
    /// # Errors
    ///
    /// Returns an error if the process status cannot be queried.
    pub fn try_exit(&mut self) -> Result<Option<WorkerExit>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| BerthError::io(format!("/proc/{}", self.pid), e))?;
        Ok(status.map(|s| self.record_exit(WorkerExit::from_status(s))))
    }

    /// Waits for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> Result<WorkerExit> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| BerthError::io(format!("/proc/{}", self.pid), e))?;
        Ok(self.record_exit(WorkerExit::from_status(status)))
    }

    fn record_exit(&mut self, exit: WorkerExit) -> WorkerExit {
        self.state = if exit.is_clean() {
            WorkerState::Terminated
        } else {
            WorkerState::Crashed
        };
        exit
    }

    /// Sends a signal to the process. A process that is already gone is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let raw = i32::try_from(self.pid).map_err(|_| BerthError::Config {
            message: format!("pid {} out of range", self.pid),
        })?;
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(BerthError::io(
                format!("/proc/{}", self.pid),
                std::io::Error::from(e),
            )),
        }
    }

    /// Returns a status snapshot.
    #[must_use]
    pub fn snapshot(&self, restarts: u32, last_exit: Option<WorkerExit>) -> WorkerSnapshot {
        WorkerSnapshot {
            slot: self.slot,
            pid: Some(self.pid),
            state: self.state,
            restarts,
            uptime_ms: u64::try_from(self.uptime().as_millis()).unwrap_or(u64::MAX),
            last_exit,
        }
    }
}
