//! Subprocess handle with a non-destructive liveness check.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::types::ProcessStatus;

/// Liveness view of a server subprocess.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Probe without disturbing the process.
    fn is_alive(&self) -> bool;

    fn status(&self) -> ProcessStatus;
}

/// `ProcessHandle` over a spawned tokio child.
pub struct ChildProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
        }
    }

    /// Wait up to `grace` for the process to exit on its own, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        let step = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        while waited < grace {
            if !self.is_alive() {
                debug!("MCP server process {:?} exited gracefully", self.pid);
                return;
            }
            tokio::time::sleep(step).await;
            waited += step;
        }

        warn!("MCP server process {:?} did not exit gracefully, killing", self.pid);
        if let Err(e) = self.child.lock().start_kill() {
            warn!("Failed to kill MCP server process {:?}: {}", self.pid, e);
            return;
        }
        // Reap so the pid does not linger as a zombie.
        for _ in 0..20 {
            if !self.is_alive() {
                return;
            }
            tokio::time::sleep(step).await;
        }
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    fn status(&self) -> ProcessStatus {
        // try_wait reaps at most once and caches the exit status afterwards.
        match self.child.lock().try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::Exited {
                code: status.code(),
            },
            Err(e) => {
                debug!("Failed to query MCP server process {:?}: {}", self.pid, e);
                ProcessStatus::Unknown
            }
        }
    }
}
