//! Graceful-then-forceful termination of the backend.
//!
//! SIGTERM first. If the child outlives the grace period it is killed through its
//! owned handle and, independently, by pid and by process group. The whole sequence
//! is bounded by `grace_period + reap_timeout` and never fails.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ShutdownPolicy;
use crate::launcher::{ExitInfo, ProcessControl};
use crate::ports::{KillSignal, Platform};

/// How a shutdown went. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The child exited within the grace period.
    pub graceful: bool,
    /// Exit status, if it was observed before the sequence gave up waiting.
    pub exit: Option<ExitInfo>,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct ShutdownSequencer {
    policy: ShutdownPolicy,
    platform: Arc<dyn Platform>,
}

impl ShutdownSequencer {
    pub fn new(policy: ShutdownPolicy, platform: Arc<dyn Platform>) -> Self {
        Self { policy, platform }
    }

    /// Terminate the child behind `control`. `listeners` is the task forwarding its
    /// output and exit; it is aborted before any signal is sent.
    pub async fn shutdown(
        &self,
        control: ProcessControl,
        listeners: Option<JoinHandle<()>>,
    ) -> ShutdownReport {
        let started = Instant::now();

        if let Some(listeners) = listeners {
            listeners.abort();
        }

        if let Some(exit) = control.exit_info() {
            debug!("Backend already exited with {}", exit);
            return ShutdownReport {
                graceful: true,
                exit: Some(exit),
                elapsed: started.elapsed(),
            };
        }

        let pid = control.pid();
        match pid {
            Some(pid) => {
                debug!("Sending SIGTERM to backend (pid {})", pid);
                if let Err(e) = self.platform.kill_pid(pid, KillSignal::Terminate) {
                    debug!("SIGTERM to {} failed: {}", pid, e);
                }
            }
            None => control.kill(),
        }

        if let Ok(exit) = timeout(self.policy.grace_period(), control.wait_exit()).await {
            info!("Backend stopped gracefully ({})", exit);
            return ShutdownReport {
                graceful: true,
                exit: Some(exit),
                elapsed: started.elapsed(),
            };
        }

        warn!(
            "Backend did not exit within {:?}, killing it",
            self.policy.grace_period()
        );
        control.kill();
        if let Some(pid) = pid {
            if let Err(e) = self.platform.kill_pid(pid, KillSignal::Kill) {
                debug!("SIGKILL to {} failed: {}", pid, e);
            }
            if let Err(e) = self.platform.kill_group(pid, KillSignal::Kill) {
                debug!("SIGKILL to process group {} failed: {}", pid, e);
            }
        }

        let exit = timeout(self.policy.reap_timeout(), control.wait_exit())
            .await
            .ok();
        match exit {
            Some(exit) => info!("Backend killed ({})", exit),
            None => warn!(
                "Backend exit not confirmed within {:?} of SIGKILL",
                self.policy.reap_timeout()
            ),
        }

        ShutdownReport {
            graceful: false,
            exit,
            elapsed: started.elapsed(),
        }
    }
}
