//! Application quit driven by signals.
//!
//! The first SIGINT/SIGTERM/SIGHUP cancels the shared token so the shell can stop
//! the backend cleanly. A repeat means the user is done waiting: the signal is
//! delivered again with its default disposition.

use miette::{IntoDiagnostic, Result};
use nix::sys::signal::{self as nix_signal, SigHandler, Signal};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::signal::unix::{self as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Shutdown {
    token: CancellationToken,
    /// Raw number of the first quit signal, 0 until one arrives.
    first_signal: AtomicI32,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            first_signal: AtomicI32::new(0),
        })
    }

    /// Request quit without a signal.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn last_signal(&self) -> Option<Signal> {
        match self.first_signal.load(Ordering::Acquire) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }

    /// Remember `signal` if it is the first one. Returns false for repeats.
    fn record_signal(&self, signal: Signal) -> bool {
        self.first_signal
            .compare_exchange(0, signal as i32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Route SIGINT, SIGTERM and SIGHUP into this handle.
    pub fn install_signals(self: &Arc<Self>) -> Result<()> {
        let mut signals = QuitSignals::register()?;
        let shutdown = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let received = signals.next().await;
                if !shutdown.record_signal(received) {
                    info!("Received {:?} again, exiting immediately", received);
                    force_exit(received);
                }
                info!("Received {:?}, stopping the backend before quitting", received);
                shutdown.shutdown();
            }
        });

        Ok(())
    }
}

struct QuitSignals {
    interrupt: unix_signal::Signal,
    terminate: unix_signal::Signal,
    hangup: unix_signal::Signal,
}

impl QuitSignals {
    fn register() -> Result<Self> {
        let listen = |kind| unix_signal::signal(kind).into_diagnostic();
        Ok(Self {
            interrupt: listen(SignalKind::interrupt())?,
            terminate: listen(SignalKind::terminate())?,
            hangup: listen(SignalKind::hangup())?,
        })
    }

    async fn next(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::SIGINT,
            _ = self.terminate.recv() => Signal::SIGTERM,
            _ = self.hangup.recv() => Signal::SIGHUP,
        }
    }
}

/// Deliver `signal` to ourselves with the default disposition so the exit status
/// reports it. Falls back to the conventional `128 + signo` exit code.
fn force_exit(signal: Signal) -> ! {
    // SAFETY: SIG_DFL installs no handler code.
    match unsafe { nix_signal::signal(signal, SigHandler::SigDfl) } {
        Ok(_) => {
            if let Err(e) = nix_signal::raise(signal) {
                warn!("Failed to raise {:?}: {}", signal, e);
            }
        }
        Err(e) => warn!("Failed to reset handler for {:?}: {}", signal, e),
    }
    std::process::exit(128 + signal as i32);
}
