//! Lifecycle coordination of the single backend process.
//!
//! `Coordinator` owns the child and the authoritative `LifecycleState`. Every
//! mutation happens while holding the slot lock, and every transition goes through
//! [`LifecycleState::on_event`]. A generation counter bumped by each start and stop
//! makes late results from an abandoned start harmless.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::env;
use crate::error::{Result, SupervisorError, panic_message};
use crate::launcher::{
    ExitInfo, LaunchSpec, Launcher, OutputStreams, ProcessControl, TokioLauncher, wait_for_exit,
};
use crate::ports::{Platform, PortReclaimer, SystemPlatform};
use crate::probe::{HealthProber, ProbeOutcome};
use crate::shutdown::ShutdownSequencer;
use crate::state::{Event, LifecycleState};

/// Notifications buffered per subscriber before the slowest one starts lagging.
const NOTIFICATION_BUFFER: usize = 1024;

/// How long output is still relayed after the child exits, while the pipes drain.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Resolve once the backend is healthy, or failed.
    Wait,
    /// Resolve once the child is spawned; health probing continues in the background.
    NoWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    AlreadyStarting,
}

/// Asynchronous events for observers of the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    OutputLine { line: String },
    ErrorLine { line: String },
    ReadyChanged { ready: bool },
    StateChanged { state: LifecycleState },
    FocusRequested,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    pub fn ready(&self) -> bool {
        self.state.is_ready()
    }
}

/// The supervised child. Never leaves the slot.
struct ServiceProcess {
    control: ProcessControl,
    relay: Option<JoinHandle<()>>,
    /// Fires once the relay has forwarded everything the child wrote before exiting.
    drained: Option<oneshot::Receiver<()>>,
    started_at: Instant,
}

#[derive(Default)]
struct Slot {
    process: Option<ServiceProcess>,
    generation: u64,
    probe_cancel: Option<CancellationToken>,
    last_error: Option<String>,
}

/// What a launch hands over to the probing phase.
struct PendingProbe {
    generation: u64,
    cancel: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

enum StartupSignal {
    Probe(ProbeOutcome),
    Exited(ExitInfo),
}

struct Shared {
    config: SupervisorConfig,
    launcher: Arc<dyn Launcher>,
    reclaimer: PortReclaimer,
    sequencer: ShutdownSequencer,
    prober: HealthProber,
    state_tx: watch::Sender<LifecycleState>,
    events: broadcast::Sender<Notification>,
    slot: Mutex<Slot>,
}

/// Handle to the lifecycle coordinator. Clones share the same backend.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn Launcher>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self> {
        let (state_tx, _) = watch::channel(LifecycleState::Idle);
        let (events, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let shared = Shared {
            reclaimer: PortReclaimer::new(platform.clone()),
            sequencer: ShutdownSequencer::new(config.shutdown, platform),
            prober: HealthProber::new()?,
            config,
            launcher,
            state_tx,
            events,
            slot: Mutex::new(Slot::default()),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Coordinator spawning real processes on the real process table.
    pub fn system(config: SupervisorConfig) -> Result<Self> {
        Self::new(config, Arc::new(TokioLauncher), Arc::new(SystemPlatform))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.events.subscribe()
    }

    pub async fn status(&self) -> StatusSnapshot {
        let slot = self.shared.slot.lock().await;
        let process = slot.process.as_ref();
        StatusSnapshot {
            state: self.state(),
            pid: process.and_then(|p| p.control.pid()),
            uptime: process.map(|p| p.started_at.elapsed()),
            last_error: slot.last_error.clone(),
        }
    }

    /// Ask the front-end window to come to the foreground.
    pub fn request_focus(&self) {
        self.notify(Notification::FocusRequested);
    }

    /// Kill whatever holds the backend port. Returns the pids signalled.
    pub async fn sweep_port(&self) -> Vec<u32> {
        self.shared
            .reclaimer
            .reclaim_async(self.shared.config.endpoint.port)
            .await
    }

    /// Start the backend unless it is already running or starting.
    ///
    /// A start issued while a previous start is in flight never spawns a second
    /// child: with [`StartMode::Wait`] it waits for that start's outcome, with
    /// [`StartMode::NoWait`] it reports `AlreadyStarting`.
    pub async fn start(&self, mode: StartMode) -> Result<StartOutcome> {
        loop {
            let slot = self.shared.slot.lock().await;
            match self.state() {
                LifecycleState::Ready => {
                    debug!("Backend already running");
                    return Ok(StartOutcome::AlreadyRunning);
                }
                LifecycleState::Launching | LifecycleState::Probing => {
                    if mode == StartMode::NoWait {
                        return Ok(StartOutcome::AlreadyStarting);
                    }
                    drop(slot);
                    return self.join_in_flight().await;
                }
                LifecycleState::Stopping => {
                    drop(slot);
                    self.wait_until(|state| state != LifecycleState::Stopping)
                        .await;
                }
                LifecycleState::Idle | LifecycleState::Stopped | LifecycleState::Failed => {
                    let pending = self.launch(slot).await?;
                    return match mode {
                        StartMode::Wait => {
                            self.await_ready(pending).await?;
                            Ok(StartOutcome::Started)
                        }
                        StartMode::NoWait => {
                            let coordinator = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = coordinator.await_ready(pending).await {
                                    debug!("Background start ended: {}", e);
                                }
                            });
                            Ok(StartOutcome::Started)
                        }
                    };
                }
            }
        }
    }

    /// Stop the backend. A no-op when nothing runs. Never fails.
    pub async fn stop(&self) {
        let mut slot = self.shared.slot.lock().await;
        let state = self.state();
        match state {
            LifecycleState::Idle | LifecycleState::Stopped | LifecycleState::Failed => {
                debug!("Stop requested while {}, nothing to do", state);
                return;
            }
            LifecycleState::Stopping => {
                drop(slot);
                self.wait_until(|state| state != LifecycleState::Stopping)
                    .await;
                return;
            }
            LifecycleState::Launching | LifecycleState::Probing | LifecycleState::Ready => {}
        }

        info!("Stopping backend");
        slot.generation += 1;
        if let Some(cancel) = slot.probe_cancel.take() {
            cancel.cancel();
        }
        self.transition(Event::Stop);

        if let Some(process) = slot.process.take() {
            let report = self
                .shared
                .sequencer
                .shutdown(process.control, process.relay)
                .await;
            debug!(?report, "backend shutdown finished");
        }
        self.sweep_port().await;

        self.transition(Event::ShutdownComplete);
        if state == LifecycleState::Ready {
            self.notify(Notification::ReadyChanged { ready: false });
        }
    }

    /// Resolve the environment, reclaim the port and spawn. Runs under the slot lock.
    async fn launch(&self, mut slot: MutexGuard<'_, Slot>) -> Result<PendingProbe> {
        let config = &self.shared.config;
        slot.generation += 1;
        slot.last_error = None;
        let generation = slot.generation;
        self.transition(Event::Start);

        let resolved = env::resolve(&config.env_candidates);
        self.sweep_port().await;

        let spec = LaunchSpec {
            program: config.command.program.clone(),
            args: config.command.args.clone(),
            cwd: config.command.cwd.clone(),
            env: resolved.vars,
        };
        info!(
            "Launching backend: {} {}",
            spec.program.display(),
            spec.args.join(" ")
        );

        let launched = AssertUnwindSafe(self.shared.launcher.launch(spec))
            .catch_unwind()
            .await;
        let handle = match launched {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let err = SupervisorError::from(e);
                self.fail(&mut slot, Event::SpawnFailed, &err);
                return Err(err);
            }
            Err(panic) => {
                let err = SupervisorError::StartFailed(format!(
                    "launcher panicked: {}",
                    panic_message(panic.as_ref())
                ));
                self.fail(&mut slot, Event::SpawnFailed, &err);
                return Err(err);
            }
        };

        let exit_rx = handle.control.exit_watch();
        let (relay, drained) = spawn_relay(
            Arc::downgrade(&self.shared),
            handle.output,
            exit_rx.clone(),
            generation,
        );
        let cancel = CancellationToken::new();
        slot.probe_cancel = Some(cancel.clone());
        slot.process = Some(ServiceProcess {
            control: handle.control,
            relay: Some(relay),
            drained: Some(drained),
            started_at: Instant::now(),
        });
        self.transition(Event::Spawned);

        Ok(PendingProbe {
            generation,
            cancel,
            exit_rx,
        })
    }

    /// Probe until healthy, exhausted, cancelled, or the child exits.
    async fn await_ready(&self, pending: PendingProbe) -> Result<()> {
        let PendingProbe {
            generation,
            cancel,
            exit_rx,
        } = pending;
        let shared = &self.shared;

        let signal = tokio::select! {
            outcome = shared.prober.probe(&shared.config.endpoint, &shared.config.probe, &cancel) => {
                StartupSignal::Probe(outcome)
            }
            exit = wait_for_exit(exit_rx) => StartupSignal::Exited(exit),
        };

        let mut slot = shared.slot.lock().await;
        if slot.generation != generation || self.state() != LifecycleState::Probing {
            debug!("Start superseded while probing");
            return Err(SupervisorError::Interrupted);
        }
        slot.probe_cancel = None;

        // An exit that raced a successful probe still counts as a startup exit.
        let signal = match (signal, slot.process.as_ref().and_then(|p| p.control.exit_info())) {
            (StartupSignal::Probe(ProbeOutcome::Ready { .. }), Some(exit)) => {
                StartupSignal::Exited(exit)
            }
            (signal, _) => signal,
        };

        match signal {
            StartupSignal::Probe(ProbeOutcome::Ready { .. }) => {
                self.transition(Event::ProbeReady);
                self.notify(Notification::ReadyChanged { ready: true });
                Ok(())
            }
            StartupSignal::Probe(ProbeOutcome::Cancelled) => Err(SupervisorError::Interrupted),
            StartupSignal::Probe(ProbeOutcome::Exhausted { attempts }) => {
                let err = SupervisorError::HealthTimeout { attempts };
                self.discard_process(&mut slot).await;
                self.sweep_port().await;
                self.fail(&mut slot, Event::ProbeExhausted, &err);
                Err(err)
            }
            StartupSignal::Exited(exit) => {
                let err = SupervisorError::ExitedDuringStartup(exit.to_string());
                self.discard_process(&mut slot).await;
                self.sweep_port().await;
                self.fail(&mut slot, Event::ExitedDuringStartup, &err);
                Err(err)
            }
        }
    }

    /// Wait for somebody else's start to settle.
    async fn join_in_flight(&self) -> Result<StartOutcome> {
        let settled = self.wait_until(|state| !state.is_starting()).await;
        match settled {
            LifecycleState::Ready => Ok(StartOutcome::AlreadyRunning),
            LifecycleState::Failed => {
                let slot = self.shared.slot.lock().await;
                let message = slot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "backend failed to start".to_string());
                Err(SupervisorError::StartFailed(message))
            }
            _ => Err(SupervisorError::Interrupted),
        }
    }

    async fn wait_until(&self, predicate: impl Fn(LifecycleState) -> bool) -> LifecycleState {
        let mut rx = self.shared.state_tx.subscribe();
        match rx.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    async fn discard_process(&self, slot: &mut Slot) {
        if let Some(mut process) = slot.process.take() {
            // A dead child's last words (usually a traceback) go out before the relay is cut.
            let exited = process.control.has_exited();
            if let Some(drained) = process.drained.take().filter(|_| exited) {
                if timeout(OUTPUT_DRAIN_TIMEOUT, drained).await.is_err() {
                    debug!("Output of the exited backend did not drain in time");
                }
            }
            self.shared
                .sequencer
                .shutdown(process.control, process.relay)
                .await;
        }
    }

    fn fail(&self, slot: &mut Slot, event: Event, err: &SupervisorError) {
        error!("Backend failed to start: {}", err);
        slot.last_error = Some(err.to_string());
        self.transition(event);
    }

    /// Apply one event to the state machine. Callers hold the slot lock.
    fn transition(&self, event: Event) {
        self.shared.transition(event);
    }

    fn notify(&self, notification: Notification) {
        self.shared.notify(notification);
    }
}

impl Shared {
    fn transition(&self, event: Event) {
        let current = *self.state_tx.borrow();
        match current.on_event(event) {
            Ok(next) => {
                debug!("Backend {} -> {} on {:?}", current, next, event);
                self.state_tx.send_replace(next);
                self.notify(Notification::StateChanged { state: next });
            }
            Err(e) => warn!("Ignoring {}", e),
        }
    }

    /// Nobody listening is fine.
    fn notify(&self, notification: Notification) {
        let _ = self.events.send(notification);
    }

    async fn on_unsolicited_exit(&self, generation: u64, exit: ExitInfo) {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation || !self.state_tx.borrow().is_ready() {
            return;
        }
        warn!("Backend exited unexpectedly ({})", exit);
        slot.process = None;
        self.transition(Event::UnsolicitedExit);
        self.notify(Notification::ReadyChanged { ready: false });
        self.reclaimer
            .reclaim_async(self.config.endpoint.port)
            .await;
    }
}

/// Forward child output to subscribers and the log, then report the exit.
///
/// The returned receiver fires once output has been drained after the exit.
fn spawn_relay(
    shared: Weak<Shared>,
    output: OutputStreams,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    generation: u64,
) -> (JoinHandle<()>, oneshot::Receiver<()>) {
    let (drained_tx, drained_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let OutputStreams {
            mut stdout,
            mut stderr,
        } = output;
        let mut stdout_open = true;
        let mut stderr_open = true;
        let exited = wait_for_exit(exit_rx);
        tokio::pin!(exited);

        // Grandchildren may keep the pipes open, so exit is watched alongside output.
        let exit = loop {
            tokio::select! {
                line = stdout.recv(), if stdout_open => match line {
                    Some(line) => relay_line(&shared, Notification::OutputLine { line }),
                    None => stdout_open = false,
                },
                line = stderr.recv(), if stderr_open => match line {
                    Some(line) => relay_line(&shared, Notification::ErrorLine { line }),
                    None => stderr_open = false,
                },
                exit = &mut exited => break exit,
            }
        };

        // The readers finish at EOF. A grandchild holding a pipe bounds this by the timeout.
        let drain = async {
            loop {
                tokio::select! {
                    line = stdout.recv(), if stdout_open => match line {
                        Some(line) => relay_line(&shared, Notification::OutputLine { line }),
                        None => stdout_open = false,
                    },
                    line = stderr.recv(), if stderr_open => match line {
                        Some(line) => relay_line(&shared, Notification::ErrorLine { line }),
                        None => stderr_open = false,
                    },
                    else => break,
                }
            }
        };
        if timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("Backend output still open {:?} after exit", OUTPUT_DRAIN_TIMEOUT);
        }
        let _ = drained_tx.send(());

        if let Some(shared) = shared.upgrade() {
            shared.on_unsolicited_exit(generation, exit).await;
        }
    });
    (task, drained_rx)
}

fn relay_line(shared: &Weak<Shared>, notification: Notification) {
    match &notification {
        Notification::OutputLine { line } => info!(target: "service", "{}", line),
        Notification::ErrorLine { line } => info!(target: "service", stream = "stderr", "{}", line),
        _ => {}
    }
    if let Some(shared) = shared.upgrade() {
        shared.notify(notification);
    }
}
