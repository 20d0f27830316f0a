use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the supervised backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing launched yet in this session
    #[default]
    Idle,
    /// Environment resolved, port reclaimed, spawn in progress
    Launching,
    /// Child is running, waiting for the health endpoint
    Probing,
    /// Health endpoint answered 200
    Ready,
    /// Shutdown sequence running
    Stopping,
    Stopped,
    /// Launch or health check failed; a new start is allowed
    Failed,
}

impl LifecycleState {
    /// A child exists or is about to exist.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Launching | Self::Probing | Self::Ready | Self::Stopping
        )
    }

    pub fn is_starting(self) -> bool {
        matches!(self, Self::Launching | Self::Probing)
    }

    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Failed)
    }

    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Probing => "probing",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Spawned,
    SpawnFailed,
    ProbeReady,
    ProbeExhausted,
    ExitedDuringStartup,
    Stop,
    UnsolicitedExit,
    ShutdownComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {event:?} while {from}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub event: Event,
}

impl LifecycleState {
    /// Pure transition function. No I/O; the coordinator applies the result.
    pub fn on_event(self, event: Event) -> Result<LifecycleState, InvalidTransition> {
        use Event::*;
        use LifecycleState::*;

        let next = match (self, event) {
            (Idle | Stopped | Failed, Start) => Launching,
            (Launching, Spawned) => Probing,
            (Launching, SpawnFailed) => Failed,
            (Probing, ProbeReady) => Ready,
            (Probing, ProbeExhausted) => Failed,
            (Probing, ExitedDuringStartup) => Failed,
            (Launching | Probing | Ready, Stop) => Stopping,
            (Ready, UnsolicitedExit) => Stopped,
            (Stopping, ShutdownComplete) => Stopped,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::Event::*;
    use super::LifecycleState::*;
    use super::*;

    fn run(events: &[Event]) -> Result<LifecycleState, InvalidTransition> {
        events
            .iter()
            .try_fold(Idle, |state, event| state.on_event(*event))
    }

    #[test]
    fn happy_path_to_ready_and_back() {
        assert_eq!(run(&[Start, Spawned, ProbeReady]), Ok(Ready));
        assert_eq!(
            run(&[Start, Spawned, ProbeReady, Stop, ShutdownComplete]),
            Ok(Stopped)
        );
    }

    #[test]
    fn full_relaunch_from_stopped() {
        assert_eq!(
            run(&[
                Start,
                Spawned,
                ProbeReady,
                Stop,
                ShutdownComplete,
                Start,
                Spawned,
                ProbeReady
            ]),
            Ok(Ready)
        );
    }

    #[test]
    fn failures_are_recoverable_by_start() {
        assert_eq!(run(&[Start, SpawnFailed]), Ok(Failed));
        assert_eq!(run(&[Start, Spawned, ProbeExhausted]), Ok(Failed));
        assert_eq!(run(&[Start, Spawned, ExitedDuringStartup]), Ok(Failed));
        assert_eq!(run(&[Start, SpawnFailed, Start]), Ok(Launching));
    }

    #[test]
    fn unsolicited_exit_resets_to_stopped() {
        assert_eq!(run(&[Start, Spawned, ProbeReady, UnsolicitedExit]), Ok(Stopped));
    }

    #[test]
    fn stop_during_probe_never_reaches_ready() {
        let state = run(&[Start, Spawned, Stop]).unwrap();
        assert_eq!(state, Stopping);
        assert!(state.on_event(ProbeReady).is_err());
        assert_eq!(state.on_event(ShutdownComplete), Ok(Stopped));
    }

    #[test]
    fn second_start_is_rejected_while_active() {
        for events in [
            &[Start][..],
            &[Start, Spawned][..],
            &[Start, Spawned, ProbeReady][..],
            &[Start, Spawned, ProbeReady, Stop][..],
        ] {
            let state = run(events).unwrap();
            assert!(state.is_active());
            assert!(!state.can_start());
            assert_eq!(
                state.on_event(Start),
                Err(InvalidTransition {
                    from: state,
                    event: Start
                })
            );
        }
    }

    #[test]
    fn stop_is_not_a_transition_when_nothing_runs() {
        for state in [Idle, Stopped, Failed] {
            assert!(state.on_event(Stop).is_err());
            assert!(!state.is_active());
        }
    }
}
