//! Supervision of the FretCoach backend service.
//!
//! The desktop shell runs exactly one backend process: a Python API server on a
//! fixed loopback port. This crate launches it, waits for it to become healthy,
//! relays its output, and tears it down without leaving orphans or a bound port.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod gateway;
pub mod instance;
pub mod launcher;
pub mod ports;
pub mod probe;
pub mod shutdown;
pub mod state;

pub use api::{ApiRequest, ApiResponse, CONTROL_SOCKET, ControlServer, api_request};
pub use config::{ProbePolicy, ServiceCommand, ServiceEndpoint, ShutdownPolicy, SupervisorConfig};
pub use coordinator::{Coordinator, Notification, StartMode, StartOutcome, StatusSnapshot};
pub use env::{EnvironmentMap, ResolvedEnv};
pub use error::{LaunchError, Result, SupervisorError};
pub use gateway::{ConfigResponse, ControlGateway, ControlResponse, StatusResponse};
pub use instance::{Acquisition, InstanceGuard, InstanceLock, claim_or_focus};
pub use launcher::{ExitInfo, LaunchSpec, Launcher, ServiceHandle, TokioLauncher};
pub use ports::{KillSignal, Platform, PortReclaimer, SystemPlatform};
pub use probe::{HealthProbeResult, HealthProber, ProbeOutcome};
pub use shutdown::{ShutdownReport, ShutdownSequencer};
pub use state::LifecycleState;
