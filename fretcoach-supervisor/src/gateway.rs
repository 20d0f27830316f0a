//! Request/response surface for the UI layer.
//!
//! Every operation resolves to a plain serde struct. Errors and panics inside the
//! coordinator become `{ "success": false, "error": ... }`, never an `Err` or an unwind.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::broadcast;
use tracing::error;

use crate::coordinator::{Coordinator, Notification, StartMode, StartOutcome};
use crate::error::{SupervisorError, panic_message};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub already_running: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub already_starting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

impl From<StartOutcome> for ControlResponse {
    fn from(outcome: StartOutcome) -> Self {
        match outcome {
            StartOutcome::Started => Self::ok(),
            StartOutcome::AlreadyRunning => Self {
                already_running: true,
                ..Self::ok()
            },
            StartOutcome::AlreadyStarting => Self {
                already_starting: true,
                ..Self::ok()
            },
        }
    }
}

impl From<SupervisorError> for ControlResponse {
    fn from(err: SupervisorError) -> Self {
        Self::failed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub backend_path: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct ControlGateway {
    coordinator: Coordinator,
}

impl ControlGateway {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Start and wait until the backend is healthy or has failed.
    pub async fn start(&self) -> ControlResponse {
        guarded("start", async {
            match self.coordinator.start(StartMode::Wait).await {
                Ok(outcome) => outcome.into(),
                Err(e) => e.into(),
            }
        })
        .await
    }

    /// Fire-and-forget start for UI triggers. Returns once the child is spawned.
    pub async fn request_start(&self) -> ControlResponse {
        guarded("request_start", async {
            match self.coordinator.start(StartMode::NoWait).await {
                Ok(outcome) => outcome.into(),
                Err(e) => e.into(),
            }
        })
        .await
    }

    pub async fn stop(&self) -> ControlResponse {
        guarded("stop", async {
            self.coordinator.stop().await;
            ControlResponse::ok()
        })
        .await
    }

    /// Readiness only. Never touches the child.
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            ready: self.coordinator.is_ready(),
        }
    }

    pub fn config(&self) -> ConfigResponse {
        let config = self.coordinator.config();
        ConfigResponse {
            backend_path: config.command.cwd.display().to_string(),
            port: config.endpoint.port,
        }
    }

    pub fn request_focus(&self) {
        self.coordinator.request_focus();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.coordinator.subscribe()
    }
}

async fn guarded<F>(operation: &str, fut: F) -> ControlResponse
where
    F: Future<Output = ControlResponse>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("Control operation {} panicked: {}", operation, message);
            ControlResponse::failed(format!("internal error during {}: {}", operation, message))
        }
    }
}
