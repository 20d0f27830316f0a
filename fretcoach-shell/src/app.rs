//! Lifetime of one shell instance.

use fretcoach_supervisor::{
    CONTROL_SOCKET, ControlGateway, ControlServer, Coordinator, Notification, SupervisorConfig,
    claim_or_focus,
};
use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::shutdown::Shutdown;

pub struct Settings {
    pub config: SupervisorConfig,
    pub runtime_dir: PathBuf,
    pub autostart: bool,
}

/// Run until quit: claim the instance, clean the port, serve the control socket,
/// start the backend, and on quit stop it and sweep the port again.
pub async fn run(settings: Settings, shutdown: Arc<Shutdown>) -> Result<()> {
    let Some(_instance) = claim_or_focus(&settings.runtime_dir).await? else {
        return Ok(());
    };

    let coordinator = Coordinator::system(settings.config)?;
    let port = coordinator.config().endpoint.port;
    let killed = coordinator.sweep_port().await;
    if !killed.is_empty() {
        info!("Cleaned up {} stale process(es) on port {}", killed.len(), port);
    }

    let gateway = ControlGateway::new(coordinator.clone());
    let socket = settings.runtime_dir.join(CONTROL_SOCKET);
    let _server = ControlServer::bind(
        &socket,
        gateway.clone(),
        shutdown.cancellation_token().child_token(),
    )?;

    let mut events = gateway.subscribe();
    if settings.autostart {
        let response = gateway.request_start().await;
        if !response.success {
            warn!(
                "Backend did not start: {}",
                response.error.unwrap_or_default()
            );
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            event = events.recv() => match event {
                Ok(Notification::FocusRequested) => info!("Another launch asked to focus the window"),
                Ok(Notification::ReadyChanged { ready: true }) => info!("Backend ready on port {}", port),
                Ok(Notification::ReadyChanged { ready: false }) => info!("Backend no longer ready"),
                Ok(Notification::StateChanged { state }) => debug!("Backend {}", state),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} notifications", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    match shutdown.last_signal() {
        Some(signal) => info!("Quitting on {:?}, stopping backend", signal),
        None => info!("Quitting, stopping backend"),
    }
    coordinator.stop().await;
    coordinator.sweep_port().await;
    Ok(())
}
