//! Control socket for the GUI front-end.
//!
//! Protocol: newline-delimited JSON over a Unix stream socket. Each request line gets
//! exactly one response line. After `subscribe` the connection carries one
//! [`Notification`] per line until the client goes away.

use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Notification;
use crate::gateway::{ConfigResponse, ControlGateway, ControlResponse, StatusResponse};

/// File name of the control socket inside the runtime directory.
pub const CONTROL_SOCKET: &str = "control.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Start and answer once healthy or failed.
    Start,
    /// Start and answer once spawned.
    StartDetached,
    Stop,
    Status,
    Config,
    /// Bring the running instance's window to the front.
    Focus,
    /// Switch the connection to a notification stream.
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse {
    Control(ControlResponse),
    Status(StatusResponse),
    Config(ConfigResponse),
}

/// Accept loop bound to the control socket. The socket file is removed on drop.
pub struct ControlServer {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind `socket_path`, replacing a stale socket left by a previous run.
    pub fn bind(
        socket_path: &Path,
        gateway: ControlGateway,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let _ = std::fs::remove_file(socket_path);

        let listener = std::os::unix::net::UnixListener::bind(socket_path)
            .into_diagnostic()
            .wrap_err_with(|| {
                format!("Failed to bind control socket at {}", socket_path.display())
            })?;
        listener.set_nonblocking(true).into_diagnostic()?;
        let listener = tokio::net::UnixListener::from_std(listener).into_diagnostic()?;
        info!("Control socket listening on {}", socket_path.display());

        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_client(stream, gateway.clone(), cancel.clone()));
                    }
                    Err(e) => {
                        warn!("Control socket accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            debug!("Control socket closed");
        });

        Ok(Self {
            path: socket_path.to_path_buf(),
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_client(stream: UnixStream, gateway: ControlGateway, cancel: CancellationToken) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                debug!("Control client read error: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<ApiRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                let response = ApiResponse::Control(ControlResponse::failed(format!(
                    "invalid request: {}",
                    e
                )));
                if write_line(&mut writer, &response).await.is_err() {
                    return;
                }
                continue;
            }
        };
        debug!(?request, "control request");

        let response = match request {
            ApiRequest::Start => ApiResponse::Control(gateway.start().await),
            ApiRequest::StartDetached => ApiResponse::Control(gateway.request_start().await),
            ApiRequest::Stop => ApiResponse::Control(gateway.stop().await),
            ApiRequest::Status => ApiResponse::Status(gateway.status()),
            ApiRequest::Config => ApiResponse::Config(gateway.config()),
            ApiRequest::Focus => {
                info!("Another launch asked for focus");
                gateway.request_focus();
                ApiResponse::Control(ControlResponse::ok())
            }
            ApiRequest::Subscribe => {
                // Subscribe before acknowledging so nothing sent after the ack is missed.
                let rx = gateway.subscribe();
                if write_line(&mut writer, &ApiResponse::Control(ControlResponse::ok()))
                    .await
                    .is_ok()
                {
                    stream_notifications(rx, &mut writer, &cancel).await;
                }
                return;
            }
        };

        // The client may have gone away while a long start ran.
        if write_line(&mut writer, &response).await.is_err() {
            debug!("Control client left before the response was written");
            return;
        }
    }
}

async fn stream_notifications(
    mut rx: broadcast::Receiver<Notification>,
    writer: &mut OwnedWriteHalf,
    cancel: &CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => return,
            notification = rx.recv() => notification,
        };
        match notification {
            Ok(notification) => {
                if write_line(writer, &notification).await.is_err() {
                    debug!("Subscriber disconnected");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Subscriber lagged, dropped {} notifications", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> std::io::Result<()> {
    let mut json = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    json.push(b'\n');
    writer.write_all(&json).await
}

async fn connect(socket_path: &Path) -> Result<UnixStream> {
    UnixStream::connect(socket_path)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to connect to {}", socket_path.display()))
}

async fn send_request(stream: &mut UnixStream, request: &ApiRequest) -> Result<()> {
    let mut request_json = serde_json::to_vec(request).into_diagnostic()?;
    request_json.push(b'\n');
    stream
        .write_all(&request_json)
        .await
        .into_diagnostic()
        .wrap_err("Failed to send control request")
}

/// Connect to a running instance's control socket and send one request.
pub async fn api_request(socket_path: &Path, request: &ApiRequest) -> Result<ApiResponse> {
    let mut stream = connect(socket_path).await?;
    send_request(&mut stream, request).await?;

    let mut reader = BufReader::new(&mut stream);
    let mut response = String::new();
    reader
        .read_line(&mut response)
        .await
        .into_diagnostic()
        .wrap_err("Failed to read control response")?;

    serde_json::from_str(&response)
        .into_diagnostic()
        .wrap_err("Failed to parse control response")
}

/// A connection switched to notification streaming.
pub struct Subscription {
    lines: tokio::io::Lines<BufReader<UnixStream>>,
}

impl Subscription {
    /// Next notification, or `None` once the server closes the stream.
    pub async fn next(&mut self) -> Result<Option<Notification>> {
        loop {
            let Some(line) = self.lines.next_line().await.into_diagnostic()? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .into_diagnostic()
                .wrap_err("Failed to parse notification");
        }
    }
}

/// Open a notification stream on a running instance.
pub async fn subscribe(socket_path: &Path) -> Result<Subscription> {
    let mut stream = connect(socket_path).await?;
    send_request(&mut stream, &ApiRequest::Subscribe).await?;

    let mut lines = BufReader::new(stream).lines();
    let ack = lines
        .next_line()
        .await
        .into_diagnostic()?
        .ok_or_else(|| miette::miette!("Control socket closed before acknowledging subscribe"))?;
    match serde_json::from_str::<ApiResponse>(&ack).into_diagnostic()? {
        ApiResponse::Control(ControlResponse { success: true, .. }) => Ok(Subscription { lines }),
        other => miette::bail!("Subscribe rejected: {:?}", other),
    }
}
