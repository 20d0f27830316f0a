//! Shared test utilities for fretcoach-supervisor integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use async_trait::async_trait;
use fretcoach_supervisor::{
    Coordinator, KillSignal, LaunchError, LaunchSpec, Launcher, LifecycleState, Platform,
    ProbePolicy, ServiceCommand, ServiceEndpoint, ServiceHandle, ShutdownPolicy,
    SupervisorConfig, SystemPlatform, TokioLauncher,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Test context that manages temp directories and cleanup
pub struct TestContext {
    pub temp_dir: TempDir,
    pub project_root: PathBuf,
    pub runtime_dir: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let project_root = temp_dir.path().join("project");
        let runtime_dir = temp_dir.path().join("run");
        std::fs::create_dir_all(project_root.join("backend")).expect("Failed to create project");
        std::fs::create_dir_all(&runtime_dir).expect("Failed to create runtime dir");
        Self {
            temp_dir,
            project_root,
            runtime_dir,
        }
    }

    pub fn app_dir(&self) -> PathBuf {
        self.temp_dir.path().join("app")
    }

    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Configuration running `script` under `sh` as the backend, probed on `port`.
    pub fn config(&self, script: &str, port: u16) -> SupervisorConfig {
        let mut config = SupervisorConfig::for_project(&self.project_root, &self.app_dir());
        config.command = ServiceCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: self.project_root.clone(),
        };
        config.endpoint = ServiceEndpoint::loopback(port);
        config.probe = ProbePolicy::new(20, Duration::from_millis(50));
        config.shutdown = ShutdownPolicy::with_grace(Duration::from_millis(500));
        config
    }
}

/// In-process liveness endpoint: answers 200 while healthy, 503 otherwise.
pub struct HealthServer {
    pub port: u16,
    healthy: Arc<AtomicBool>,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl HealthServer {
    pub async fn start(healthy: bool) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind health server");
        let port = listener.local_addr().unwrap().port();
        let healthy = Arc::new(AtomicBool::new(healthy));
        let hits = Arc::new(AtomicUsize::new(0));

        let state = healthy.clone();
        let counter = hits.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let response = if state.load(Ordering::SeqCst) {
                    "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                } else {
                    "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                };
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        Self {
            port,
            healthy,
            hits,
            task,
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A loopback port with nothing listening on it.
pub fn refused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Real launcher that counts spawns and keeps the last spec.
#[derive(Default)]
pub struct CountingLauncher {
    launches: AtomicUsize,
    last_spec: Mutex<Option<LaunchSpec>>,
}

impl CountingLauncher {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        self.last_spec.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for CountingLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<ServiceHandle, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        TokioLauncher.launch(spec).await
    }
}

/// Platform that signals real pids but reports no port holders, recording every call.
#[derive(Default)]
pub struct RecordingPlatform {
    lookups: Mutex<Vec<u16>>,
    kills: Mutex<Vec<(u32, KillSignal)>>,
    group_kills: Mutex<Vec<(u32, KillSignal)>>,
}

impl RecordingPlatform {
    pub fn lookups(&self) -> Vec<u16> {
        self.lookups.lock().unwrap().clone()
    }

    pub fn kills(&self) -> Vec<(u32, KillSignal)> {
        self.kills.lock().unwrap().clone()
    }

    pub fn group_kills(&self) -> Vec<(u32, KillSignal)> {
        self.group_kills.lock().unwrap().clone()
    }
}

impl Platform for RecordingPlatform {
    fn processes_on_port(&self, port: u16) -> Vec<u32> {
        self.lookups.lock().unwrap().push(port);
        Vec::new()
    }

    fn kill_pid(&self, pid: u32, signal: KillSignal) -> io::Result<()> {
        self.kills.lock().unwrap().push((pid, signal));
        SystemPlatform.kill_pid(pid, signal)
    }

    fn kill_group(&self, pgid: u32, signal: KillSignal) -> io::Result<()> {
        self.group_kills.lock().unwrap().push((pgid, signal));
        SystemPlatform.kill_group(pgid, signal)
    }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub launcher: Arc<CountingLauncher>,
    pub platform: Arc<RecordingPlatform>,
}

pub fn harness(config: SupervisorConfig) -> Harness {
    let launcher = Arc::new(CountingLauncher::default());
    let platform = Arc::new(RecordingPlatform::default());
    let coordinator = Coordinator::new(config, launcher.clone(), platform.clone())
        .expect("Failed to create coordinator");
    Harness {
        coordinator,
        launcher,
        platform,
    }
}

/// Wait until the coordinator reaches `state`, failing the test after `limit`.
pub async fn wait_for_state(coordinator: &Coordinator, state: LifecycleState, limit: Duration) {
    let mut rx = coordinator.watch_state();
    tokio::time::timeout(limit, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("state channel closed");
}

/// Whether a pid still names a live (non-zombie) process.
pub fn pid_alive(pid: u32) -> bool {
    let status = std::fs::read_to_string(format!("/proc/{}/stat", pid));
    match status {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}
