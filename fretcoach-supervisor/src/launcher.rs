use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::env::EnvironmentMap;
use crate::error::LaunchError;

/// Lines buffered per stream before the child is back-pressured.
const OUTPUT_BUFFER: usize = 256;

/// Everything needed to spawn the service once.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: EnvironmentMap,
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Line streams of the child's stdout and stderr.
pub struct OutputStreams {
    pub stdout: mpsc::Receiver<String>,
    pub stderr: mpsc::Receiver<String>,
}

/// Control side of a running child: pid, exit notification, forceful kill.
pub struct ProcessControl {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
    _stdin: Option<ChildStdin>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    /// A receiver that flips to `Some` exactly once, when the child terminates.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Wait for termination. Resolves immediately if the child already exited.
    pub async fn wait_exit(&self) -> ExitInfo {
        wait_for_exit(self.exit_rx.clone()).await
    }

    /// Ask the owner of the child handle to SIGKILL it.
    pub fn kill(&self) {
        if self.kill_tx.try_send(()).is_err() {
            debug!("Kill request dropped, child handle already released");
        }
    }
}

impl Drop for ProcessControl {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Wait on an exit watch. A closed channel counts as an exit with unknown status.
pub async fn wait_for_exit(mut exit_rx: watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(info) => (*info).unwrap_or_default(),
        Err(_) => ExitInfo::default(),
    }
}

/// A freshly spawned service.
pub struct ServiceHandle {
    pub output: OutputStreams,
    pub control: ProcessControl,
}

/// Spawns the service process.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<ServiceHandle, LaunchError>;
}

/// Launcher backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

#[async_trait]
impl Launcher for TokioLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<ServiceHandle, LaunchError> {
        spawn_service(spec)
    }
}

/// Spawn with fully piped stdio in a new process group.
pub fn spawn_service(spec: LaunchSpec) -> Result<ServiceHandle, LaunchError> {
    if !spec.cwd.is_dir() {
        return Err(LaunchError::MissingCwd(spec.cwd));
    }

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let pid = child.id();
    info!(
        "Spawned {} {} (pid {:?})",
        spec.program.display(),
        spec.args.join(" "),
        pid
    );

    let (stdout_tx, stdout_rx) = mpsc::channel(OUTPUT_BUFFER);
    let (stderr_tx, stderr_rx) = mpsc::channel(OUTPUT_BUFFER);
    let mut tasks = Vec::with_capacity(3);
    if let Some(stdout) = child.stdout.take() {
        tasks.push(spawn_line_reader(stdout, stdout_tx));
    }
    if let Some(stderr) = child.stderr.take() {
        tasks.push(spawn_line_reader(stderr, stderr_tx));
    }
    let stdin = child.stdin.take();

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = mpsc::channel(1);
    tasks.push(spawn_waiter(child, kill_rx, exit_tx));

    Ok(ServiceHandle {
        output: OutputStreams {
            stdout: stdout_rx,
            stderr: stderr_rx,
        },
        control: ProcessControl {
            pid,
            exit_rx,
            kill_tx,
            _stdin: stdin,
            tasks,
        },
    })
}

/// Read a pipe line by line. Keeps draining after the receiver goes away so the
/// child never blocks on a full pipe.
fn spawn_line_reader<R>(pipe: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe).split(b'\n');
        let mut open = true;
        loop {
            match reader.next_segment().await {
                Ok(Some(bytes)) => {
                    if !open {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&bytes)
                        .trim_end_matches('\r')
                        .to_string();
                    if tx.send(line).await.is_err() {
                        open = false;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Output pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Own the child: wait for exit, or kill it on request.
fn spawn_waiter(
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Some(()) = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    debug!("Kill through child handle failed: {}", e);
                }
                child.wait().await
            }
        };

        let info = match status {
            Ok(status) => {
                use std::os::unix::process::ExitStatusExt;
                ExitInfo {
                    code: status.code(),
                    signal: status.signal(),
                }
            }
            Err(e) => {
                debug!("Waiting on child failed: {}", e);
                ExitInfo::default()
            }
        };
        debug!("Child exited with {}", info);
        let _ = exit_tx.send(Some(info));
    })
}
