use miette::Diagnostic;
use std::any::Any;
use std::path::PathBuf;
use thiserror::Error;

/// Spawn never produced a running process.
#[derive(Debug, Error, Diagnostic)]
pub enum LaunchError {
    #[error("failed to spawn {program}: {source}")]
    #[diagnostic(help("check that the interpreter exists or set PYTHON_PATH"))]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("working directory {0} does not exist")]
    MissingCwd(PathBuf),
}

#[derive(Debug, Error, Diagnostic)]
pub enum SupervisorError {
    #[error("backend failed to launch: {0}")]
    Launch(#[from] LaunchError),

    #[error("backend did not answer its health check after {attempts} attempts")]
    #[diagnostic(help("the process started but is slow or unresponsive"))]
    HealthTimeout { attempts: u32 },

    #[error("backend exited during startup ({0})")]
    ExitedDuringStartup(String),

    #[error("start was interrupted by a stop request")]
    Interrupted,

    #[error("{0}")]
    StartFailed(String),

    #[error("failed to build the health check client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
