//! Configuration types for the backend supervisor.
//!
//! Everything here is plain data with serde support so it can come from a YAML
//! file, and every field has a default matching the shipped desktop app.

use miette::{IntoDiagnostic, Result, WrapErr, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the interpreter used to run the backend.
pub const INTERPRETER_ENV: &str = "PYTHON_PATH";

/// Interpreter path used when `PYTHON_PATH` is not set, relative to the project root.
pub const DEFAULT_INTERPRETER: &str = ".venv/bin/python3";

/// Python module that serves the backend API.
pub const DEFAULT_MODULE: &str = "backend.api.server";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

/// Name of the configuration file looked up by the environment resolver.
pub const ENV_FILE_NAME: &str = ".env";

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_health_path() -> String {
    "/".to_string()
}

/// Where the backend listens and how its liveness is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            health_path: default_health_path(),
        }
    }
}

impl ServiceEndpoint {
    pub fn loopback(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// URL of the liveness endpoint.
    pub fn url(&self) -> String {
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    /// `None` when `host` is not an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok()
    }
}

/// Retry policy for the health prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePolicy {
    #[serde(default = "ProbePolicy::default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between two attempts, in milliseconds.
    #[serde(default = "ProbePolicy::default_interval_ms")]
    pub interval_ms: u64,
    /// Timeout of a single GET, in milliseconds.
    #[serde(default = "ProbePolicy::default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl ProbePolicy {
    fn default_max_attempts() -> u32 {
        30
    }

    fn default_interval_ms() -> u64 {
        500
    }

    fn default_attempt_timeout_ms() -> u64 {
        2000
    }

    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_ms: interval.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Time budget after which probing gives up, ignoring request latency.
    pub fn upper_bound(&self) -> Duration {
        self.interval() * self.max_attempts
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            interval_ms: Self::default_interval_ms(),
            attempt_timeout_ms: Self::default_attempt_timeout_ms(),
        }
    }
}

/// Timing of the graceful-then-forceful termination sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownPolicy {
    #[serde(default = "ShutdownPolicy::default_grace_ms")]
    pub grace_ms: u64,
    /// How long to wait for exit confirmation after a forceful kill.
    #[serde(default = "ShutdownPolicy::default_reap_ms")]
    pub reap_ms: u64,
}

impl ShutdownPolicy {
    fn default_grace_ms() -> u64 {
        1000
    }

    fn default_reap_ms() -> u64 {
        500
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            grace_ms: grace.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_ms)
    }
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace_ms: Self::default_grace_ms(),
            reap_ms: Self::default_reap_ms(),
        }
    }
}

/// Program, arguments and working directory of the supervised service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl ServiceCommand {
    /// `<interpreter> -m <module>`, run from the project root.
    pub fn python_module(interpreter: PathBuf, module: &str, project_root: &Path) -> Self {
        Self {
            program: interpreter,
            args: vec!["-m".to_string(), module.to_string()],
            cwd: project_root.to_path_buf(),
        }
    }

    /// The default backend command for a project root, honoring `PYTHON_PATH`.
    pub fn backend(project_root: &Path) -> Self {
        let interpreter = resolve_interpreter(std::env::var_os(INTERPRETER_ENV), project_root);
        Self::python_module(interpreter, DEFAULT_MODULE, project_root)
    }
}

/// Pick the interpreter: an explicit override wins, otherwise the project-local venv.
pub fn resolve_interpreter(
    override_path: Option<std::ffi::OsString>,
    project_root: &Path,
) -> PathBuf {
    match override_path {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => project_root.join(DEFAULT_INTERPRETER),
    }
}

/// Candidate `.env` locations in priority order: service-local, project root,
/// application directory.
pub fn default_env_candidates(project_root: &Path, app_dir: &Path) -> Vec<PathBuf> {
    vec![
        project_root.join("backend").join(ENV_FILE_NAME),
        project_root.join(ENV_FILE_NAME),
        app_dir.join(ENV_FILE_NAME),
    ]
}

/// Full supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub command: ServiceCommand,
    #[serde(default)]
    pub endpoint: ServiceEndpoint,
    #[serde(default)]
    pub probe: ProbePolicy,
    #[serde(default)]
    pub shutdown: ShutdownPolicy,
    #[serde(default)]
    pub env_candidates: Vec<PathBuf>,
}

impl SupervisorConfig {
    /// Configuration for the stock backend inside `project_root`.
    pub fn for_project(project_root: &Path, app_dir: &Path) -> Self {
        Self {
            command: ServiceCommand::backend(project_root),
            endpoint: ServiceEndpoint::default(),
            probe: ProbePolicy::default(),
            shutdown: ShutdownPolicy::default(),
            env_candidates: default_env_candidates(project_root, app_dir),
        }
    }

    /// Load overrides from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;
        if config.endpoint.socket_addr().is_none() {
            bail!(
                "{}: endpoint host {:?} must be an IP address",
                path.display(),
                config.endpoint.host
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn endpoint_url_defaults_to_root_on_loopback() {
        assert_eq!(ServiceEndpoint::default().url(), "http://127.0.0.1:8000/");
        let endpoint = ServiceEndpoint {
            health_path: "health".to_string(),
            ..ServiceEndpoint::loopback(9100)
        };
        assert_eq!(endpoint.url(), "http://127.0.0.1:9100/health");
    }

    #[test]
    fn probe_policy_upper_bound() {
        let policy = ProbePolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.upper_bound(), Duration::from_millis(300));
        assert_eq!(ProbePolicy::default().upper_bound(), Duration::from_secs(15));
    }

    #[test]
    fn interpreter_override_wins() {
        let root = Path::new("/srv/app");
        assert_eq!(
            resolve_interpreter(Some("/usr/bin/python3.12".into()), root),
            PathBuf::from("/usr/bin/python3.12")
        );
        assert_eq!(
            resolve_interpreter(None, root),
            PathBuf::from("/srv/app/.venv/bin/python3")
        );
        assert_eq!(
            resolve_interpreter(Some("".into()), root),
            PathBuf::from("/srv/app/.venv/bin/python3")
        );
    }

    #[test]
    fn python_module_command() {
        let cmd = ServiceCommand::python_module(
            PathBuf::from("python3"),
            "backend.api.server",
            Path::new("/srv/app"),
        );
        assert_eq!(cmd.args, vec!["-m", "backend.api.server"]);
        assert_eq!(cmd.cwd, PathBuf::from("/srv/app"));
    }

    #[test]
    fn yaml_fills_in_defaults() {
        let yaml = r#"
command:
  program: /usr/bin/python3
  args: ["-m", "backend.api.server"]
  cwd: /srv/app
endpoint:
  port: 8123
probe:
  max_attempts: 5
"#;
        let config: SupervisorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.endpoint.port, 8123);
        assert_eq!(config.endpoint.host, "127.0.0.1");
        assert_eq!(config.probe.max_attempts, 5);
        assert_eq!(config.probe.interval_ms, 500);
        assert_eq!(config.shutdown.grace_ms, 1000);
        assert!(config.env_candidates.is_empty());
    }

    #[test]
    fn yaml_endpoint_host_must_be_an_address() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("supervisor.yaml");
        let command = "command:\n  program: python3\n  cwd: /srv/app\n";

        std::fs::write(&path, format!("{command}endpoint:\n  host: localhost\n")).unwrap();
        let err = SupervisorConfig::from_yaml_file(&path).unwrap_err();
        assert!(err.to_string().contains("must be an IP address"));

        std::fs::write(&path, format!("{command}endpoint:\n  port: 8123\n")).unwrap();
        let config = SupervisorConfig::from_yaml_file(&path).unwrap();
        assert_eq!(
            config.endpoint.socket_addr(),
            Some("127.0.0.1:8123".parse().unwrap())
        );
    }
}
