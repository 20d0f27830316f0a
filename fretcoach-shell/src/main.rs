mod app;
mod cli;
mod log;
mod shutdown;

use clap::Parser;
use fretcoach_supervisor::api::{self, ApiRequest, ApiResponse};
use fretcoach_supervisor::{CONTROL_SOCKET, SupervisorConfig};
use miette::{IntoDiagnostic, Result, WrapErr, bail};
use std::path::{Path, PathBuf};

use crate::cli::{Cli, Commands};
use crate::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init_tracing(cli.level(), cli.log_format);

    let project_root = match &cli.project_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()
            .into_diagnostic()
            .wrap_err("Failed to determine the current directory")?,
    };
    let runtime_dir = cli.runtime_dir.clone().unwrap_or_else(default_runtime_dir);

    match cli.command.unwrap_or_default() {
        Commands::Run => {
            let config = load_config(&cli, &project_root)?;
            let shutdown = Shutdown::new();
            shutdown.install_signals()?;
            app::run(
                app::Settings {
                    config,
                    runtime_dir,
                    autostart: !cli.no_autostart,
                },
                shutdown,
            )
            .await
        }
        Commands::Start => control(&runtime_dir, ApiRequest::Start).await,
        Commands::Stop => control(&runtime_dir, ApiRequest::Stop).await,
        Commands::Status => control(&runtime_dir, ApiRequest::Status).await,
        Commands::Config => control(&runtime_dir, ApiRequest::Config).await,
    }
}

/// YAML file if given, otherwise the stock backend; flags and env override either.
/// `--python` swaps only the interpreter and keeps the configured module.
fn load_config(cli: &Cli, project_root: &Path) -> Result<SupervisorConfig> {
    let mut config = match &cli.config {
        Some(path) => SupervisorConfig::from_yaml_file(path)?,
        None => SupervisorConfig::for_project(project_root, &app_dir()),
    };
    if let Some(port) = cli.port {
        config.endpoint.port = port;
    }
    if let Some(python) = &cli.python {
        config.command.program = python.clone();
    }
    Ok(config)
}

/// Directory of the installed executable.
fn app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("fretcoach"),
        _ => std::env::temp_dir().join(format!("fretcoach-{}", nix::unistd::getuid())),
    }
}

/// Send one request to the running shell and print the answer.
async fn control(runtime_dir: &Path, request: ApiRequest) -> Result<()> {
    let socket = runtime_dir.join(CONTROL_SOCKET);
    let response = api::api_request(&socket, &request)
        .await
        .wrap_err("Is fretcoach-shell running?")?;

    match response {
        ApiResponse::Status(status) => {
            println!("{}", if status.ready { "ready" } else { "not ready" });
            Ok(())
        }
        ApiResponse::Control(response) if response.success => {
            if response.already_running {
                println!("already running");
            } else if response.already_starting {
                println!("already starting");
            } else {
                println!("ok");
            }
            Ok(())
        }
        ApiResponse::Control(response) => {
            bail!("{}", response.error.unwrap_or_else(|| "request failed".to_string()))
        }
        ApiResponse::Config(config) => {
            println!("{} (port {})", config.backend_path, config.port);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn python_override_keeps_configured_module() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("supervisor.yaml");
        std::fs::write(
            &path,
            "command:\n  program: /usr/bin/python3\n  args: [\"-m\", \"myservice.custom\"]\n  cwd: /srv/app\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "fretcoach-shell",
            "--config",
            path.to_str().unwrap(),
            "--python",
            "/opt/py/bin/python3",
            "--port",
            "8123",
        ])
        .unwrap();
        let config = load_config(&cli, dir.path()).unwrap();

        assert_eq!(config.command.program, PathBuf::from("/opt/py/bin/python3"));
        assert_eq!(config.command.args, vec!["-m", "myservice.custom"]);
        assert_eq!(config.command.cwd, PathBuf::from("/srv/app"));
        assert_eq!(config.endpoint.port, 8123);
    }

    #[test]
    fn runtime_dir_is_per_user() {
        let dir = default_runtime_dir();
        let name = dir.file_name().unwrap().to_str().unwrap();
        let uid = nix::unistd::getuid().to_string();
        assert!(
            name == "fretcoach" || name == format!("fretcoach-{}", uid),
            "unexpected runtime dir {}",
            dir.display()
        );
    }
}
