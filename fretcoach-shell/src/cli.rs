use clap::{Parser, Subcommand, ValueEnum, crate_version};
use std::path::PathBuf;

use crate::log::Level;

#[derive(Parser, Debug)]
#[command(
    name = "fretcoach-shell",
    version,
    color = clap::ColorChoice::Auto,
    about = format!("FretCoach desktop shell {}: keeps the practice backend running", crate_version!())
)]
pub struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase log verbosity (-v debug).")]
    pub verbose: u8,

    #[arg(short, long, global = true, conflicts_with = "verbose", help = "Only log errors.")]
    pub quiet: bool,

    #[arg(long, value_enum, default_value_t, global = true, help = "Log output format.")]
    pub log_format: LogFormat,

    #[arg(
        long,
        env = "FRETCOACH_PROJECT_ROOT",
        global = true,
        help = "Directory containing the backend package. Defaults to the current directory."
    )]
    pub project_root: Option<PathBuf>,

    #[arg(
        long,
        env = "FRETCOACH_RUNTIME_DIR",
        global = true,
        help = "Directory for the instance lock and control socket."
    )]
    pub runtime_dir: Option<PathBuf>,

    #[arg(long, env = "FRETCOACH_PORT", help = "Port the backend listens on.")]
    pub port: Option<u16>,

    #[arg(long, env = "PYTHON_PATH", help = "Python interpreter running the backend.")]
    pub python: Option<PathBuf>,

    #[arg(long, help = "YAML file with supervisor settings.")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Do not start the backend until asked over the control socket.")]
    pub no_autostart: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn level(&self) -> Level {
        if self.quiet {
            Level::Error
        } else if self.verbose > 0 {
            Level::Debug
        } else {
            Level::Info
        }
    }
}

#[derive(Subcommand, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Commands {
    /// Run the shell and supervise the backend (default).
    #[default]
    Run,
    /// Ask the running shell to start the backend and wait until it is healthy.
    Start,
    /// Ask the running shell to stop the backend.
    Stop,
    /// Print whether the backend of the running shell is ready.
    Status,
    /// Print the backend path and port of the running shell.
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines on stderr
    #[default]
    Fmt,
    /// One JSON object per line on stderr
    Json,
}
