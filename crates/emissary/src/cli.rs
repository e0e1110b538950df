//! Command-line surface of the `emissary` binary.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, Subcommand};

use emissary_config::{CONFIG_ENV_VAR, Config, DEFAULT_CONFIG_PATH, RuntimePaths};

use crate::process::{self, LaunchError, LaunchMode};

const SYNOPSIS: &str = "\
Synopsis:
  emissary [--config PATH] start [-d]
  emissary [--config PATH] stop
  emissary [--config PATH] status";

/// Command-line interface for the emissary host agent.
#[derive(Parser, Debug)]
#[command(
    name = "emissary",
    version,
    about = "Per-host agent that executes commands received over AMQP",
    before_help = SYNOPSIS,
    arg_required_else_help = true,
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Configuration file.
    #[arg(long, global = true, env = CONFIG_ENV_VAR, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    /// Lifecycle action.
    #[command(subcommand)]
    pub command: Command,
}

/// Lifecycle actions.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Starts the supervisor and one worker per configured node.
    Start {
        /// Detaches into the background.
        #[arg(short, long)]
        daemonize: bool,
    },
    /// Stops a running supervisor.
    Stop,
    /// Prints the supervisor health snapshot.
    Status,
    /// Runs a single worker; started by the supervisor.
    #[command(hide = true)]
    Worker {
        /// Node to serve.
        #[arg(long)]
        node: String,
    },
}

/// Parses `args` and runs the selected command.
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => {
            let rendered = error.render().to_string();
            return match error.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                    let _ = write!(stdout, "{rendered}");
                    ExitCode::SUCCESS
                }
                _ => {
                    let _ = write!(stderr, "{rendered}");
                    ExitCode::from(2)
                }
            };
        }
    };

    match execute(&cli, stdout) {
        Ok(code) => code,
        Err(error) => {
            let _ = writeln!(stderr, "emissary: {error}");
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write>(cli: &Cli, stdout: &mut W) -> Result<ExitCode, LaunchError> {
    match &cli.command {
        Command::Start { daemonize } => {
            process::run_supervisor(&cli.config, LaunchMode::from_flag(*daemonize))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop => {
            let outcome = process::stop(&runtime_paths(&cli.config)?)?;
            let _ = writeln!(stdout, "{outcome}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let report = process::status(&runtime_paths(&cli.config)?)?;
            let _ = writeln!(stdout, "{report}");
            Ok(if report.is_running() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(3)
            })
        }
        Command::Worker { node } => {
            process::run_worker(&cli.config, node)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn runtime_paths(config_path: &Path) -> Result<RuntimePaths, LaunchError> {
    Ok(RuntimePaths::from_config(&Config::load(config_path)?)?)
}
