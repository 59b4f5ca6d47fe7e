//! Server and client command composition

use std::fmt;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::HarnessConfig;
use crate::dbinit::DbInit;

/// How child commands are handed to the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Interpolate into a command line and run it through the shell.
    #[default]
    Shell,
    /// Pass a structured argument vector straight to the OS.
    Direct,
}

impl std::str::FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shell" => Ok(LaunchMode::Shell),
            "direct" => Ok(LaunchMode::Direct),
            other => Err(format!("unknown launch mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    Shell(String),
    Argv { program: String, args: Vec<String> },
}

impl CommandSpec {
    /// Build a tokio command with a piped stdin and inherited output.
    pub fn to_command(&self) -> Command {
        let mut cmd = match self {
            CommandSpec::Shell(line) => shell_command(line),
            CommandSpec::Argv { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Shell(line) => f.write_str(line),
            CommandSpec::Argv { program, args } => {
                write!(f, "{program:?}")?;
                for arg in args {
                    write!(f, " {arg:?}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

/// Compose the shell form of the server launch command.
///
/// Empty inputs are interpolated as-is and leave an empty segment.
pub fn compose_shell_command(server_binary: &str, db_name: &str, dbinit: &DbInit) -> String {
    format!(
        "{server_binary} --dbname \"{db_name}\" --dbinit \"{}\"",
        dbinit.render()
    )
}

pub fn compose_argv(server_binary: &str, db_name: &str, dbinit: &DbInit) -> CommandSpec {
    CommandSpec::Argv {
        program: server_binary.to_string(),
        args: vec![
            "--dbname".to_string(),
            db_name.to_string(),
            "--dbinit".to_string(),
            dbinit.render(),
        ],
    }
}

pub fn server_command(config: &HarnessConfig) -> CommandSpec {
    match config.mode {
        LaunchMode::Shell => CommandSpec::Shell(compose_shell_command(
            &config.server_binary,
            &config.db_name,
            &config.dbinit,
        )),
        LaunchMode::Direct => {
            compose_argv(&config.server_binary, &config.db_name, &config.dbinit)
        }
    }
}

/// The client command. Direct mode needs a structured argv; without one the
/// client command line still goes through the shell. A configured argv is
/// also used in shell mode when there is no command line to run.
pub fn client_command(config: &HarnessConfig) -> CommandSpec {
    let argv = config.client_argv.as_deref().filter(|argv| !argv.is_empty());
    match (config.mode, argv) {
        (LaunchMode::Direct, Some(argv)) => argv_spec(argv),
        (LaunchMode::Shell, Some(argv)) if config.client_command.is_empty() => argv_spec(argv),
        (LaunchMode::Direct, _) => {
            tracing::warn!("No client argv configured, running client command through the shell");
            CommandSpec::Shell(config.client_command.clone())
        }
        (LaunchMode::Shell, _) => CommandSpec::Shell(config.client_command.clone()),
    }
}

fn argv_spec(argv: &[String]) -> CommandSpec {
    CommandSpec::Argv {
        program: argv[0].clone(),
        args: argv[1..].to_vec(),
    }
}
