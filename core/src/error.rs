use thiserror::Error;

use crate::process::ExitOutcome;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required variable: {0}")]
    MissingVariable(&'static str),

    #[error("Failed to spawn {role}: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Server not ready at {addr} after {waited_ms}ms")]
    ReadinessTimeout { addr: String, waited_ms: u64 },

    #[error("Server exited before becoming ready: {0}")]
    ServerExitedEarly(ExitOutcome),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl HarnessError {
    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::Io(_) => "io_error",
            HarnessError::Config(_) => "config_error",
            HarnessError::MissingVariable(_) => "missing_variable",
            HarnessError::Spawn { .. } => "spawn_error",
            HarnessError::ReadinessTimeout { .. } => "readiness_timeout",
            HarnessError::ServerExitedEarly(_) => "server_exited_early",
            HarnessError::Cancelled => "cancelled",
            HarnessError::InvalidInput(_) => "invalid_input",
        }
    }
}

impl From<toml::de::Error> for HarnessError {
    fn from(err: toml::de::Error) -> Self {
        HarnessError::Config(err.to_string())
    }
}
