//! mlsmoke - two-process smoke test for database module loading
//!
//! Starts a server with an inline dbinit script, waits until it is ready,
//! runs a client against it and reports how both processes ended.

pub mod command;
pub mod config;
pub mod dbinit;
pub mod error;
pub mod process;
pub mod readiness;
pub mod report;
pub mod runner;

pub use command::{CommandSpec, LaunchMode, compose_argv, compose_shell_command};
pub use config::{ConfigLoader, HarnessConfig};
pub use dbinit::DbInit;
pub use error::{HarnessError, HarnessResult};
pub use process::{ChildProcess, ExitOutcome, Launcher, Role, SystemLauncher};
pub use readiness::{ConnectionStatus, Readiness};
pub use report::{Phase, RunReport};
pub use runner::Runner;
