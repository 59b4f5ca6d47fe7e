//! mlsmoke CLI
//!
//! Two-process smoke test for database module loading.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use mlsmoke_core::{
    HarnessConfig, HarnessError, LaunchMode, Readiness, RunReport, Runner, SystemLauncher,
    command::server_command,
    readiness::{self, ConnectionStatus, exit_code},
};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mlsmoke")]
#[command(about = "Smoke test a database server's module loading with a server and a client process")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (default: $MLSMOKE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the smoke test (default)
    Run(RunArgs),
    /// Print the composed server command without running anything
    Compose {
        /// Print the structured argument vector instead of the shell line
        #[arg(long)]
        argv: bool,
    },
    /// Check whether a server accepts TCP connections
    Probe {
        /// Address to probe, HOST:PORT
        #[arg(long)]
        addr: String,

        /// Connection timeout in seconds
        #[arg(long, default_value = "5")]
        timeout_secs: u64,

        /// Wait up to SECS seconds for the server to start
        #[arg(long)]
        wait_secs: Option<u64>,

        /// Retry interval in milliseconds when waiting
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Suppress all output, only set exit code
        #[arg(short, long)]
        quiet: bool,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Shell launch and a fixed 10 second delay, ignoring other run options
    #[arg(long)]
    legacy: bool,

    /// How commands are launched: shell or direct
    #[arg(long)]
    mode: Option<LaunchMode>,

    /// Fixed delay before starting the client
    #[arg(long, conflicts_with = "ready_addr")]
    delay_secs: Option<u64>,

    /// Wait until this HOST:PORT accepts connections before starting the client
    #[arg(long)]
    ready_addr: Option<String>,

    /// Give up waiting for readiness after this many seconds (any TCP readiness)
    #[arg(long)]
    ready_timeout_secs: Option<u64>,

    /// Kill a child that has not exited this long after its stdin is closed
    #[arg(long)]
    close_timeout_secs: Option<u64>,

    /// Exit with status 1 if either child exits unsuccessfully
    #[arg(long)]
    strict: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn get_env_filter() -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else if cfg!(debug_assertions) {
        EnvFilter::new("mlsmoke=debug,mlsmoke_core=debug")
    } else {
        EnvFilter::new("mlsmoke=info,mlsmoke_core=info")
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Vec<WorkerGuard>> {
    let mut guards = Vec::new();

    let (console_non_blocking, console_guard) = tracing_appender::non_blocking(std::io::stderr());
    guards.push(console_guard);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(console_non_blocking)
        .with_ansi(true)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::time())
        .compact();

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file);
            guards.push(file_guard);

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(true),
            )
        }
        None => None,
    };

    Registry::default()
        .with(get_env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guards)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Maintain guard references to keep log threads alive
    let guards = init_tracing(cli.log_file.as_deref())?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let code = run(cli.config.as_deref(), args).await?;
            if code != 0 {
                drop(guards);
                process::exit(code);
            }
            Ok(())
        }
        Commands::Compose { argv } => {
            let mut config = HarnessConfig::load(cli.config.as_deref())?;
            if argv {
                config.mode = LaunchMode::Direct;
            }
            println!("{}", server_command(&config));
            Ok(())
        }
        Commands::Probe {
            addr,
            timeout_secs,
            wait_secs,
            interval_ms,
            quiet,
        } => {
            if addr.trim().is_empty() || interval_ms == 0 {
                eprintln!("mlsmoke probe: address must be set and interval must be positive");
                process::exit(exit_code::NO_ATTEMPT);
            }

            let timeout = Duration::from_secs(timeout_secs);
            let status = match wait_secs {
                Some(secs) => {
                    readiness::wait_for_server(
                        &addr,
                        timeout,
                        Duration::from_millis(interval_ms),
                        Duration::from_secs(secs),
                    )
                    .await
                }
                None => readiness::check_connection(&addr, timeout).await,
            };

            if !quiet {
                match &status {
                    ConnectionStatus::Accepting => println!("{addr}: accepting connections"),
                    ConnectionStatus::NoResponse(reason) => {
                        eprintln!("{addr}: no response: {reason}")
                    }
                }
            }
            drop(guards);
            process::exit(status.exit_code());
        }
    }
}

/// Run the smoke test and return the process exit code.
async fn run(config_path: Option<&Path>, args: RunArgs) -> anyhow::Result<i32> {
    let mut config = HarnessConfig::load(config_path)?;
    apply_run_args(&mut config, &args);
    config.validate()?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let runner = Runner::new(config, SystemLauncher).with_cancellation(shutdown);
    tracing::info!(
        mode = ?runner.config().mode,
        readiness = ?runner.config().readiness,
        "Starting module-loading smoke run"
    );

    let report = match runner.run().await {
        Ok(report) => report,
        Err(e) => {
            return match error_exit_code(&e) {
                Some(code) => {
                    eprintln!("{}", "Run cancelled".bright_yellow());
                    Ok(code)
                }
                None => {
                    tracing::error!(kind = e.kind(), "Smoke run failed: {e}");
                    Err(e.into())
                }
            };
        }
    };

    match args.format {
        OutputFormat::Text => println!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    Ok(report_exit_code(&report, args.strict))
}

const EXIT_CANCELLED: i32 = 130;

/// Children's exit status only matters with `--strict`.
fn report_exit_code(report: &RunReport, strict: bool) -> i32 {
    if strict && !report.passed() { 1 } else { 0 }
}

/// Errors that end the run with an exit code instead of propagating.
fn error_exit_code(err: &HarnessError) -> Option<i32> {
    match err {
        HarnessError::Cancelled => Some(EXIT_CANCELLED),
        _ => None,
    }
}

fn apply_run_args(config: &mut HarnessConfig, args: &RunArgs) {
    if args.legacy {
        config.mode = LaunchMode::Shell;
        config.readiness = Readiness::default();
        config.close_timeout = None;
        return;
    }

    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(secs) = args.delay_secs {
        config.readiness = Readiness::FixedDelay(Duration::from_secs(secs));
    }
    if let Some(addr) = &args.ready_addr {
        let max_wait = args
            .ready_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(readiness::DEFAULT_MAX_WAIT);
        config.readiness = Readiness::tcp(addr.clone(), max_wait);
    } else if let (Some(secs), Readiness::Tcp { max_wait, .. }) =
        (args.ready_timeout_secs, &mut config.readiness)
    {
        *max_wait = Duration::from_secs(secs);
    }
    if let Some(secs) = args.close_timeout_secs {
        config.close_timeout = Some(Duration::from_secs(secs));
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            _ => {
                tracing::warn!("Failed to register signal handlers, run cannot be interrupted");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT, stopping children..."),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, stopping children..."),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {e}");
            return;
        }
        tracing::info!("Received Ctrl+C, stopping children...");
    }

    token.cancel();
}
