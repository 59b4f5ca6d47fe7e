//! Server readiness checks
//!
//! Exit codes used by the `probe` subcommand:
//!   0 - server is accepting connections
//!   2 - no response (server not running or unreachable)
//!   3 - no connection attempt was made (bad parameters)

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

/// Exit codes
pub mod exit_code {
    pub const ACCEPTING: i32 = 0;
    pub const NO_RESPONSE: i32 = 2;
    pub const NO_ATTEMPT: i32 = 3;
}

/// Legacy delay between server and client spawn.
pub const LEGACY_DELAY: Duration = Duration::from_secs(10);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// How the runner decides the server is ready for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Sleep for a fixed interval and assume the server is up.
    FixedDelay(Duration),
    /// Poll a TCP address until it accepts a connection.
    Tcp {
        addr: String,
        connect_timeout: Duration,
        interval: Duration,
        max_wait: Duration,
    },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::FixedDelay(LEGACY_DELAY)
    }
}

impl Readiness {
    pub fn tcp(addr: impl Into<String>, max_wait: Duration) -> Self {
        Readiness::Tcp {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            max_wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Server accepted the connection
    Accepting,
    /// No response from server (connection refused, timeout, etc.)
    NoResponse(String),
}

impl ConnectionStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConnectionStatus::Accepting => exit_code::ACCEPTING,
            ConnectionStatus::NoResponse(_) => exit_code::NO_RESPONSE,
        }
    }

    pub fn is_accepting(&self) -> bool {
        matches!(self, ConnectionStatus::Accepting)
    }
}

pub async fn check_connection(addr: &str, timeout: Duration) -> ConnectionStatus {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => ConnectionStatus::Accepting,
        Ok(Err(e)) => ConnectionStatus::NoResponse(e.to_string()),
        Err(_) => ConnectionStatus::NoResponse("connection timeout".to_string()),
    }
}

/// Poll `addr` until it accepts or `max_wait` has elapsed.
pub async fn wait_for_server(
    addr: &str,
    connect_timeout: Duration,
    interval: Duration,
    max_wait: Duration,
) -> ConnectionStatus {
    let start = Instant::now();

    loop {
        let status = check_connection(addr, connect_timeout).await;

        match &status {
            ConnectionStatus::Accepting => return status,
            ConnectionStatus::NoResponse(reason) => {
                if start.elapsed() >= max_wait {
                    return status;
                }
                tracing::trace!(addr, reason = %reason, "server not accepting yet");
                tokio::time::sleep(interval).await;
            }
        }
    }
}
