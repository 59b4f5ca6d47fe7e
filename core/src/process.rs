//! Child process handles
//!
//! A [`ChildProcess`] owns one spawned process together with the write end
//! of its stdin. Closing the handle drops stdin and reaps the child.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::{Child, ChildStdin};

use crate::command::CommandSpec;
use crate::{HarnessError, HarnessResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    /// Did not exit within the close timeout and was killed.
    TimedOut,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Exited(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signaled(signal);
            }
        }

        ExitOutcome::Exited(-1)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit code {code}"),
            ExitOutcome::Signaled(signal) => write!(f, "killed by signal {signal}"),
            ExitOutcome::TimedOut => f.write_str("timed out"),
        }
    }
}

#[async_trait]
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking check whether the process has already exited.
    fn try_exited(&mut self) -> HarnessResult<Option<ExitOutcome>>;

    /// Close stdin and wait for the process to exit.
    ///
    /// With a timeout the process is killed once it expires and
    /// [`ExitOutcome::TimedOut`] is returned.
    async fn close(&mut self, timeout: Option<Duration>) -> HarnessResult<ExitOutcome>;

    async fn kill(&mut self) -> HarnessResult<()>;
}

/// Spawns child processes for the runner.
pub trait Launcher: Send + Sync {
    fn spawn(&self, role: Role, spec: &CommandSpec) -> HarnessResult<Box<dyn ChildProcess>>;
}

/// Launcher backed by real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn spawn(&self, role: Role, spec: &CommandSpec) -> HarnessResult<Box<dyn ChildProcess>> {
        let mut cmd = spec.to_command();
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            role: role.as_str(),
            source,
        })?;
        let stdin = child.stdin.take();

        tracing::debug!(%role, pid = ?child.id(), "spawned");

        Ok(Box::new(SystemChild { role, child, stdin }))
    }
}

pub struct SystemChild {
    role: Role,
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ChildProcess for SystemChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exited(&mut self) -> HarnessResult<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(ExitOutcome::from))
    }

    async fn close(&mut self, timeout: Option<Duration>) -> HarnessResult<ExitOutcome> {
        drop(self.stdin.take());

        let status = match timeout {
            None => self.child.wait().await?,
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(role = %self.role, ?limit, "did not exit in time, killing");
                    self.kill().await?;
                    return Ok(ExitOutcome::TimedOut);
                }
            },
        };

        Ok(ExitOutcome::from(status))
    }

    async fn kill(&mut self) -> HarnessResult<()> {
        drop(self.stdin.take());

        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(line: &str) -> CommandSpec {
        CommandSpec::Shell(line.to_string())
    }

    #[tokio::test]
    async fn test_close_reports_exit_code() {
        let mut child = SystemLauncher.spawn(Role::Client, &sh("exit 3")).unwrap();
        assert_eq!(child.close(None).await.unwrap(), ExitOutcome::Exited(3));
    }

    #[tokio::test]
    async fn test_close_drops_stdin() {
        // cat exits once its stdin reaches EOF
        let mut child = SystemLauncher.spawn(Role::Server, &sh("cat > /dev/null")).unwrap();
        let outcome = child.close(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_close_timeout_kills() {
        let mut child = SystemLauncher.spawn(Role::Server, &sh("sleep 30")).unwrap();
        let outcome = child.close(Some(Duration::from_millis(100))).await.unwrap();
        assert_eq!(outcome, ExitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let spec = CommandSpec::Argv {
            program: "/nonexistent/mserver".into(),
            args: vec![],
        };
        let err = SystemLauncher.spawn(Role::Server, &spec).err().unwrap();
        assert_eq!(err.kind(), "spawn_error");
    }

    #[tokio::test]
    async fn test_signaled_outcome() {
        let mut child = SystemLauncher.spawn(Role::Client, &sh("kill -9 $$")).unwrap();
        assert_eq!(child.close(None).await.unwrap(), ExitOutcome::Signaled(9));
    }

    #[test]
    fn test_success() {
        assert!(ExitOutcome::Exited(0).success());
        assert!(!ExitOutcome::Exited(1).success());
        assert!(!ExitOutcome::Signaled(15).success());
        assert!(!ExitOutcome::TimedOut.success());
    }
}
