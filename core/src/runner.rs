//! Test runner
//!
//! Spawns the server, waits until it is ready, spawns the client and then
//! releases both handles, client first.

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{client_command, server_command};
use crate::config::HarnessConfig;
use crate::process::{ChildProcess, ExitOutcome, Launcher, Role};
use crate::readiness::{Readiness, check_connection};
use crate::report::{Phase, RunReport};
use crate::{HarnessError, HarnessResult};

pub struct Runner<L> {
    config: HarnessConfig,
    launcher: L,
    cancel: CancellationToken,
}

impl<L: Launcher> Runner<L> {
    pub fn new(config: HarnessConfig, launcher: L) -> Self {
        Self {
            config,
            launcher,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run early when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub async fn run(&self) -> HarnessResult<RunReport> {
        let start = Instant::now();
        let mut report = RunReport::new(Utc::now());

        let server_cmd = server_command(&self.config);
        debug!(command = %server_cmd, "composed server command");
        report.server_command = server_cmd.to_string();

        let mut server = self.launcher.spawn(Role::Server, &server_cmd)?;
        report.record(Phase::ServerSpawned, start.elapsed());
        info!(pid = ?server.id(), "server spawned");

        let ready = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HarnessError::Cancelled),
            result = self.wait_ready(server.as_mut()) => result,
        };
        if let Err(e) = ready {
            if !matches!(e, HarnessError::ServerExitedEarly(_)) {
                stop(server.as_mut()).await;
            }
            return Err(e);
        }
        report.record(Phase::AfterDelay, start.elapsed());
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "server ready");

        let client_cmd = client_command(&self.config);
        debug!(command = %client_cmd, "client command");
        report.client_command = client_cmd.to_string();

        let mut client = match self.launcher.spawn(Role::Client, &client_cmd) {
            Ok(client) => client,
            Err(e) => {
                stop(server.as_mut()).await;
                return Err(e);
            }
        };
        report.record(Phase::ClientSpawned, start.elapsed());
        info!(pid = ?client.id(), "client spawned");

        // Client is released first so it finishes against a live server.
        let outcome = match self.release(Role::Client, client.as_mut()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                stop(server.as_mut()).await;
                return Err(e);
            }
        };
        report.record_release(Role::Client, start.elapsed(), outcome);

        let outcome = self.release(Role::Server, server.as_mut()).await?;
        report.record_release(Role::Server, start.elapsed(), outcome);

        report.record(Phase::Done, start.elapsed());
        Ok(report)
    }

    async fn release(&self, role: Role, child: &mut dyn ChildProcess) -> HarnessResult<ExitOutcome> {
        let closed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = child.close(self.config.close_timeout) => Some(result),
        };
        match closed {
            Some(result) => {
                let outcome = result?;
                log_outcome(role, outcome);
                Ok(outcome)
            }
            None => {
                stop(child).await;
                Err(HarnessError::Cancelled)
            }
        }
    }

    async fn wait_ready(&self, server: &mut dyn ChildProcess) -> HarnessResult<()> {
        match &self.config.readiness {
            Readiness::FixedDelay(delay) => {
                debug!(?delay, "waiting for server");
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            Readiness::Tcp {
                addr,
                connect_timeout,
                interval,
                max_wait,
            } => {
                let start = Instant::now();
                loop {
                    if let Some(outcome) = server.try_exited()? {
                        return Err(HarnessError::ServerExitedEarly(outcome));
                    }
                    if check_connection(addr, *connect_timeout).await.is_accepting() {
                        return Ok(());
                    }
                    if start.elapsed() >= *max_wait {
                        return Err(HarnessError::ReadinessTimeout {
                            addr: addr.clone(),
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(*interval).await;
                }
            }
        }
    }
}

async fn stop(child: &mut dyn ChildProcess) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill child process: {e}");
    }
}

fn log_outcome(role: Role, outcome: ExitOutcome) {
    if outcome.success() {
        info!(%role, %outcome, "released");
    } else {
        warn!(%role, %outcome, "released with unsuccessful exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Spawn(Role, String),
        Close(Role),
        Kill(Role),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<(Event, Instant)>>>,
    }

    impl Recorder {
        fn push(&self, event: Event) {
            self.events.lock().unwrap().push((event, Instant::now()));
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
        }

        fn at(&self, event: &Event) -> Instant {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|(e, _)| e == event)
                .map(|(_, at)| *at)
                .unwrap()
        }
    }

    struct FakeChild {
        role: Role,
        recorder: Recorder,
        exit: ExitOutcome,
        exited_early: bool,
        hangs_on_close: bool,
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        fn id(&self) -> Option<u32> {
            None
        }

        fn try_exited(&mut self) -> HarnessResult<Option<ExitOutcome>> {
            Ok(self.exited_early.then_some(self.exit))
        }

        async fn close(&mut self, _timeout: Option<Duration>) -> HarnessResult<ExitOutcome> {
            self.recorder.push(Event::Close(self.role));
            if self.hangs_on_close {
                std::future::pending::<()>().await;
            }
            Ok(self.exit)
        }

        async fn kill(&mut self) -> HarnessResult<()> {
            self.recorder.push(Event::Kill(self.role));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeLauncher {
        recorder: Recorder,
        client_exit: Option<ExitOutcome>,
        server_dies: bool,
        client_hangs: bool,
    }

    impl Launcher for FakeLauncher {
        fn spawn(&self, role: Role, spec: &CommandSpec) -> HarnessResult<Box<dyn ChildProcess>> {
            self.recorder.push(Event::Spawn(role, spec.to_string()));
            let exit = match role {
                Role::Client => self.client_exit.unwrap_or(ExitOutcome::Exited(0)),
                Role::Server if self.server_dies => ExitOutcome::Exited(1),
                Role::Server => ExitOutcome::Exited(0),
            };
            Ok(Box::new(FakeChild {
                role,
                recorder: self.recorder.clone(),
                exit,
                exited_early: role == Role::Server && self.server_dies,
                hangs_on_close: role == Role::Client && self.client_hangs,
            }))
        }
    }

    fn echo_config() -> HarnessConfig {
        HarnessConfig {
            server_binary: "/bin/echo".into(),
            db_name: "testdb".into(),
            client_command: "/bin/true".into(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_run_order_and_delay() {
        let launcher = FakeLauncher::default();
        let recorder = launcher.recorder.clone();
        let runner = Runner::new(echo_config(), launcher);

        let start = Instant::now();
        let report = runner.run().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));

        assert_eq!(
            recorder.events(),
            vec![
                Event::Spawn(
                    Role::Server,
                    "/bin/echo --dbname \"testdb\" --dbinit \"module(sql_server);module(mapi);module(monettime); mapi_start();\"".into()
                ),
                Event::Spawn(Role::Client, "/bin/true".into()),
                Event::Close(Role::Client),
                Event::Close(Role::Server),
            ]
        );

        let server_at = recorder.at(&Event::Spawn(Role::Server, report.server_command.clone()));
        let client_at = recorder.at(&Event::Spawn(Role::Client, "/bin/true".into()));
        assert!(client_at - server_at >= Duration::from_secs(10));

        let phases: Vec<Phase> = report.phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Idle,
                Phase::ServerSpawned,
                Phase::AfterDelay,
                Phase::ClientSpawned,
                Phase::Done
            ]
        );
        assert!(report.duration_ms() >= 10_000);
        assert!(report.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_failure_is_reported_not_raised() {
        let launcher = FakeLauncher {
            client_exit: Some(ExitOutcome::Exited(2)),
            ..Default::default()
        };
        let runner = Runner::new(echo_config(), launcher);

        let report = runner.run().await.unwrap();
        assert_eq!(report.outcome(Role::Client), Some(ExitOutcome::Exited(2)));
        assert_eq!(report.outcome(Role::Server), Some(ExitOutcome::Exited(0)));
        assert!(!report.passed());
        assert_eq!(report.releases[0].role, Role::Client);
        assert_eq!(report.releases[1].role, Role::Server);
    }

    #[tokio::test]
    async fn test_tcp_readiness_spawns_client_once_accepting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let launcher = FakeLauncher::default();
        let recorder = launcher.recorder.clone();
        let config = HarnessConfig {
            readiness: Readiness::tcp(addr, Duration::from_secs(5)),
            ..echo_config()
        };

        let start = Instant::now();
        let report = Runner::new(config, launcher).run().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(report.passed());
        assert_eq!(recorder.events().len(), 4);
    }

    #[tokio::test]
    async fn test_server_exit_during_probe() {
        let launcher = FakeLauncher {
            server_dies: true,
            ..Default::default()
        };
        let recorder = launcher.recorder.clone();
        let config = HarnessConfig {
            readiness: Readiness::tcp("127.0.0.1:1", Duration::from_secs(5)),
            ..echo_config()
        };

        let err = Runner::new(config, launcher).run().await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::ServerExitedEarly(ExitOutcome::Exited(1))
        ));
        // No client is started against a dead server
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_readiness_timeout_kills_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let launcher = FakeLauncher::default();
        let recorder = launcher.recorder.clone();
        let config = HarnessConfig {
            readiness: Readiness::Tcp {
                addr,
                connect_timeout: Duration::from_millis(100),
                interval: Duration::from_millis(20),
                max_wait: Duration::from_millis(200),
            },
            ..echo_config()
        };

        let err = Runner::new(config, launcher).run().await.unwrap_err();
        assert_eq!(err.kind(), "readiness_timeout");
        assert_eq!(recorder.events().last(), Some(&Event::Kill(Role::Server)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let launcher = FakeLauncher::default();
        let recorder = launcher.recorder.clone();
        let token = CancellationToken::new();
        let runner = Runner::new(echo_config(), launcher).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            token.cancel();
        });

        let err = runner.run().await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, HarnessError::Cancelled));
        assert_eq!(
            recorder.events().last(),
            Some(&Event::Kill(Role::Server))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_client_release_stops_both() {
        let launcher = FakeLauncher {
            client_hangs: true,
            ..Default::default()
        };
        let recorder = launcher.recorder.clone();
        let token = CancellationToken::new();
        let runner = Runner::new(echo_config(), launcher).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            token.cancel();
        });

        let err = runner.run().await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, HarnessError::Cancelled));

        let events = recorder.events();
        assert_eq!(
            events[2..].to_vec(),
            vec![
                Event::Close(Role::Client),
                Event::Kill(Role::Client),
                Event::Kill(Role::Server),
            ]
        );
    }
}
