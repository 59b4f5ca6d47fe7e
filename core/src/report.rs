//! Run report
//!
//! Records every state transition of a run and how both children ended.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL};
use serde::Serialize;

use crate::process::{ExitOutcome, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ServerSpawned,
    AfterDelay,
    ClientSpawned,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::ServerSpawned => "server spawned",
            Phase::AfterDelay => "server ready",
            Phase::ClientSpawned => "client spawned",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseEvent {
    pub phase: Phase,
    /// Offset from the start of the run.
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseEvent {
    pub role: Role,
    pub at_ms: u64,
    pub outcome: ExitOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub server_command: String,
    pub client_command: String,
    pub phases: Vec<PhaseEvent>,
    pub releases: Vec<ReleaseEvent>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            server_command: String::new(),
            client_command: String::new(),
            phases: vec![PhaseEvent {
                phase: Phase::Idle,
                at_ms: 0,
            }],
            releases: Vec::new(),
        }
    }

    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        self.phases.push(PhaseEvent {
            phase,
            at_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn record_release(&mut self, role: Role, elapsed: Duration, outcome: ExitOutcome) {
        self.releases.push(ReleaseEvent {
            role,
            at_ms: elapsed.as_millis() as u64,
            outcome,
        });
    }

    pub fn outcome(&self, role: Role) -> Option<ExitOutcome> {
        self.releases
            .iter()
            .find(|r| r.role == role)
            .map(|r| r.outcome)
    }

    /// Both children were released and exited with status zero.
    pub fn passed(&self) -> bool {
        [Role::Client, Role::Server]
            .iter()
            .all(|role| self.outcome(*role).is_some_and(|o| o.success()))
    }

    pub fn duration_ms(&self) -> u64 {
        self.phases.last().map(|p| p.at_ms).unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Event", "At (ms)", "Detail"]);

        for event in &self.phases {
            let detail = match event.phase {
                Phase::ServerSpawned => self.server_command.clone(),
                Phase::ClientSpawned => self.client_command.clone(),
                _ => String::new(),
            };
            table.add_row(vec![event.phase.to_string(), event.at_ms.to_string(), detail]);
        }
        for release in &self.releases {
            table.add_row(vec![
                format!("{} closed", release.role),
                release.at_ms.to_string(),
                release.outcome.to_string(),
            ]);
        }

        let headline = if self.passed() {
            "PASS".bright_green()
        } else {
            "FAIL".bright_red()
        };
        format!(
            "{headline} module-loading smoke run started {} ({} ms)\n{table}",
            self.started_at.to_rfc3339(),
            self.duration_ms()
        )
    }
}
