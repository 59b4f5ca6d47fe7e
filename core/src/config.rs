use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::command::LaunchMode;
use crate::dbinit::DbInit;
use crate::readiness::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_INTERVAL, DEFAULT_MAX_WAIT, LEGACY_DELAY, Readiness,
};
use crate::{HarnessError, HarnessResult};

/// Legacy variables and their `MLSMOKE_*` overrides.
pub mod vars {
    pub const SERVER_BINARY: &str = "MSERVER";
    pub const DB_NAME: &str = "TSTDB";
    pub const CLIENT_COMMAND: &str = "MAPI_CLIENT";

    pub const CONFIG_PATH: &str = "MLSMOKE_CONFIG";
    pub const SERVER_OVERRIDE: &str = "MLSMOKE_SERVER";
    pub const DB_NAME_OVERRIDE: &str = "MLSMOKE_DBNAME";
    pub const CLIENT_OVERRIDE: &str = "MLSMOKE_CLIENT";
    pub const MODE_OVERRIDE: &str = "MLSMOKE_MODE";
    pub const READY_ADDR: &str = "MLSMOKE_READY_ADDR";
}

/// Everything the runner needs for a single smoke run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub server_binary: String,
    pub db_name: String,
    pub client_command: String,
    /// Structured client invocation, used in direct mode.
    pub client_argv: Option<Vec<String>>,
    pub dbinit: DbInit,
    pub mode: LaunchMode,
    pub readiness: Readiness,
    /// Upper bound on each final wait. `None` waits forever.
    pub close_timeout: Option<Duration>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server_binary: String::new(),
            db_name: String::new(),
            client_command: String::new(),
            client_argv: None,
            dbinit: DbInit::default(),
            mode: LaunchMode::Shell,
            readiness: Readiness::default(),
            close_timeout: None,
        }
    }
}

impl HarnessConfig {
    /// Resolve config from the optional file and the process environment.
    pub fn load(path: Option<&Path>) -> HarnessResult<Self> {
        ConfigLoader::new(|key| env::var(key).ok()).load(path)
    }

    /// Check that every required value is present before spawning anything.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.server_binary.is_empty() {
            return Err(HarnessError::MissingVariable(vars::SERVER_BINARY));
        }
        if self.db_name.is_empty() {
            return Err(HarnessError::MissingVariable(vars::DB_NAME));
        }
        let has_argv = self.client_argv.as_ref().is_some_and(|argv| !argv.is_empty());
        if self.client_command.is_empty() && !has_argv {
            return Err(HarnessError::MissingVariable(vars::CLIENT_COMMAND));
        }
        self.dbinit.validate()?;

        if let Readiness::Tcp { addr, interval, .. } = &self.readiness {
            if addr.is_empty() {
                return Err(HarnessError::Config("readiness address is empty".into()));
            }
            if interval.is_zero() {
                return Err(HarnessError::Config(
                    "readiness interval must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// On-disk TOML layout. Every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub client: ClientSection,
    pub run: RunSection,
    pub readiness: ReadinessSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    pub binary: Option<String>,
    pub database: Option<String>,
    pub modules: Option<Vec<String>>,
    pub startup: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSection {
    pub command: Option<String>,
    pub argv: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RunSection {
    pub mode: Option<LaunchMode>,
    pub close_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessStrategy {
    Delay,
    Tcp,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReadinessSection {
    pub strategy: Option<ReadinessStrategy>,
    pub delay_secs: Option<u64>,
    pub addr: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub max_wait_secs: Option<u64>,
}

impl ReadinessSection {
    fn apply(&self, current: Readiness) -> HarnessResult<Readiness> {
        let strategy = match (self.strategy, &self.addr) {
            (Some(s), _) => s,
            (None, Some(_)) => ReadinessStrategy::Tcp,
            (None, None) if self.delay_secs.is_some() => ReadinessStrategy::Delay,
            (None, None) => return Ok(current),
        };

        match strategy {
            ReadinessStrategy::Delay => Ok(Readiness::FixedDelay(
                self.delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or(LEGACY_DELAY),
            )),
            ReadinessStrategy::Tcp => {
                let addr = self.addr.clone().ok_or_else(|| {
                    HarnessError::Config("tcp readiness requires `addr`".into())
                })?;
                Ok(Readiness::Tcp {
                    addr,
                    connect_timeout: self
                        .connect_timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
                    interval: self
                        .interval_ms
                        .map(Duration::from_millis)
                        .unwrap_or(DEFAULT_INTERVAL),
                    max_wait: self
                        .max_wait_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_MAX_WAIT),
                })
            }
        }
    }
}

/// Resolves configuration from file and environment variables.
///
/// Precedence (lowest first): defaults, TOML file, legacy variables,
/// `MLSMOKE_*` overrides.
pub struct ConfigLoader<F> {
    lookup: F,
}

impl<F> ConfigLoader<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    pub fn load(&self, path: Option<&Path>) -> HarnessResult<HarnessConfig> {
        let mut cfg = HarnessConfig::default();

        if let Some(cfg_path) = self.resolve_config_path(path) {
            let file = self.read_file(&cfg_path)?;
            Self::apply_file(&mut cfg, file)?;
        }

        self.apply_env_overrides(&mut cfg)?;
        Ok(cfg)
    }

    /// An explicit path wins over `MLSMOKE_CONFIG`.
    fn resolve_config_path(&self, path: Option<&Path>) -> Option<PathBuf> {
        path.map(Path::to_path_buf)
            .or_else(|| (self.lookup)(vars::CONFIG_PATH).map(PathBuf::from))
    }

    fn read_file(&self, path: &Path) -> HarnessResult<FileConfig> {
        let text = fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&text)?)
    }

    fn apply_file(cfg: &mut HarnessConfig, file: FileConfig) -> HarnessResult<()> {
        if let Some(v) = file.server.binary {
            cfg.server_binary = v;
        }
        if let Some(v) = file.server.database {
            cfg.db_name = v;
        }
        if let Some(v) = file.server.modules {
            cfg.dbinit.modules = v;
        }
        if let Some(v) = file.server.startup {
            cfg.dbinit.startup = v;
        }
        if let Some(v) = file.client.command {
            cfg.client_command = v;
        }
        if file.client.argv.is_some() {
            cfg.client_argv = file.client.argv;
        }
        if let Some(v) = file.run.mode {
            cfg.mode = v;
        }
        if let Some(secs) = file.run.close_timeout_secs {
            cfg.close_timeout = Some(Duration::from_secs(secs));
        }
        cfg.readiness = file.readiness.apply(cfg.readiness.clone())?;
        Ok(())
    }

    fn var(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn apply_env_overrides(&self, cfg: &mut HarnessConfig) -> HarnessResult<()> {
        let pairs: [(&str, &str, &mut String); 3] = [
            (vars::SERVER_BINARY, vars::SERVER_OVERRIDE, &mut cfg.server_binary),
            (vars::DB_NAME, vars::DB_NAME_OVERRIDE, &mut cfg.db_name),
            (vars::CLIENT_COMMAND, vars::CLIENT_OVERRIDE, &mut cfg.client_command),
        ];
        for (legacy, override_key, slot) in pairs {
            if let Some(v) = self.var(override_key).or_else(|| self.var(legacy)) {
                *slot = v;
            }
        }

        if let Some(v) = self.var(vars::MODE_OVERRIDE) {
            cfg.mode = v.parse().map_err(HarnessError::Config)?;
        }

        if let Some(addr) = self.var(vars::READY_ADDR) {
            let max_wait = match &cfg.readiness {
                Readiness::Tcp { max_wait, .. } => *max_wait,
                Readiness::FixedDelay(_) => DEFAULT_MAX_WAIT,
            };
            cfg.readiness = Readiness::tcp(addr, max_wait);
        }
        Ok(())
    }
}
