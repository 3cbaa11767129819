//! Bridge configuration.
//!
//! Layered: built-in defaults < `<data_dir>/config.toml` < CLI flags / env
//! (applied by `main`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use relaydock_connector::SessionConfig;
use relaydock_executor::ExecutorConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server_url: String,
    pub response_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Bound on each REST call to the server
    pub request_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub command_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    /// Root for relative paths in delegated actions; current dir when unset
    pub workspace_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            response_timeout_secs: 30,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            reconnect_attempts: 3,
            command_timeout_secs: 30,
            health_interval_secs: 60,
            health_timeout_secs: 5,
            workspace_dir: None,
        }
    }
}

impl Config {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            bail!("server_url must be an http(s) URL, got '{}'", self.server_url);
        }
        for (name, value) in [
            ("response_timeout_secs", self.response_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("command_timeout_secs", self.command_timeout_secs),
            ("health_interval_secs", self.health_interval_secs),
            ("health_timeout_secs", self.health_timeout_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect_attempts: self.reconnect_attempts,
            ..SessionConfig::new(self.server_url.clone())
        }
    }

    pub fn executor_config(&self) -> anyhow::Result<ExecutorConfig> {
        let working_dir = match &self.workspace_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("resolving current directory")?,
        };
        Ok(ExecutorConfig {
            working_dir,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        })
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}
