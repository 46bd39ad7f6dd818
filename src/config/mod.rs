//! Configuration for runners and panels
//!
//! Precedence is CLI flag > environment > config file > default.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};
use file::{LcsmConfigFile, PanelFileConfig, RunnerFileConfig};

/// Default runner listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8008";

/// Default runner database path
pub const DEFAULT_DB_PATH: &str = "./lcsm-node.db";

/// Default runner data directory
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default per-call response window in seconds
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Runner (server side) configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Socket address to bind, `host:port`
    pub listen_addr: String,

    /// Token panels must present in their first frame
    pub auth_token: String,

    /// `SQLite` database path
    pub db_path: PathBuf,

    /// Root for instance working directories
    pub data_dir: PathBuf,
}

/// Explicit runner settings from flags or environment
#[derive(Debug, Clone, Default)]
pub struct RunnerSettings {
    pub listen_addr: Option<String>,
    pub auth_token: Option<String>,
    pub db_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl RunnerSettings {
    /// Read `LCSM_LISTEN_ADDR`, `LCSM_AUTH_TOKEN`, `LCSM_DB_PATH`, `LCSM_DATA_DIR`
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            listen_addr: std::env::var("LCSM_LISTEN_ADDR").ok(),
            auth_token: std::env::var("LCSM_AUTH_TOKEN").ok(),
            db_path: std::env::var("LCSM_DB_PATH").ok().map(PathBuf::from),
            data_dir: std::env::var("LCSM_DATA_DIR").ok().map(PathBuf::from),
        }
    }

    /// Fill unset fields from `fallback`
    #[must_use]
    pub fn or(self, fallback: Self) -> Self {
        Self {
            listen_addr: self.listen_addr.or(fallback.listen_addr),
            auth_token: self.auth_token.or(fallback.auth_token),
            db_path: self.db_path.or(fallback.db_path),
            data_dir: self.data_dir.or(fallback.data_dir),
        }
    }
}

impl RunnerConfig {
    /// Load configuration: `settings`, then environment, then the config file
    ///
    /// # Errors
    ///
    /// Returns error if no auth token is configured
    pub fn load(settings: RunnerSettings) -> Result<Self> {
        Self::resolve(
            settings.or(RunnerSettings::from_env()),
            file::load_config_file().runner,
        )
    }

    /// Merge explicit settings with file values and defaults
    ///
    /// # Errors
    ///
    /// Returns error if no non-empty auth token is configured
    pub fn resolve(settings: RunnerSettings, file: RunnerFileConfig) -> Result<Self> {
        let auth_token = settings
            .auth_token
            .or(file.auth_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                Error::Config("auth token required (set LCSM_AUTH_TOKEN or --token)".to_string())
            })?;

        let listen_addr = settings
            .listen_addr
            .or(file.listen_addr)
            .map_or_else(|| DEFAULT_LISTEN_ADDR.to_string(), |addr| normalize_listen_addr(&addr));

        Ok(Self {
            listen_addr,
            auth_token,
            db_path: settings
                .db_path
                .or_else(|| file.db_path.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            data_dir: settings
                .data_dir
                .or_else(|| file.data_dir.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        })
    }
}

/// Accept the bare `:port` form and bind it on all interfaces
#[must_use]
pub fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// A runner the panel knows how to reach
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerEntry {
    pub id: u64,
    pub endpoint: String,
    pub auth_token: String,
}

/// Panel (client side) configuration
#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub runners: Vec<RunnerEntry>,
    pub call_timeout: Duration,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            runners: Vec::new(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

impl PanelConfig {
    /// Load from the config file, with an optional timeout override in seconds
    ///
    /// `LCSM_CALL_TIMEOUT_SECS` applies when no override is given.
    #[must_use]
    pub fn load(call_timeout_secs: Option<u64>) -> Self {
        let LcsmConfigFile { panel, .. } = file::load_config_file();
        let call_timeout_secs = call_timeout_secs.or_else(|| {
            std::env::var("LCSM_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|secs| secs.parse().ok())
        });
        Self::resolve(call_timeout_secs, panel)
    }

    /// Merge an explicit timeout with file values and defaults
    #[must_use]
    pub fn resolve(call_timeout_secs: Option<u64>, file: PanelFileConfig) -> Self {
        let secs = call_timeout_secs
            .or(file.call_timeout_secs)
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS);

        Self {
            runners: file.runners,
            call_timeout: Duration::from_secs(secs),
        }
    }

    /// The configured entry for `runner_id`
    #[must_use]
    pub fn runner(&self, runner_id: u64) -> Option<&RunnerEntry> {
        self.runners.iter().find(|entry| entry.id == runner_id)
    }
}
