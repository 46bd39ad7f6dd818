//! TOML configuration file loading
//!
//! Supports `~/.config/lcsm/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.
//!
//! ```toml
//! [runner]
//! listen_addr = ":8008"
//! auth_token = "change-me"
//!
//! [panel]
//! call_timeout_secs = 30
//!
//! [[panel.runners]]
//! id = 1
//! endpoint = "ws://10.0.0.5:8008/lcsm-node.socket"
//! auth_token = "change-me"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::RunnerEntry;
use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LcsmConfigFile {
    /// Runner (server side) settings
    #[serde(default)]
    pub runner: RunnerFileConfig,

    /// Panel (client side) settings
    #[serde(default)]
    pub panel: PanelFileConfig,
}

/// Runner settings
#[derive(Debug, Default, Deserialize)]
pub struct RunnerFileConfig {
    pub listen_addr: Option<String>,
    pub auth_token: Option<String>,
    pub db_path: Option<String>,
    pub data_dir: Option<String>,
}

/// Panel settings
#[derive(Debug, Default, Deserialize)]
pub struct PanelFileConfig {
    /// Per-call response window in seconds
    pub call_timeout_secs: Option<u64>,

    /// Known runners
    #[serde(default)]
    pub runners: Vec<RunnerEntry>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed or has wrongly-typed fields
pub fn parse_config(content: &str) -> Result<LcsmConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `LcsmConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LcsmConfigFile {
    config_file_path().map_or_else(LcsmConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> LcsmConfigFile {
    if !path.exists() {
        return LcsmConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LcsmConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
            LcsmConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/lcsm/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("lcsm").join("config.toml"))
}
