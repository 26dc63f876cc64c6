use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// File name of the per-user configuration, placed in the home directory.
pub const CONFIG_FILE_NAME: &str = ".gatorconfig.toml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_db_url")]
    pub db_url: String,
    /// Name of the logged-in user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user_name: Option<String>,
    #[serde(default)]
    pub fetch: FetchConfig,
}

fn default_db_url() -> String {
    "sqlite:gator.db?mode=rwc".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FetchConfig {
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("gator/{} (RSS Aggregator)", env!("CARGO_PKG_VERSION"))
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: default_db_url(),
            current_user_name: None,
            fetch: FetchConfig::default(),
        }
    }
}

impl Config {
    /// `~/.gatorconfig.toml`
    pub fn default_path() -> Result<PathBuf> {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(CONFIG_FILE_NAME))
            .ok_or_else(|| Error::Config("could not determine home directory".to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Record `name` as the current user and persist the file. On a failed
    /// write `self` is left unchanged.
    pub fn set_user<P: AsRef<Path>>(&mut self, name: &str, path: P) -> Result<()> {
        let updated = Self {
            current_user_name: Some(name.to_string()),
            ..self.clone()
        };
        updated.save(path)?;
        *self = updated;
        Ok(())
    }
}
