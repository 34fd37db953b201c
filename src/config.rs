//! Configuration loader and validator for the notifier process.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

const DEFAULT_APP_NAME: &str = "Feed notifier";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
}

/// App-level settings. Per-owner notification settings live in the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_app_name")]
    pub name: String,
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

impl App {
    /// Expand a leading `~/` in `data_dir` using `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins, then `app.database_url`, then a file under `data_dir`.
    pub fn database_url(&self) -> String {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return url;
        }
        match &self.app.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}/notifier.db", self.app.resolved_data_dir()),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if let Some(url) = &cfg.app.database_url {
        if !url.starts_with("sqlite:") {
            return Err(ConfigError::Invalid("app.database_url must be a sqlite: URL"));
        }
    }
    if cfg.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid("app.name must be non-empty"));
    }
    Ok(())
}

/// Example YAML shipped with the binaries.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  # database_url: "sqlite://./data/notifier.db"
  name: "Feed notifier"
"#
}
