use chatgate_common::{Error, MAX_RETENTION_DAYS, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::model::AppConfig;

pub struct ConfigLoader;

impl ConfigLoader {
    /// `~/.chatgate`
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chatgate")
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.yml")
    }

    /// Load and validate configuration.
    ///
    /// An explicit path must exist. Without one, the default location is used and
    /// built-in defaults apply when no file is there.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let config = match path {
            Some(path) => Self::load_file(path)?,
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::load_file(&default)?
                } else {
                    info!(
                        "no config file at {}, using built-in defaults",
                        default.display()
                    );
                    AppConfig::default()
                }
            }
        };
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config {}: {e}", path.display()))
        })?;
        let config = Self::parse(path, &content)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(path: &Path, content: &str) -> Result<AppConfig> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(content)
                .map_err(|e| Error::Config(format!("invalid TOML config: {e}"))),
            Some("yml") | Some("yaml") => serde_yaml::from_str(content)
                .map_err(|e| Error::Config(format!("invalid YAML config: {e}"))),
            other => Err(Error::Config(format!(
                "unsupported config extension {other:?}, expected .yml, .yaml or .toml"
            ))),
        }
    }

    pub fn validate(config: &AppConfig) -> Result<()> {
        let mut seen = HashSet::new();
        for model in &config.models {
            if !seen.insert(model.name.as_str()) {
                return Err(Error::Config(format!(
                    "model '{}' is listed more than once",
                    model.name
                )));
            }
        }

        if config.model(&config.defaults.model).is_none() {
            return Err(Error::Config(format!(
                "default model '{}' is not in the model catalog",
                config.defaults.model
            )));
        }
        if config.model(&config.engine.summary_model).is_none() {
            return Err(Error::Config(format!(
                "summary model '{}' is not in the model catalog",
                config.engine.summary_model
            )));
        }
        if config.engine.max_tool_iterations == 0 {
            return Err(Error::Config(
                "engine.max_tool_iterations must be at least 1".to_string(),
            ));
        }
        if config.engine.progress_every == 0 {
            return Err(Error::Config(
                "engine.progress_every must be at least 1".to_string(),
            ));
        }
        if config.engine.keep_recent < 2 {
            return Err(Error::Config(format!(
                "engine.keep_recent ({}) must be at least 2 so the newest messages stay verbatim",
                config.engine.keep_recent
            )));
        }
        if config.defaults.retention_days > MAX_RETENTION_DAYS {
            return Err(Error::Config(format!(
                "defaults.retention_days ({}) must not exceed {MAX_RETENTION_DAYS}",
                config.defaults.retention_days
            )));
        }
        if config.defaults.context_limit <= config.engine.keep_recent + 1 {
            return Err(Error::Config(format!(
                "defaults.context_limit ({}) must exceed engine.keep_recent + 1 ({})",
                config.defaults.context_limit,
                config.engine.keep_recent + 1
            )));
        }

        for family in config.providers.keys() {
            if family.parse::<chatgate_common::ProviderFamily>().is_err() {
                warn!("ignoring credentials for unknown provider family '{family}'");
            }
        }
        Ok(())
    }
}
