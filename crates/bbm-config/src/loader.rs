use std::path::{Path, PathBuf};

use bbm_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const DEFAULT_CONFIG_FILE: &str = "config.yml";

/// Resolves and parses the bbm configuration file.
pub struct ConfigLoader {
    path: PathBuf,
    explicit: bool,
}

impl ConfigLoader {
    /// Load from `path`. The file must exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            explicit: true,
        }
    }

    /// Load from `<config dir>/bbm/config.yml`, falling back to defaults
    /// when that file is absent.
    pub fn from_default_location() -> Self {
        Self {
            path: default_config_dir().join(DEFAULT_CONFIG_FILE),
            explicit: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AppConfig> {
        if !self.explicit && !self.path.exists() {
            debug!(
                "no config file at {}, using defaults",
                self.path.display()
            );
            return Ok(AppConfig::default());
        }

        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let config = parse_config(&self.path, &contents)?;
        info!("loaded config from {}", self.path.display());
        Ok(config)
    }
}

/// Default directory holding `config.yml`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bbm")
}

fn parse_config(path: &Path, contents: &str) -> Result<AppConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
        "toml" => {
            toml::from_str(contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
        }
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}
