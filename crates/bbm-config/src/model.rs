use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Path value that opens a private in-memory database instead of a file.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Top-level configuration, loaded from `config.yml` or `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logical database name (`main`, `ci`) to its storage settings.
    pub databases: BTreeMap<String, DatabaseConfig>,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bbm")
            .join("main.db");

        let mut databases = BTreeMap::new();
        databases.insert("main".to_string(), DatabaseConfig { path });

        Self {
            databases,
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file backing this logical database. Databases configured with
    /// the same path share one connection.
    pub path: PathBuf,
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(IN_MEMORY_PATH),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == Path::new(IN_MEMORY_PATH)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
