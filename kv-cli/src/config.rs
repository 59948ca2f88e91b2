//! CLI-side configuration: where `kvcli` keeps its log files and which
//! `kv::config::EngineConfig` to open, loaded via `confy`.

use anyhow::Result;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    /// Passed straight through to `kv::config::EngineConfig::data_dir`.
    pub data_dir: String,

    /// Directory `kvcli`'s own log file is rotated into.
    pub log_dir: String,

    pub log_level: String,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            data_dir: "./kvell-data".to_string(),
            log_dir: format!("{}/.kvcli", std::env::var("HOME").unwrap_or_else(|_| ".".to_string())),
            log_level: "info".to_string(),
        }
    }
}

impl ConfigLoad {
    /// Loads `path` via `confy`, falling back to its built-in default file
    /// location when `path` doesn't parse as one confy recognizes.
    pub fn load(path: &str) -> Result<Self> {
        Ok(confy::load_path(path)?)
    }

    pub fn engine_config(&self) -> kv::config::EngineConfig {
        let mut cfg = kv::config::EngineConfig::default();
        cfg.data_dir = self.data_dir.clone();
        cfg.log_level = self.log_level.clone();
        cfg
    }
}
