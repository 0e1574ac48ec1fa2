//! Daemon settings loaded from an optional TOML file.
//!
//! Parsing is lenient: a missing or malformed file logs a warning and falls
//! back to defaults, never preventing the daemon from starting.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub daemon: DaemonSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct DaemonSection {
    pub checkpoint_addr: Option<String>,
    pub notify_addr: Option<String>,
    pub snapshot_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

pub fn load_settings(config_path: Option<&Path>) -> DaemonSection {
    let Some(path) = config_path else {
        return DaemonSection::default();
    };

    let contents = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to read config file {}: {}", path.display(), err);
            return DaemonSection::default();
        }
    };

    match toml::from_str::<ConfigFile>(&contents) {
        Ok(parsed) => parsed.daemon,
        Err(err) => {
            warn!("Failed to parse {}: {}", path.display(), err);
            DaemonSection::default()
        }
    }
}
