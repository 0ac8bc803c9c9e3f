// ABOUTME: Configuration parsing for the launcher daemon.
// ABOUTME: Reads an optional TOML file and produces a typed Config with defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/launcherd.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Seconds a replacement booster sleeps after fork before
    /// re-initializing, so a just-launched application is not starved.
    /// Ignored in boot mode.
    pub respawn_delay_secs: u32,
    /// Directory holding the per-booster-type listening sockets.
    pub socket_dir: PathBuf,
    /// Path of the single-instance shared object.
    pub single_instance_plugin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            respawn_delay_secs: 2,
            socket_dir: PathBuf::from("/tmp"),
            single_instance_plugin: "/usr/lib/launcherd/libsingleinstance.so".to_string(),
        }
    }
}

pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}
