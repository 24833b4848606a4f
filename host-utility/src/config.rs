// Configuration management for the rpi-cloner CLI.
//
// Persists a handful of appliance-wide defaults (clone mode, erase size,
// transfer port) under the XDG config directory, following the same
// load-or-default-and-save pattern as larger host utilities in this family.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpiClonerConfig {
    /// Configuration schema version, for future migrations.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Default clone mode (`exact`, `smart`, `verify`) used when `--mode` is
    /// omitted and the `CLONE_MODE` environment variable is unset.
    #[serde(default = "default_clone_mode")]
    pub default_clone_mode: String,

    /// MiB wiped from each end of the device in quick-erase mode.
    #[serde(default = "default_quick_wipe_mib")]
    pub quick_wipe_mib: u64,

    /// TCP port the peer-transfer HTTP server listens on.
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,

    /// Flag filename identifying a partition as an image repository.
    #[serde(default = "default_repo_flag_filename")]
    pub repo_flag_filename: String,

    /// Stable identifier advertised over mDNS; generated once and persisted
    /// so peers see a consistent device across restarts.
    #[serde(default)]
    pub device_id: Option<String>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}
fn default_clone_mode() -> String {
    "smart".to_string()
}
fn default_quick_wipe_mib() -> u64 {
    64
}
fn default_transfer_port() -> u16 {
    crate::constants::DEFAULT_TRANSFER_PORT
}
fn default_repo_flag_filename() -> String {
    rpi_cloner_storage::repo::REPO_FLAG_FILENAME.to_string()
}

impl Default for RpiClonerConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            default_clone_mode: default_clone_mode(),
            quick_wipe_mib: default_quick_wipe_mib(),
            transfer_port: default_transfer_port(),
            repo_flag_filename: default_repo_flag_filename(),
            device_id: None,
        }
    }
}

impl RpiClonerConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {path:?}"))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {parent:?}"))?;
        }
        let contents = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(&path, contents).with_context(|| format!("writing config file {path:?}"))
    }

    fn config_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("could not determine XDG config directory")?;
        Ok(base.join("rpi-cloner").join("config.toml"))
    }

    /// Resolves the effective clone mode: explicit CLI flag, then the
    /// `CLONE_MODE` environment variable, then the configured default.
    pub fn effective_clone_mode(&self, cli_flag: Option<&str>) -> String {
        cli_flag
            .map(str::to_string)
            .or_else(|| std::env::var("CLONE_MODE").ok())
            .unwrap_or_else(|| self.default_clone_mode.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_clone_mode_prefers_cli_flag() {
        let config = RpiClonerConfig::default();
        assert_eq!(config.effective_clone_mode(Some("exact")), "exact");
    }

    #[test]
    fn effective_clone_mode_falls_back_to_default() {
        // SAFETY: test-local env mutation, no other test reads CLONE_MODE.
        unsafe { std::env::remove_var("CLONE_MODE") };
        let config = RpiClonerConfig::default();
        assert_eq!(config.effective_clone_mode(None), "smart");
    }
}
