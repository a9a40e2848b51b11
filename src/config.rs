//! Configuration handling for nmguard

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::killswitch::{KillSwitchSettings, RetryPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub killswitch: KillSwitchOptions,
    pub retry: RetryOptions,
    pub nm: NmOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchOptions {
    /// Keep blocking across disconnects and reboots.
    pub permanent: bool,
    /// Maintain the standalone IPv6 blackhole alongside the IPv4 shapes.
    pub ipv6_leak_protection: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NmOptions {
    /// Seconds to wait for one nmcli/busctl invocation.
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            killswitch: KillSwitchOptions::default(),
            retry: RetryOptions::default(),
            nm: NmOptions::default(),
        }
    }
}

impl Default for KillSwitchOptions {
    fn default() -> Self {
        Self {
            permanent: false,
            ipv6_leak_protection: true,
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl Default for NmOptions {
    fn default() -> Self {
        Self { timeout_secs: 15 }
    }
}

impl Config {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).expect("Failed to serialize config");
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load the first config file found, falling back to defaults when none
    /// exists. A file that exists but does not parse is an error.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        for path in Self::candidate_paths() {
            if path.exists() {
                debug!("Loading config from {}", path.display());
                return Self::load(&path);
            }
        }
        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Where `init` writes its file.
    pub fn default_path() -> PathBuf {
        PathBuf::from("nmguard.toml")
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![Self::default_path()];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("nmguard").join("config.toml"));
        }
        paths
    }

    pub fn settings(&self) -> KillSwitchSettings {
        KillSwitchSettings {
            permanent: self.killswitch.permanent,
            ipv6_leak_protection: self.killswitch.ipv6_leak_protection,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            backoff: std::time::Duration::from_millis(self.retry.backoff_ms),
        }
    }

    pub fn nm_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.nm.timeout_secs)
    }
}
