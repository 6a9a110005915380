//! # ksu-config
//!
//! Configuration for the KernelSU interception layer.
//!
//! Loads configuration from:
//! 1. Built-in defaults
//! 2. `$KSU_HOOK_CONFIG`, or `/data/adb/ksu/hook.toml` when it exists
//! 3. Environment variables (highest priority)
//!
//! The injected init fragment and the identity it is injected for are not
//! configurable; they live as constants next to the read proxy.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

pub use logging::LogLevel;

/// Default on-device location of the hook configuration.
pub const DEFAULT_CONFIG_PATH: &str = "/data/adb/ksu/hook.toml";

/// Environment variable naming an alternative config file.
pub const ENV_CONFIG_PATH: &str = "KSU_HOOK_CONFIG";
pub const ENV_STRATEGY: &str = "KSU_HOOK_STRATEGY";
pub const ENV_LOG: &str = "KSU_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hooks: HookConfig,
    pub log: LogConfig,
}

/// How syscall entry points get intercepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyChoice {
    /// Pick from detected platform capabilities at load time.
    #[default]
    Auto,
    /// Symbol-based probes only.
    Probe,
    /// Raw dispatch table patching only.
    Table,
    /// Install no syscall hooks at all.
    None,
}

impl FromStr for StrategyChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "probe" | "kprobe" => Ok(Self::Probe),
            "table" | "syscall_table" => Ok(Self::Table),
            "none" | "off" => Ok(Self::None),
            _ => Err(ConfigError::Invalid {
                key: "hooks.strategy",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub strategy: StrategyChoice,
    /// Also patch the 32-bit compatibility table when the platform exposes one.
    pub compat_table: bool,
    /// Register the key-event observer used for safe-mode detection.
    pub input_hook: bool,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyChoice::Auto,
            compat_table: true,
            input_hook: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Load config from the standard location, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            debug!("Loading hook config from {:?}", path);
            Self::from_file(&path)?
        } else {
            Config::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but one bad value never costs the rest.
    /// An unreadable file leaves the defaults; an invalid override leaves the
    /// value it would have replaced. Every problem met is returned.
    pub fn load_lenient() -> (Self, Vec<ConfigError>) {
        let path = Self::config_path();
        let mut problems = Vec::new();
        let mut config = if path.exists() {
            debug!("Loading hook config from {:?}", path);
            Self::from_file(&path).unwrap_or_else(|e| {
                problems.push(e);
                Config::default()
            })
        } else {
            Config::default()
        };
        problems.extend(config.apply_overrides_lenient(|key| std::env::var(key).ok()));
        (config, problems)
    }

    /// `$KSU_HOOK_CONFIG` if set, otherwise [`DEFAULT_CONFIG_PATH`].
    pub fn config_path() -> PathBuf {
        std::env::var_os(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(strategy) = lookup(ENV_STRATEGY) {
            self.hooks.strategy = strategy.parse()?;
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.log.level = level.parse()?;
        }
        Ok(())
    }

    /// Apply each override on its own. Invalid ones are skipped and returned.
    pub fn apply_overrides_lenient<F>(&mut self, lookup: F) -> Vec<ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut rejected = Vec::new();
        if let Some(strategy) = lookup(ENV_STRATEGY) {
            match strategy.parse() {
                Ok(strategy) => self.hooks.strategy = strategy,
                Err(e) => rejected.push(e),
            }
        }
        if let Some(level) = lookup(ENV_LOG) {
            match level.parse() {
                Ok(level) => self.log.level = level,
                Err(e) => rejected.push(e),
            }
        }
        rejected
    }
}
