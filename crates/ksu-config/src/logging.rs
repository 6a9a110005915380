//! Structured logging utilities for the interception layer.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use ksu_config::log_hook_info;
//!
//! log_hook_info!("register kp", symbol = "input_event", ret = 0);
//! log_proxy_debug!("append", count = 128);
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ConfigError;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const HOOK: &'static str = "HOOK";
    pub const PATCH: &'static str = "PATCH";
    pub const PROXY: &'static str = "PROXY";
    pub const WORKER: &'static str = "WORKER";
    pub const INPUT: &'static str = "INPUT";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ConfigError::Invalid {
                key: "log.level",
                value: s.to_string(),
            }),
        }
    }
}

// === HOOK logging macros ===

#[macro_export]
macro_rules! log_hook_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "HOOK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_hook_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "HOOK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_hook_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "HOOK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_hook_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "HOOK", $($key = $value,)* $msg)
    };
}

// === PATCH logging macros ===

#[macro_export]
macro_rules! log_patch_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "PATCH", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_patch_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "PATCH", $($key = $value,)* $msg)
    };
}

// === PROXY logging macros ===

#[macro_export]
macro_rules! log_proxy_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "PROXY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_proxy_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "PROXY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_proxy_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "PROXY", $($key = $value,)* $msg)
    };
}

// === WORKER logging macros ===

#[macro_export]
macro_rules! log_worker_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "WORKER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_worker_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "WORKER", $($key = $value,)* $msg)
    };
}

// === INPUT logging macros ===

#[macro_export]
macro_rules! log_input_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "INPUT", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at load time. `RUST_LOG` takes precedence when set.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    // A subscriber may already be installed by the embedding process
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
