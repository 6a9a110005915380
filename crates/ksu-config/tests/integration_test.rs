//! Integration tests for ksu-config
//!
//! These tests verify config loading with real files on disk.

use ksu_config::{Config, ConfigError, LogLevel, StrategyChoice};
use tempfile::tempdir;

/// Test config loading from a complete file
#[test]
fn test_load_full_config_from_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("hook.toml");

    let config_content = r#"
[hooks]
strategy = "probe"
compat_table = false
input_hook = false

[log]
level = "trace"
"#;
    std::fs::write(&path, config_content).unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.hooks.strategy, StrategyChoice::Probe);
    assert!(!config.hooks.compat_table);
    assert!(!config.hooks.input_hook);
    assert_eq!(config.log.level, LogLevel::Trace);
}

/// Missing file surfaces as an IO error
#[test]
fn test_missing_file_is_io_error() {
    let temp = tempdir().unwrap();
    let err = Config::from_file(&temp.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

/// Empty file yields defaults
#[test]
fn test_empty_file_yields_defaults() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("hook.toml");
    std::fs::write(&path, "").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config, Config::default());
}

/// Serialized config parses back to the same value
#[test]
fn test_written_config_reloads() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("hook.toml");

    let mut config = Config::default();
    config.hooks.strategy = StrategyChoice::None;
    config.log.level = LogLevel::Warn;
    std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

    assert_eq!(Config::from_file(&path).unwrap(), config);
}
