//! Configuration loading and management
//!
//! Loads the JSON configuration file and applies `TUN_NAT_*` environment
//! overrides.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        portal = %config.nat.portal_v4,
        gateway = %config.nat.gateway_v4,
        mtu = config.nat.mtu,
        udp_mode = ?config.nat.udp_mode,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUN_NAT_DEVICE_FD`: Use an already-open TUN descriptor
/// - `TUN_NAT_DEVICE_NAME`: Override the interface name
/// - `TUN_NAT_LOG_LEVEL`: Override log level
/// - `TUN_NAT_MTU`: Override device MTU
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(fd) = var("TUN_NAT_DEVICE_FD") {
        config.device.fd = Some(fd.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_NAT_DEVICE_FD".into(),
            reason: format!("Invalid file descriptor: {fd}"),
        })?);
        debug!("Device fd overridden to {:?}", config.device.fd);
    }

    if let Some(name) = var("TUN_NAT_DEVICE_NAME") {
        config.device.name = Some(name);
        debug!("Device name overridden to {:?}", config.device.name);
    }

    if let Some(level) = var("TUN_NAT_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(mtu) = var("TUN_NAT_MTU") {
        config.nat.mtu = mtu.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_NAT_MTU".into(),
            reason: format!("Invalid number: {mtu}"),
        })?;
        debug!("MTU overridden to {}", config.nat.mtu);
    }

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
