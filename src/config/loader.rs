//! Configuration loading
//!
//! JSON file loading with environment variable overrides, validated
//! before use.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or
/// validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        pool = %config.pool.network,
        tick_interval_ms = config.health.tick_interval_ms,
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
/// - `VPN_CONTROL_POOL`: Override the tunnel address pool network
/// - `VPN_CONTROL_TICK_INTERVAL_MS`: Override the health tick cadence
/// - `VPN_CONTROL_ENGINE_TIMEOUT_SECS`: Override the engine call deadline
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(pool) = std::env::var("VPN_CONTROL_POOL") {
        config.pool.network = pool.parse().map_err(|_| ConfigError::EnvError {
            name: "VPN_CONTROL_POOL".into(),
            reason: format!("Invalid IPv4 network: {pool}"),
        })?;
        debug!("Pool network overridden to {}", config.pool.network);
    }

    if let Ok(tick) = std::env::var("VPN_CONTROL_TICK_INTERVAL_MS") {
        config.health.tick_interval_ms = tick.parse().map_err(|_| ConfigError::EnvError {
            name: "VPN_CONTROL_TICK_INTERVAL_MS".into(),
            reason: format!("Invalid number: {tick}"),
        })?;
        debug!(
            "Health tick interval overridden to {}ms",
            config.health.tick_interval_ms
        );
    }

    if let Ok(timeout) = std::env::var("VPN_CONTROL_ENGINE_TIMEOUT_SECS") {
        config.engine.call_timeout_secs = timeout.parse().map_err(|_| ConfigError::EnvError {
            name: "VPN_CONTROL_ENGINE_TIMEOUT_SECS".into(),
            reason: format!("Invalid number: {timeout}"),
        })?;
        debug!(
            "Engine call timeout overridden to {}s",
            config.engine.call_timeout_secs
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; the override tests take this lock so
    // the parallel test harness cannot interleave set/remove pairs
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_load_config_str_minimal() {
        let config = load_config_str("{}").unwrap();
        assert_eq!(config.pool.network.to_string(), "10.8.0.0/24");
    }

    #[test]
    fn test_load_config_str_invalid_json() {
        let err = load_config_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_config_str_fails_validation() {
        let err = load_config_str(r#"{"health": {"tick_interval_ms": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/vpn-control.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_env_override_pool() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = Config::default();
        std::env::set_var("VPN_CONTROL_POOL", "10.99.0.0/24");
        let result = apply_env_overrides(&mut config);
        std::env::remove_var("VPN_CONTROL_POOL");

        result.unwrap();
        assert_eq!(config.pool.network.to_string(), "10.99.0.0/24");
    }

    #[test]
    fn test_env_override_invalid_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = Config::default();
        std::env::set_var("VPN_CONTROL_ENGINE_TIMEOUT_SECS", "not-a-number");
        let result = apply_env_overrides(&mut config);
        std::env::remove_var("VPN_CONTROL_ENGINE_TIMEOUT_SECS");

        assert!(matches!(result, Err(ConfigError::EnvError { .. })));
    }
}
