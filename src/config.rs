//! Client configuration.
//!
//! Settings come from (lowest to highest precedence) built-in defaults, an
//! optional JSON config file, and `EVENTBUS_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_MAX_FRAME_SIZE;

/// Default bridge host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default bridge port.
pub const DEFAULT_PORT: u16 = 7000;

/// Default liveness ping interval in milliseconds.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 5000;

/// Default reply timeout in milliseconds.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 30_000;

/// Connection settings for an [`EventBus`](crate::bus::EventBus).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    /// Interval between liveness pings while connected.
    pub ping_interval_ms: u64,
    /// Reply timeout used when a send does not specify one.
    pub reply_timeout_ms: u64,
    /// Largest inbound frame accepted before the connection is dropped.
    pub max_frame_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl BusConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the ping interval. Sub-millisecond intervals round up to 1 ms.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        self.ping_interval_ms = if ms == 0 && !interval.is_zero() { 1 } else { ms };
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        match self.problem() {
            Some(problem) => bail!("{}", problem),
            None => Ok(()),
        }
    }

    /// First setting the engine cannot run with, if any.
    pub(crate) fn problem(&self) -> Option<&'static str> {
        if self.host.trim().is_empty() {
            Some("host must not be empty")
        } else if self.ping_interval_ms == 0 {
            Some("ping_interval_ms must be greater than zero")
        } else if self.max_frame_size == 0 {
            Some("max_frame_size must be greater than zero")
        } else {
            None
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: BusConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overlaid with `EVENTBUS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Resolve the effective configuration: the config file at
    /// [`default_config_path`] if it exists, then environment overrides.
    pub fn resolve() -> Result<Self> {
        let path = default_config_path();
        let mut config = if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Split out from `from_env` so
    /// the parsing rules can be tested without touching process state.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("EVENTBUS_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("EVENTBUS_PORT") {
            self.port = parse_var("EVENTBUS_PORT", &port)?;
        }
        if let Some(ms) = lookup("EVENTBUS_PING_INTERVAL_MS") {
            self.ping_interval_ms = parse_var("EVENTBUS_PING_INTERVAL_MS", &ms)?;
        }
        if let Some(ms) = lookup("EVENTBUS_REPLY_TIMEOUT_MS") {
            self.reply_timeout_ms = parse_var("EVENTBUS_REPLY_TIMEOUT_MS", &ms)?;
        }
        if let Some(size) = lookup("EVENTBUS_MAX_FRAME_SIZE") {
            self.max_frame_size = parse_var("EVENTBUS_MAX_FRAME_SIZE", &size)?;
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", name, value))
}

/// Resolve the default config file path.
///
/// Resolution order:
/// 1. `$EVENTBUS_CONFIG`
/// 2. `<config dir>/eventbus-bridge/config.json` (XDG on Linux, Library on macOS)
/// 3. `/etc/eventbus-bridge/config.json` (fallback)
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("EVENTBUS_CONFIG") {
        return PathBuf::from(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("eventbus-bridge").join("config.json");
    }

    PathBuf::from("/etc/eventbus-bridge/config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 7000);
        assert_eq!(config.ping_interval(), Duration::from_millis(5000));
        assert_eq!(config.reply_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = BusConfig::new("bridge.local", 7001)
            .with_ping_interval(Duration::from_millis(1100))
            .with_reply_timeout(Duration::from_millis(50))
            .with_max_frame_size(1024);
        assert_eq!(config.host, "bridge.local");
        assert_eq!(config.port, 7001);
        assert_eq!(config.ping_interval_ms, 1100);
        assert_eq!(config.reply_timeout_ms, 50);
        assert_eq!(config.max_frame_size, 1024);
    }

    #[test]
    fn test_validate_rejects_zero_ping_interval() {
        let config = BusConfig::default().with_ping_interval(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ping_interval_ms"));
    }

    #[test]
    fn test_sub_millisecond_ping_interval_rounds_up() {
        let config = BusConfig::default().with_ping_interval(Duration::from_micros(500));
        assert_eq!(config.ping_interval_ms, 1);
        assert!(config.validate().is_ok());

        let config = BusConfig::default().with_ping_interval(Duration::from_micros(1500));
        assert_eq!(config.ping_interval_ms, 1);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BusConfig::default();
        config
            .apply_env(lookup(&[
                ("EVENTBUS_HOST", "10.0.0.5"),
                ("EVENTBUS_PORT", "7001"),
                ("EVENTBUS_PING_INTERVAL_MS", "250"),
            ]))
            .unwrap();

        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 7001);
        assert_eq!(config.ping_interval_ms, 250);
        assert_eq!(config.reply_timeout_ms, DEFAULT_REPLY_TIMEOUT_MS);
    }

    #[test]
    fn test_env_rejects_malformed_number() {
        let mut config = BusConfig::default();
        let err = config
            .apply_env(lookup(&[("EVENTBUS_PORT", "seven thousand")]))
            .unwrap_err();
        assert!(
            err.to_string().contains("EVENTBUS_PORT"),
            "Expected variable name in error, got: {}",
            err
        );
    }

    #[test]
    fn test_load_partial_file() {
        let path = std::env::temp_dir().join(format!(
            "eventbus-bridge-config-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{"port": 7100, "reply_timeout_ms": 500}"#).unwrap();

        let config = BusConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.port, 7100);
        assert_eq!(config.reply_timeout_ms, 500);
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = BusConfig::load(Path::new("/nonexistent/eventbus.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/eventbus.json"));
    }

    #[test]
    fn test_default_config_path_format() {
        let path = default_config_path();
        let filename = path.file_name().unwrap().to_str().unwrap();
        assert!(
            filename.ends_with(".json"),
            "Unexpected config filename: {}",
            filename
        );
    }
}
