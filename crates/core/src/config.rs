use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the realtime layer. Every section has working
/// defaults; an empty TOML document is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Per route-class rate limits, e.g. `[rate_limits.payments]`.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitSettings>,
    #[serde(default)]
    pub presence: PresenceSettings,
    #[serde(default)]
    pub typing: TypingSettings,
    #[serde(default)]
    pub event_bus: EventBusSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl BreakerSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSettings {
    #[serde(default = "default_away_timeout_ms")]
    pub away_timeout_ms: u64,
    #[serde(default = "default_db_sync_interval_ms")]
    pub db_sync_interval_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            away_timeout_ms: default_away_timeout_ms(),
            db_sync_interval_ms: default_db_sync_interval_ms(),
        }
    }
}

impl PresenceSettings {
    pub fn away_timeout(&self) -> Duration {
        Duration::from_millis(self.away_timeout_ms)
    }

    pub fn db_sync_interval(&self) -> Duration {
        Duration::from_millis(self.db_sync_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypingSettings {
    #[serde(default = "default_auto_stop_ms")]
    pub auto_stop_ms: u64,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            auto_stop_ms: default_auto_stop_ms(),
        }
    }
}

impl TypingSettings {
    pub fn auto_stop(&self) -> Duration {
        Duration::from_millis(self.auto_stop_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusSettings {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    2
}

fn default_away_timeout_ms() -> u64 {
    300_000
}

fn default_db_sync_interval_ms() -> u64 {
    60_000
}

fn default_auto_stop_ms() -> u64 {
    3_000
}

fn default_channel_capacity() -> usize {
    1024
}

/// Parse configuration from a TOML string and validate it.
pub fn load_config_from_str(toml_str: &str) -> Result<RealtimeConfig, ConfigError> {
    let config: RealtimeConfig = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    validate(&config)?;
    Ok(config)
}

/// Load configuration from a file path.
pub fn load_config_from(path: &std::path::Path) -> Result<RealtimeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

fn validate(config: &RealtimeConfig) -> Result<(), ConfigError> {
    if config.breaker.failure_threshold == 0 {
        return Err(ConfigError::InvalidValue {
            field: "breaker.failure_threshold".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if config.breaker.success_threshold == 0 {
        return Err(ConfigError::InvalidValue {
            field: "breaker.success_threshold".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if config.breaker.recovery_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "breaker.recovery_timeout_ms".to_string(),
            message: "must be nonzero".to_string(),
        });
    }

    for (route, limits) in &config.rate_limits {
        if limits.window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("rate_limits.{route}.window_ms"),
                message: "must be nonzero".to_string(),
            });
        }
        if limits.max_requests == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("rate_limits.{route}.max_requests"),
                message: "must be at least 1".to_string(),
            });
        }
    }

    if config.presence.away_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "presence.away_timeout_ms".to_string(),
            message: "must be nonzero".to_string(),
        });
    }
    if config.presence.db_sync_interval_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "presence.db_sync_interval_ms".to_string(),
            message: "must be nonzero".to_string(),
        });
    }
    if config.typing.auto_stop_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "typing.auto_stop_ms".to_string(),
            message: "must be nonzero".to_string(),
        });
    }
    if config.event_bus.channel_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            field: "event_bus.channel_capacity".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.recovery_timeout_ms, 30_000);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.presence.away_timeout_ms, 300_000);
        assert_eq!(config.typing.auto_stop_ms, 3_000);
        assert_eq!(config.event_bus.channel_capacity, 1024);
        assert!(config.rate_limits.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[breaker]
failure_threshold = 3
recovery_timeout_ms = 10000
success_threshold = 1

[rate_limits.payments]
window_ms = 60000
max_requests = 5

[rate_limits.reads]
window_ms = 1000
max_requests = 100

[presence]
away_timeout_ms = 120000
db_sync_interval_ms = 30000

[typing]
auto_stop_ms = 5000

[event_bus]
channel_capacity = 256
"#;
        let config = load_config_from_str(toml_str).unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(
            config.breaker.recovery_timeout(),
            Duration::from_secs(10)
        );
        assert_eq!(config.rate_limits.len(), 2);
        assert_eq!(config.rate_limits["payments"].max_requests, 5);
        assert_eq!(
            config.rate_limits["payments"].window(),
            Duration::from_secs(60)
        );
        assert_eq!(config.presence.away_timeout(), Duration::from_secs(120));
        assert_eq!(config.typing.auto_stop(), Duration::from_secs(5));
        assert_eq!(config.event_bus.channel_capacity, 256);
    }

    #[test]
    fn rejects_zero_failure_threshold() {
        let result = load_config_from_str("[breaker]\nfailure_threshold = 0\n");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "breaker.failure_threshold"
        ));
    }

    #[test]
    fn rejects_zero_rate_limit_window() {
        let result = load_config_from_str(
            "[rate_limits.payments]\nwindow_ms = 0\nmax_requests = 5\n",
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. })
                if field == "rate_limits.payments.window_ms"
        ));
    }

    #[test]
    fn rejects_zero_auto_stop() {
        let result = load_config_from_str("[typing]\nauto_stop_ms = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn invalid_toml_reports_position() {
        let result = load_config_from_str("[breaker\nfailure_threshold = 3");
        assert!(matches!(result, Err(ConfigError::InvalidToml { .. })));
    }
}
