use anyhow::{Context, Result};
use chrono_tz::Tz;
use tracing::warn;

const ENV_PREFIX: &str = "MDC_SMARTHUB_";
pub const LOG_LEVEL_VAR: &str = "MDC_SMARTHUB_TELEGRAM_LOGLEVEL";

/// Errors found while validating a component's configuration.
/// A component that hits one of these stays inert; the process keeps running.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not configured")]
    Missing(&'static str),

    #[error("invalid URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported scheme {scheme:?} (expected one of {expected})")]
    UnsupportedScheme {
        scheme: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub mqtt: MqttConfig,
    pub influx: InfluxConfig,
    pub display_timezone: Tz,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub allowed_chat_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// `scheme://[user@]host:port`, scheme is `mqtt` or `ws`
    pub broker: Option<String>,
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Default)]
pub struct InfluxConfig {
    pub url: Option<String>,
    pub org: Option<String>,
    pub bucket: Option<String>,
    pub measurement: Option<String>,
    pub token: Option<String>,
}

fn default_topic_prefix() -> String {
    "telegrambot".to_string()
}

fn default_timezone() -> Tz {
    Tz::UTC
}

impl MqttConfig {
    /// Topic every outbound command is published on.
    pub fn commands_topic(&self) -> String {
        format!("{}/commands", self.topic_prefix)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Keys are the
    /// environment variable names, e.g. `MDC_SMARTHUB_TELEGRAM_API`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bot_token = get("TELEGRAM_API")
            .context("Missing bot token: set MDC_SMARTHUB_TELEGRAM_API")?;

        let allowed_chat_ids = get("TELEGRAM_CHAT_IDS")
            .map(|ids| ids.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let display_timezone = match get("TIMEZONE") {
            Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
                warn!("Unknown timezone {:?}, falling back to UTC", name);
                default_timezone()
            }),
            None => default_timezone(),
        };

        Ok(Self {
            telegram: TelegramConfig {
                bot_token,
                allowed_chat_ids,
            },
            mqtt: MqttConfig {
                broker: get("MQTT_BROKER"),
                topic_prefix: get("MQTT_TOPIC_PREFIX").unwrap_or_else(default_topic_prefix),
            },
            influx: InfluxConfig {
                url: get("INFLUXDB_URL"),
                org: get("INFLUXDB_ORG"),
                bucket: get("INFLUXDB_BUCKET"),
                measurement: get("INFLUXDB_MEASUREMENT"),
                token: get("INFLUXDB_TOKEN"),
            },
            display_timezone,
            log_level: get("TELEGRAM_LOGLEVEL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_missing_token_is_fatal() {
        let err = load(&[("MDC_SMARTHUB_TELEGRAM_CHAT_IDS", "1 2")]).unwrap_err();
        assert!(err.to_string().contains("MDC_SMARTHUB_TELEGRAM_API"));
    }

    #[test]
    fn test_blank_token_is_fatal() {
        assert!(load(&[("MDC_SMARTHUB_TELEGRAM_API", "   ")]).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("MDC_SMARTHUB_TELEGRAM_API", "token")]).unwrap();
        assert_eq!(config.telegram.bot_token, "token");
        assert!(config.telegram.allowed_chat_ids.is_empty());
        assert_eq!(config.mqtt.topic_prefix, "telegrambot");
        assert_eq!(config.mqtt.commands_topic(), "telegrambot/commands");
        assert!(config.mqtt.broker.is_none());
        assert!(config.influx.url.is_none());
        assert_eq!(config.display_timezone, Tz::UTC);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_chat_ids_are_space_separated() {
        let config = load(&[
            ("MDC_SMARTHUB_TELEGRAM_API", "token"),
            ("MDC_SMARTHUB_TELEGRAM_CHAT_IDS", " 12345  -100987 42 "),
        ])
        .unwrap();
        assert_eq!(
            config.telegram.allowed_chat_ids,
            vec!["12345", "-100987", "42"]
        );
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("MDC_SMARTHUB_TELEGRAM_API", "token"),
            ("MDC_SMARTHUB_MQTT_BROKER", "mqtt://bot@broker.local:1883"),
            ("MDC_SMARTHUB_MQTT_TOPIC_PREFIX", "home"),
            ("MDC_SMARTHUB_INFLUXDB_URL", "http://influx:8086"),
            ("MDC_SMARTHUB_INFLUXDB_BUCKET", "speedtest"),
            ("MDC_SMARTHUB_TIMEZONE", "Europe/Rome"),
            ("MDC_SMARTHUB_TELEGRAM_LOGLEVEL", "DEBUG"),
        ])
        .unwrap();
        assert_eq!(
            config.mqtt.broker.as_deref(),
            Some("mqtt://bot@broker.local:1883")
        );
        assert_eq!(config.mqtt.commands_topic(), "home/commands");
        assert_eq!(config.influx.url.as_deref(), Some("http://influx:8086"));
        assert_eq!(config.influx.bucket.as_deref(), Some("speedtest"));
        assert!(config.influx.org.is_none());
        assert_eq!(config.display_timezone, chrono_tz::Europe::Rome);
        assert_eq!(config.log_level.as_deref(), Some("DEBUG"));
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let config = load(&[
            ("MDC_SMARTHUB_TELEGRAM_API", "token"),
            ("MDC_SMARTHUB_TIMEZONE", "Mars/Olympus"),
        ])
        .unwrap();
        assert_eq!(config.display_timezone, Tz::UTC);
    }
}
