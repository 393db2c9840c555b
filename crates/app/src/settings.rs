//! Service Configuration
//!
//! Built once at startup from the process environment (optionally seeded
//! from a `.env` file) and passed by value into the pipeline.

use alerting::{MqttSettings, DEFAULT_API_URL};
use ::config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use threshold_monitor::{BoundPair, DEFAULT_HIGH, DEFAULT_LOW};

/// Configuration errors; all are fatal
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required key is absent or empty
    #[error("{0} must be set")]
    Missing(&'static str),

    /// Key is present but unusable
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    /// Environment could not be read
    #[error("Cannot read configuration: {0}")]
    Source(#[from] ::config::ConfigError),
}

/// Delivery platform for alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SinkKind {
    #[default]
    Telegram,
    Mqtt,
}

impl FromStr for SinkKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Ok(SinkKind::Telegram),
            "mqtt" => Ok(SinkKind::Mqtt),
            _ => Err(()),
        }
    }
}

/// Where readings come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourceKind {
    /// OPC UA server at the configured endpoint
    #[default]
    OpcUa,
    /// In-process random feed; only for local runs
    Simulated,
}

impl FromStr for SourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opcua" | "opc-ua" => Ok(SourceKind::OpcUa),
            "simulated" => Ok(SourceKind::Simulated),
            _ => Err(()),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT`; anything but `json` means text
    pub fn from_settings(settings: &Config) -> Self {
        match optional(settings, "LOG_FORMAT") {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Settings tree over the process environment
pub fn load() -> Result<Config, ConfigError> {
    Ok(Config::builder()
        .add_source(Environment::default())
        .build()?)
}

/// Immutable service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Data source endpoint (`OPC_ENDPOINT`)
    pub endpoint: String,
    /// Monitored variable (`OPC_NODE`)
    pub node_id: String,
    /// Delivery credential (`TG_TOKEN`)
    pub token: String,
    /// Broadcast channel name without the `@` marker (`TG_CHANNEL`)
    pub channel: String,
    /// Acceptable range (`LIM_MIN`, `LIM_MAX`)
    pub bounds: BoundPair,
    /// Reading source (`OPC_SOURCE`)
    pub source: SourceKind,
    /// Delivery platform (`ALERT_SINK`)
    pub sink: SinkKind,
    /// Bot API root (`TG_API_URL`)
    pub telegram_api_url: String,
    /// Broker settings when `sink` is MQTT (`MQTT_*`)
    pub mqtt: MqttSettings,
}

impl AppConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_settings(&load()?)
    }

    /// Load from an already built settings tree (keys are lowercase)
    pub fn from_settings(settings: &Config) -> Result<Self, ConfigError> {
        let sink = match optional(settings, "ALERT_SINK") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "ALERT_SINK",
                value: raw,
            })?,
            None => SinkKind::default(),
        };
        let source = match optional(settings, "OPC_SOURCE") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "OPC_SOURCE",
                value: raw,
            })?,
            None => SourceKind::default(),
        };

        let defaults = MqttSettings::default();
        let mqtt = MqttSettings {
            host: optional(settings, "MQTT_HOST").unwrap_or(defaults.host),
            port: match optional(settings, "MQTT_PORT") {
                Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "MQTT_PORT",
                    value: raw,
                })?,
                None => defaults.port,
            },
            client_id: optional(settings, "MQTT_CLIENT_ID").unwrap_or(defaults.client_id),
            username: optional(settings, "MQTT_USERNAME"),
            topic_prefix: optional(settings, "MQTT_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
        };

        Ok(Self {
            endpoint: required(settings, "OPC_ENDPOINT")?,
            node_id: required(settings, "OPC_NODE")?,
            token: required(settings, "TG_TOKEN")?,
            channel: required(settings, "TG_CHANNEL")?,
            bounds: BoundPair::new(
                parse_bound(optional(settings, "LIM_MIN"), DEFAULT_LOW),
                parse_bound(optional(settings, "LIM_MAX"), DEFAULT_HIGH),
            ),
            source,
            sink,
            telegram_api_url: optional(settings, "TG_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            mqtt,
        })
    }
}

fn optional(settings: &Config, key: &str) -> Option<String> {
    settings
        .get_string(&key.to_ascii_lowercase())
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(settings: &Config, key: &'static str) -> Result<String, ConfigError> {
    optional(settings, key).ok_or(ConfigError::Missing(key))
}

/// Absent, unparsable or non-finite bounds fall back to the default
fn parse_bound(raw: Option<String>, default: f64) -> f64 {
    raw.and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Config {
        let mut builder = Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(key.to_ascii_lowercase(), *value).unwrap();
        }
        builder.build().unwrap()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("OPC_ENDPOINT", "opc.tcp://localhost:4840"),
        ("OPC_NODE", "ns=1;s=index"),
        ("TG_TOKEN", "123456:ABC"),
        ("TG_CHANNEL", "plant_alerts"),
    ];

    #[test]
    fn test_required_keys_and_defaults() {
        let config = AppConfig::from_settings(&settings(&REQUIRED)).unwrap();

        assert_eq!(config.endpoint, "opc.tcp://localhost:4840");
        assert_eq!(config.node_id, "ns=1;s=index");
        assert_eq!(config.channel, "plant_alerts");
        assert_eq!(config.bounds, BoundPair::new(-1024.0, 1024.0));
        assert_eq!(config.source, SourceKind::OpcUa);
        assert_eq!(config.sink, SinkKind::Telegram);
        assert_eq!(config.telegram_api_url, "https://api.telegram.org");
        assert_eq!(config.mqtt, MqttSettings::default());
    }

    #[test]
    fn test_simulated_source_is_opt_in() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("OPC_SOURCE", "Simulated"));
        let config = AppConfig::from_settings(&settings(&pairs)).unwrap();
        assert_eq!(config.source, SourceKind::Simulated);

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("OPC_SOURCE", "random"));
        assert!(matches!(
            AppConfig::from_settings(&settings(&pairs)),
            Err(ConfigError::InvalidValue { key: "OPC_SOURCE", .. })
        ));
    }

    #[test]
    fn test_log_format_from_settings() {
        assert_eq!(LogFormat::from_settings(&settings(&[])), LogFormat::Text);
        assert_eq!(LogFormat::from_settings(&settings(&[("LOG_FORMAT", " JSON ")])), LogFormat::Json);
        assert_eq!(LogFormat::from_settings(&settings(&[("LOG_FORMAT", "pretty")])), LogFormat::Text);
    }

    #[test]
    fn test_bounds_from_settings() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LIM_MIN", "-5.5"));
        pairs.push(("LIM_MAX", " 250 "));
        let config = AppConfig::from_settings(&settings(&pairs)).unwrap();
        assert_eq!(config.bounds, BoundPair::new(-5.5, 250.0));
    }

    #[test]
    fn test_unparsable_bounds_fall_back() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LIM_MIN", "low"));
        pairs.push(("LIM_MAX", "inf"));
        let config = AppConfig::from_settings(&settings(&pairs)).unwrap();
        assert_eq!(config.bounds, BoundPair::new(-1024.0, 1024.0));
    }

    #[test]
    fn test_inverted_bounds_are_kept() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LIM_MIN", "100"));
        pairs.push(("LIM_MAX", "0"));
        let config = AppConfig::from_settings(&settings(&pairs)).unwrap();
        assert_eq!(config.bounds, BoundPair::new(100.0, 0.0));
    }

    #[test]
    fn test_missing_required_key() {
        for missing in ["OPC_ENDPOINT", "OPC_NODE", "TG_TOKEN", "TG_CHANNEL"] {
            let pairs: Vec<_> = REQUIRED.iter().copied().filter(|(k, _)| *k != missing).collect();
            match AppConfig::from_settings(&settings(&pairs)) {
                Err(ConfigError::Missing(key)) => assert_eq!(key, missing),
                other => panic!("expected {} to be reported missing, got {:?}", missing, other),
            }
        }
    }

    #[test]
    fn test_blank_required_key_is_missing() {
        let mut pairs = REQUIRED.to_vec();
        pairs[3] = ("TG_CHANNEL", "   ");
        assert!(matches!(
            AppConfig::from_settings(&settings(&pairs)),
            Err(ConfigError::Missing("TG_CHANNEL"))
        ));
    }

    #[test]
    fn test_mqtt_sink_settings() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("ALERT_SINK", "MQTT"),
            ("MQTT_HOST", "broker.plant"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USERNAME", "line1"),
        ]);
        let config = AppConfig::from_settings(&settings(&pairs)).unwrap();

        assert_eq!(config.sink, SinkKind::Mqtt);
        assert_eq!(config.mqtt.host, "broker.plant");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("line1"));
        assert_eq!(config.mqtt.topic_prefix, "alerts");
    }

    #[test]
    fn test_invalid_sink_and_port() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("ALERT_SINK", "pager"));
        assert!(matches!(
            AppConfig::from_settings(&settings(&pairs)),
            Err(ConfigError::InvalidValue { key: "ALERT_SINK", .. })
        ));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MQTT_PORT", "70000"));
        assert!(matches!(
            AppConfig::from_settings(&settings(&pairs)),
            Err(ConfigError::InvalidValue { key: "MQTT_PORT", .. })
        ));
    }
}
