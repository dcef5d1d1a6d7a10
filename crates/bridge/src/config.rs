// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration loading and validation.
//!
//! The daemon takes exactly one required argument: the path to a JSON
//! configuration file. Loading is two-phase — deserialize into [`RawConfig`]
//! (everything optional, documented defaults applied), then [`Config::validate`]
//! into the runtime [`Config`], returning a [`crate::error::BridgeError`] of
//! kind [`crate::error::ErrorKind::Config`] for anything wrong before any
//! socket opens.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// CLI entry point, mirroring the one-binary-one-job convention used
/// throughout this workspace's daemons.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "klf200d", about = "Bridge daemon between a window/blind gateway and an MQTT bus")]
pub struct Cli {
    /// Path to the JSON configuration file.
    pub config_path: PathBuf,

    /// Load, validate, and print the effective configuration (secrets
    /// redacted), then exit without connecting to anything.
    #[arg(long)]
    pub print_config: bool,
}

// -- Raw (on-disk) shape, all-optional with documented defaults -------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    klf200: RawKlf200,
    #[serde(default)]
    mqtt: RawMqtt,
    #[serde(default)]
    polling: RawPolling,
    #[serde(default)]
    features: RawFeatures,
    #[serde(default)]
    logging: RawLogging,
    #[serde(default)]
    data_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RawKlf200 {
    host: Option<String>,
    password: Option<String>,
    port: Option<u16>,
    #[serde(rename = "tlsFingerprint")]
    tls_fingerprint: Option<String>,
    #[serde(rename = "connectionTimeout")]
    connection_timeout: Option<u64>,
    #[serde(rename = "keepaliveInterval")]
    keepalive_interval: Option<u64>,
    #[serde(rename = "reconnectBaseDelay")]
    reconnect_base_delay: Option<u64>,
    #[serde(rename = "reconnectMaxDelay")]
    reconnect_max_delay: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawMqtt {
    #[serde(rename = "topicPrefix")]
    topic_prefix: Option<String>,
    retain: Option<bool>,
    qos: Option<u8>,
}

impl Default for RawMqtt {
    fn default() -> Self {
        Self { topic_prefix: None, retain: None, qos: None }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RawPolling {
    enabled: Option<bool>,
    interval: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RawFeatures {
    #[serde(rename = "autoDiscovery")]
    auto_discovery: Option<bool>,
    #[serde(rename = "publishOnStartup")]
    publish_on_startup: Option<bool>,
    #[serde(rename = "homeAssistantDiscovery")]
    home_assistant_discovery: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RawLogging {
    level: Option<String>,
    #[serde(rename = "maxFiles")]
    max_files: Option<usize>,
    #[serde(rename = "maxSize")]
    max_size: Option<u64>,
}

/// Optional external operator file overriding broker address/credentials/TLS.
/// Read once at startup from `KLF200_BRIDGE_BROKER_FILE`, falling back to
/// `/etc/klf200-bridge/broker.json`; if neither exists the bridge defaults
/// to `localhost:1883` with no credentials and no TLS.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrokerFile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<bool>,
}

fn broker_file_path() -> PathBuf {
    std::env::var("KLF200_BRIDGE_BROKER_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/klf200-bridge/broker.json"))
}

fn load_broker_file() -> BrokerFile {
    let path = broker_file_path();
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), err = %e, "ignoring malformed broker file");
            BrokerFile::default()
        }),
        Err(_) => BrokerFile::default(),
    }
}

// -- Validated runtime config -------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Klf200Config {
    pub host: String,
    /// Redacted in `--print-config` output.
    pub password: String,
    pub port: u16,
    pub tls_fingerprint: Option<String>,
    pub connection_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    /// Redacted in `--print-config` output.
    pub password: Option<String>,
    pub tls: bool,
    pub topic_prefix: String,
    pub retain: bool,
    pub qos: u8,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FeaturesConfig {
    pub auto_discovery: bool,
    pub publish_on_startup: bool,
    /// Carried through for forward compatibility; unused by the core.
    pub home_assistant_discovery: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub max_files: usize,
    pub max_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub klf200: Klf200Config,
    pub mqtt: MqttConfig,
    pub polling: PollingConfig,
    pub features: FeaturesConfig,
    pub logging: LoggingConfig,
    pub data_dir: PathBuf,
}

impl Config {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let raw: RawConfig = serde_json::from_str(&contents)
            .map_err(|e| BridgeError::config(format!("invalid config JSON: {e}")))?;
        Self::validate(raw, load_broker_file())
    }

    fn validate(raw: RawConfig, broker: BrokerFile) -> Result<Self, BridgeError> {
        let host = raw
            .klf200
            .host
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::config("klf200.host is required"))?;
        let password = raw
            .klf200
            .password
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::config("klf200.password is required"))?;
        let port = raw.klf200.port.unwrap_or(51200);
        if !(1..=65535).contains(&port) {
            return Err(BridgeError::config(format!("klf200.port {port} out of range [1,65535]")));
        }

        let connection_timeout = Duration::from_millis(raw.klf200.connection_timeout.unwrap_or(10_000));
        let keepalive_interval = Duration::from_millis(raw.klf200.keepalive_interval.unwrap_or(600_000));
        if keepalive_interval < Duration::from_secs(60) {
            return Err(BridgeError::config(
                "klf200.keepaliveInterval must be at least 60000 ms",
            ));
        }
        let reconnect_base_delay = Duration::from_millis(raw.klf200.reconnect_base_delay.unwrap_or(1_000));
        let reconnect_max_delay = Duration::from_millis(raw.klf200.reconnect_max_delay.unwrap_or(60_000));
        if reconnect_base_delay > reconnect_max_delay {
            return Err(BridgeError::config(
                "klf200.reconnectBaseDelay must not exceed klf200.reconnectMaxDelay",
            ));
        }

        let qos = raw.mqtt.qos.unwrap_or(1);
        if qos > 2 {
            return Err(BridgeError::config(format!("mqtt.qos {qos} must be 0, 1, or 2")));
        }

        // Broker address/credentials/TLS: operator file overrides mqtt-section
        // defaults, falling back to localhost:1883 with no credentials/TLS.
        let mqtt_host = broker.host.unwrap_or_else(|| "localhost".to_owned());
        let mqtt_port = broker.port.unwrap_or(1883);
        let mqtt_tls = broker.tls.unwrap_or(false);

        let port_val: u16 = port;
        let klf200 = Klf200Config {
            host,
            password,
            port: port_val,
            tls_fingerprint: raw.klf200.tls_fingerprint,
            connection_timeout,
            keepalive_interval,
            reconnect_base_delay,
            reconnect_max_delay,
        };

        let mqtt = MqttConfig {
            host: mqtt_host,
            port: mqtt_port,
            username: broker.username,
            password: broker.password,
            tls: mqtt_tls,
            topic_prefix: raw.mqtt.topic_prefix.unwrap_or_else(|| "klf200".to_owned()),
            retain: raw.mqtt.retain.unwrap_or(true),
            qos,
        };

        let polling = PollingConfig {
            enabled: raw.polling.enabled.unwrap_or(false),
            interval: Duration::from_millis(raw.polling.interval.unwrap_or(10_000)),
        };

        let features = FeaturesConfig {
            auto_discovery: raw.features.auto_discovery.unwrap_or(true),
            publish_on_startup: raw.features.publish_on_startup.unwrap_or(true),
            home_assistant_discovery: raw.features.home_assistant_discovery.unwrap_or(false),
        };

        let logging = LoggingConfig {
            level: raw.logging.level.unwrap_or_else(|| "info".to_owned()),
            max_files: raw.logging.max_files.unwrap_or(7),
            max_size: raw.logging.max_size.unwrap_or(10 * 1024 * 1024),
        };

        let data_dir = raw
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("klf200-bridge"));

        Ok(Self { klf200, mqtt, polling, features, logging, data_dir })
    }

    /// Path to the on-disk registry snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }

    /// A redacted copy suitable for `--print-config` output.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(klf200) = value.get_mut("klf200").and_then(|v| v.as_object_mut()) {
            klf200.insert("password".to_owned(), serde_json::Value::String("***".to_owned()));
        }
        if let Some(mqtt) = value.get_mut("mqtt").and_then(|v| v.as_object_mut()) {
            if mqtt.get("password").map(|v| !v.is_null()).unwrap_or(false) {
                mqtt.insert("password".to_owned(), serde_json::Value::String("***".to_owned()));
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_raw() -> RawConfig {
        RawConfig {
            klf200: RawKlf200 {
                host: Some("10.0.0.5".to_owned()),
                password: Some("secret".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn defaults_apply_when_sections_absent() {
        let cfg = Config::validate(minimal_raw(), BrokerFile::default()).unwrap();
        assert_eq!(cfg.klf200.port, 51200);
        assert_eq!(cfg.mqtt.topic_prefix, "klf200");
        assert!(cfg.mqtt.retain);
        assert_eq!(cfg.mqtt.qos, 1);
        assert!(!cfg.polling.enabled);
    }

    #[test]
    fn missing_host_is_config_error() {
        let mut raw = minimal_raw();
        raw.klf200.host = None;
        let err = Config::validate(raw, BrokerFile::default()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Config);
    }

    #[test]
    fn missing_password_is_config_error() {
        let mut raw = minimal_raw();
        raw.klf200.password = None;
        assert!(Config::validate(raw, BrokerFile::default()).is_err());
    }

    #[test]
    fn port_out_of_range_is_config_error() {
        let mut raw = minimal_raw();
        raw.klf200.port = Some(0);
        assert!(Config::validate(raw, BrokerFile::default()).is_err());
    }

    #[test]
    fn qos_out_of_range_is_config_error() {
        let mut raw = minimal_raw();
        raw.mqtt.qos = Some(3);
        assert!(Config::validate(raw, BrokerFile::default()).is_err());
    }

    #[test]
    fn keepalive_below_minimum_is_config_error() {
        let mut raw = minimal_raw();
        raw.klf200.keepalive_interval = Some(1_000);
        assert!(Config::validate(raw, BrokerFile::default()).is_err());
    }

    #[test]
    fn reconnect_base_above_max_is_config_error() {
        let mut raw = minimal_raw();
        raw.klf200.reconnect_base_delay = Some(120_000);
        raw.klf200.reconnect_max_delay = Some(60_000);
        assert!(Config::validate(raw, BrokerFile::default()).is_err());
    }

    #[test]
    fn broker_file_overrides_default_broker_address() {
        let broker =
            BrokerFile { host: Some("mqtt.example.com".to_owned()), port: Some(8883), tls: Some(true), ..Default::default() };
        let cfg = Config::validate(minimal_raw(), broker).unwrap();
        assert_eq!(cfg.mqtt.host, "mqtt.example.com");
        assert_eq!(cfg.mqtt.port, 8883);
        assert!(cfg.mqtt.tls);
    }

    #[test]
    fn no_broker_file_defaults_to_localhost() {
        let cfg = Config::validate(minimal_raw(), BrokerFile::default()).unwrap();
        assert_eq!(cfg.mqtt.host, "localhost");
        assert_eq!(cfg.mqtt.port, 1883);
        assert!(!cfg.mqtt.tls);
    }

    #[test]
    fn redacted_hides_passwords() {
        let cfg = Config::validate(minimal_raw(), BrokerFile::default()).unwrap();
        let redacted = cfg.redacted();
        assert_eq!(redacted["klf200"]["password"], "***");
    }
}
