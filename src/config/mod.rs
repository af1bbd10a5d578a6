//! # Configuration Management Module
//!
//! All meshwatch settings live in one TOML file, organized into sections:
//!
//! - [`MqttConfig`] - Broker address, credentials, and the bus root namespace
//! - [`ResponderConfig`] - Trigger phrases and the reply-identity table
//! - [`StorageConfig`] - Node database path and save cadence
//! - [`LoggingConfig`] - Log level and optional log file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [mqtt]
//! host = "127.0.0.1"
//! port = 1883
//! root = "MESHY"
//! username = "mqtt"
//! password = "mqtt"
//!
//! [responder]
//! enabled = true
//! triggers = ["signal check", "anyone receiving??"]
//!
//! [responder.identities]
//! "!75e9a1cc" = "North Hill"
//!
//! [storage]
//! nodedb_path = "nodedb.yaml"
//! save_interval_secs = 5
//! ```
//!
//! ## Environment Integration
//!
//! The broker settings honor the same environment variables the original
//! deployment scripts used: `MQTT_HOST`, `MQTT_PORT`, `MQTT_ROOT`,
//! `MQTT_USER`, `MQTT_PASS`. Environment values override the file, which
//! overrides the built-in defaults.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::fs;

/// Broker connection and namespace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Root namespace of the gateway's topic tree, e.g. `MESHY` or `msh/EU_868`.
    pub root: String,
    /// Empty username disables authentication.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_client_id() -> String {
    "meshwatch".to_string()
}

/// Which node id outbound replies claim as their `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyFrom {
    /// The uplink station that heard the trigger transmits the reply as
    /// itself. This is what the gateway actually does with the frame.
    Uplink,
    /// Replies always claim this service's configured `node_id`.
    NodeId,
}

impl Default for ReplyFrom {
    fn default() -> Self {
        ReplyFrom::Uplink
    }
}

/// Auto-responder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// This service's own node id; used when `reply_from = "node-id"`.
    #[serde(default)]
    pub node_id: u32,
    #[serde(default)]
    pub reply_from: ReplyFrom,
    /// Phrases answered when a text message matches exactly
    /// (case-insensitive, surrounding whitespace ignored).
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Uplink `!hex` node id -> display name used in replies. Keys are
    /// case-sensitive; node ids are canonical lowercase hex.
    #[serde(default)]
    pub identities: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for ResponderConfig {
    fn default() -> Self {
        ResponderConfig {
            enabled: true,
            node_id: 0,
            reply_from: ReplyFrom::default(),
            triggers: Vec::new(),
            identities: HashMap::new(),
        }
    }
}

/// Node database location and save cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub nodedb_path: String,
    /// Seconds between save cycles, measured from the end of each cycle.
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
}

fn default_save_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file and apply environment overrides.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Create a default configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Layer the legacy `MQTT_*` environment variables over the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("MQTT_PORT") {
            match port.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => warn!("Ignoring non-numeric MQTT_PORT value {:?}", port),
            }
        }
        if let Ok(root) = std::env::var("MQTT_ROOT") {
            self.mqtt.root = root;
        }
        if let Ok(user) = std::env::var("MQTT_USER") {
            self.mqtt.username = user;
        }
        if let Ok(pass) = std::env::var("MQTT_PASS") {
            self.mqtt.password = pass;
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mqtt: MqttConfig {
                host: "127.0.0.1".to_string(),
                port: 1883,
                root: "MESHY".to_string(),
                username: "mqtt".to_string(),
                password: "mqtt".to_string(),
                client_id: default_client_id(),
            },
            responder: ResponderConfig::default(),
            storage: StorageConfig {
                nodedb_path: "nodedb.yaml".to_string(),
                save_interval_secs: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let toml_text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.mqtt.root, "MESHY");
        assert_eq!(parsed.storage.save_interval_secs, 5);
        assert_eq!(parsed.responder.reply_from, ReplyFrom::Uplink);
        assert!(parsed.responder.triggers.is_empty());
    }

    #[test]
    fn responder_section_is_optional() {
        let toml_text = r#"
            [mqtt]
            host = "broker.local"
            port = 1883
            root = "msh/EU_868"

            [storage]
            nodedb_path = "/var/lib/meshwatch/nodedb.yaml"

            [logging]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert!(config.responder.enabled);
        assert!(config.responder.identities.is_empty());
        assert_eq!(config.mqtt.username, "");
        assert_eq!(config.storage.save_interval_secs, 5);
    }

    #[test]
    fn reply_from_parses_kebab_case() {
        let toml_text = r#"
            [mqtt]
            host = "h"
            port = 1883
            root = "MESHY"

            [responder]
            node_id = 56525366
            reply_from = "node-id"
            triggers = ["signal check"]

            [storage]
            nodedb_path = "nodedb.yaml"

            [logging]
            level = "info"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.responder.reply_from, ReplyFrom::NodeId);
        assert_eq!(config.responder.node_id, 56525366);
    }
}
