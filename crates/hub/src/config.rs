//! TOML settings file loading and validation for the hub: broker
//! connection, reconnect policy, web callback endpoint, and the local
//! time zone used for history bucketing and time replies.

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub web: WebSettings,
    #[serde(default)]
    pub hub: HubSettings,
}

#[derive(Debug, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Wildcard the hub subscribes to, e.g. "flat/#".
    pub topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_sec: u64,
    /// First reconnect delay, doubled after each failed attempt.
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_sec: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_sec: u64,
    /// Consecutive failures tolerated before bus ingestion gives up.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
}

#[derive(Debug, Deserialize)]
pub struct WebSettings {
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Base URL controllers use to reach the upload callback,
    /// e.g. "http://hub.local:8080".
    #[serde(default = "default_callback_base")]
    pub callback_base: String,
}

#[derive(Debug, Deserialize)]
pub struct HubSettings {
    /// IANA zone used for hourly history buckets and gettime replies.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    /// Directory uploaded provisioning files are saved under.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "fieldbus-hub".to_string()
}
fn default_keep_alive() -> u64 {
    30
}
fn default_reconnect_initial() -> u64 {
    1
}
fn default_reconnect_max() -> u64 {
    60
}
fn default_reconnect_attempts() -> u32 {
    12
}
fn default_web_port() -> u16 {
    8080
}
fn default_callback_base() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_time_zone() -> String {
    "Europe/Moscow".to_string()
}
fn default_data_dir() -> String {
    "devices".to_string()
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            callback_base: default_callback_base(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
            data_dir: default_data_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all settings. Reports every violation found, not just
    /// the first one.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.topic.trim().is_empty() {
            errors.push("mqtt.topic is empty".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if self.mqtt.reconnect_initial_sec == 0 {
            errors.push("mqtt.reconnect_initial_sec must be positive".to_string());
        }
        if self.mqtt.reconnect_max_sec < self.mqtt.reconnect_initial_sec {
            errors.push(format!(
                "mqtt.reconnect_max_sec ({}) is below mqtt.reconnect_initial_sec ({})",
                self.mqtt.reconnect_max_sec, self.mqtt.reconnect_initial_sec
            ));
        }
        if self.mqtt.reconnect_attempts == 0 {
            errors.push("mqtt.reconnect_attempts must be positive".to_string());
        }
        if self.web.callback_base.trim().is_empty() {
            errors.push("web.callback_base is empty".to_string());
        }
        if self.hub.time_zone.parse::<Tz>().is_err() {
            errors.push(format!(
                "hub.time_zone '{}' is not a known IANA zone",
                self.hub.time_zone
            ));
        }
        if self.hub.data_dir.trim().is_empty() {
            errors.push("hub.data_dir is empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Parsed time zone. Only call after `validate`.
    pub fn time_zone(&self) -> Tz {
        self.hub
            .time_zone
            .parse()
            .unwrap_or(chrono_tz::Europe::Moscow)
    }

    /// Full URL of the upload callback, published to controllers in
    /// sendFile commands.
    pub fn upload_url(&self) -> String {
        format!(
            "{}/mqtt/upload-file",
            self.web.callback_base.trim_end_matches('/')
        )
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file.
pub fn load(path: &str) -> Result<Settings> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read settings: {path}"))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("failed to parse settings: {path}"))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings: {path}"))?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================
