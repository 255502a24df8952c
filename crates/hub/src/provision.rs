//! Two-phase provisioning handshake.
//!
//! Phase 1 (bus): a `.../startup` event upserts the controller row and
//! asks it to upload each provisioning file, with a fresh one-time
//! secret per file.
//!
//! Phase 2 (HTTP): the upload callback validates (topic, secret_key,
//! filename) against an outstanding ticket, applies the file, and
//! consumes the ticket so replays fail.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::conn::BusHandle;
use crate::db::{ControllerPatch, Db, NewDevice, TriggerSpec};
use crate::mqtt::{self, StartupMsg};

/// Inventory of logical devices attached to a controller.
pub(crate) const DEVICE_INVENTORY_FILE: &str = "devices.json";
/// Per-controller bus credential file.
pub(crate) const BROKER_CONFIG_FILE: &str = "mqtt.json";

const PROVISION_FILES: [&str; 2] = [DEVICE_INVENTORY_FILE, BROKER_CONFIG_FILE];

fn fresh_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Phase 1: startup event -> sendFile commands
// ---------------------------------------------------------------------------

pub(crate) async fn handle_startup(
    db: &Db,
    bus: &BusHandle,
    settings: &Settings,
    topic: &str,
    payload: &[u8],
) -> Result<()> {
    let msg: StartupMsg =
        serde_json::from_slice(payload).context("undecodable startup payload")?;
    let root = msg
        .topic
        .clone()
        .unwrap_or_else(|| mqtt::root_topic(topic));

    db.upsert_controller(
        &root,
        ControllerPatch {
            ip: Some(msg.ip.clone()),
            last_seen: Some(Utc::now()),
            ..Default::default()
        },
    )
    .await?;
    info!(topic = %root, ip = %msg.ip, online = ?msg.online, "controller startup");

    let url = settings.upload_url();
    let command_topic = format!("{root}/set/sendFile");

    for filename in PROVISION_FILES {
        let secret = fresh_secret();
        let command = serde_json::json!({
            "filename": filename,
            "url": url,
            "secret_key": secret,
        });
        let body = serde_json::to_vec(&command).context("sendFile command serialization")?;

        // One file's publish failure must not block the other; only a
        // delivered request gets an outstanding ticket.
        match bus.publish(&command_topic, body).await {
            Ok(()) => {
                // The replacement supersedes any ticket still
                // outstanding from an earlier startup.
                db.delete_file_requests_for(&root, filename).await?;
                db.insert_file_request(&root, &secret, filename).await?;
                info!(topic = %command_topic, filename, "file requested");
            }
            Err(e) => {
                error!(topic = %command_topic, filename, error = %e, "sendFile publish failed");
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Phase 2: HTTP callback -> apply file, consume ticket
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub(crate) enum UploadError {
    #[error("invalid topic or secret_key")]
    Unauthorized,
    #[error("file does not match requested filename: expected '{expected}', got '{got}'")]
    FilenameMismatch { expected: String, got: String },
    #[error("malformed provisioning file: {0}")]
    BadFile(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Validate and apply an uploaded provisioning file. The ticket is
/// consumed on success; re-presenting the same secret key fails
/// closed.
pub(crate) async fn consume_upload(
    db: &Db,
    topic: &str,
    secret_key: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<String, UploadError> {
    let Some(request) = db.file_request_by_topic_and_key(topic, secret_key).await? else {
        return Err(UploadError::Unauthorized);
    };

    if filename != request.filename {
        return Err(UploadError::FilenameMismatch {
            expected: request.filename,
            got: filename.to_string(),
        });
    }

    match filename {
        BROKER_CONFIG_FILE => {
            let entries: HashMap<String, BrokerEntry> = serde_json::from_slice(bytes)
                .map_err(|e| UploadError::BadFile(e.to_string()))?;
            match active_broker_config(entries) {
                Some(cfg) => {
                    db.upsert_controller(
                        topic,
                        ControllerPatch {
                            broker_user: cfg.user,
                            period: cfg.period,
                            ..Default::default()
                        },
                    )
                    .await?;
                }
                // Absence of an active entry is a valid result.
                None => info!(topic, "broker config carries no active entry"),
            }
        }
        DEVICE_INVENTORY_FILE => {
            let inventory: HashMap<String, Value> = serde_json::from_slice(bytes)
                .map_err(|e| UploadError::BadFile(e.to_string()))?;
            let controller = db
                .controller_by_topic(topic)
                .await?
                .context("no controller for validated file request")?;
            apply_inventory(db, controller.id, inventory).await?;
        }
        other => {
            warn!(filename = other, "validated request for an unexpected filename");
        }
    }

    db.delete_file_request(request.id).await?;
    Ok(format!("{filename} applied for {topic}"))
}

// ---------------------------------------------------------------------------
// Bus-credential file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct BrokerEntry {
    #[serde(rename = "Active", default)]
    pub active: Option<i64>,
    #[serde(rename = "User")]
    pub user: Option<String>,
    #[serde(rename = "Period")]
    pub period: Option<i64>,
}

/// Exactly the entry with `Active == 1` is the operative
/// configuration; no such entry is a valid "no active config".
pub(crate) fn active_broker_config(entries: HashMap<String, BrokerEntry>) -> Option<BrokerEntry> {
    entries.into_values().find(|e| e.active == Some(1))
}

// ---------------------------------------------------------------------------
// Device-inventory file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeviceDescriptor {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    pin: Option<String>,
    description: Option<String>,
    #[serde(default)]
    sensors: Vec<SensorEntry>,
    #[serde(default)]
    triggers: Vec<TriggerEntry>,
}

/// Sub-probe declarations come either as plain names or as objects
/// with their own description.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SensorEntry {
    Named {
        name: String,
        description: Option<String>,
    },
    Bare(String),
}

#[derive(Debug, Deserialize)]
struct TriggerEntry {
    device: String,
    parameter: String,
    condition: String,
    threshold: f64,
    action: String,
    #[serde(default)]
    active: Option<Value>,
}

fn trigger_active(raw: &Option<Value>) -> bool {
    match raw {
        None => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(_) => true,
    }
}

/// Merge a device inventory into the controller's device rows. One bad
/// descriptor is logged and skipped; siblings still apply. Existing
/// rows are left untouched.
pub(crate) async fn apply_inventory(
    db: &Db,
    controller_id: i64,
    inventory: HashMap<String, Value>,
) -> Result<()> {
    for (device_key, raw) in inventory {
        let descriptor: DeviceDescriptor = match serde_json::from_value(raw) {
            Ok(d) => d,
            Err(e) => {
                warn!(device_key = %device_key, error = %e, "skipping malformed device descriptor");
                continue;
            }
        };

        let base = NewDevice {
            name: descriptor.name.clone(),
            kind: descriptor.kind.clone(),
            extra_name: String::new(),
            pin: descriptor.pin.clone(),
            description: descriptor.description.clone(),
            device_key: device_key.clone(),
        };

        let mut devices = Vec::new();
        match descriptor.kind.as_str() {
            // One row per declared probe.
            "DS18B20" if !descriptor.sensors.is_empty() => {
                for sensor in &descriptor.sensors {
                    let (extra_name, description) = match sensor {
                        SensorEntry::Named { name, description } => {
                            (name.clone(), description.clone().or(base.description.clone()))
                        }
                        SensorEntry::Bare(name) => (name.clone(), base.description.clone()),
                    };
                    let row = db
                        .get_or_create_device(
                            controller_id,
                            &NewDevice {
                                extra_name,
                                description,
                                ..base.clone()
                            },
                        )
                        .await?;
                    devices.push(row);
                }
            }
            // Combo sensor: exactly two fixed sub-channels.
            "DHT" => {
                for extra_name in ["temperature", "humidity"] {
                    let row = db
                        .get_or_create_device(
                            controller_id,
                            &NewDevice {
                                extra_name: extra_name.to_string(),
                                ..base.clone()
                            },
                        )
                        .await?;
                    devices.push(row);
                }
            }
            _ => {
                let row = db.get_or_create_device(controller_id, &base).await?;
                devices.push(row);
            }
        }

        for device in &devices {
            for trigger in &descriptor.triggers {
                db.ensure_trigger(
                    device.id,
                    &TriggerSpec {
                        trigger_device: trigger.device.clone(),
                        parameter: trigger.parameter.clone(),
                        condition: trigger.condition.clone(),
                        threshold: trigger.threshold,
                        action: trigger.action.clone(),
                        active: trigger_active(&trigger.active),
                    },
                )
                .await?;
            }
        }

        info!(
            device_key = %device_key,
            name = %descriptor.name,
            kind = %descriptor.kind,
            rows = devices.len(),
            "inventory entry applied"
        );
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
