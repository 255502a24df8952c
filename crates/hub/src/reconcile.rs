//! Normalizes free-form telemetry objects into per-device state rows.
//!
//! One message carries one JSON object keyed by device name. Each key
//! is an independent unit of work: a name that resolves to nothing, or
//! a value of the wrong shape, is skipped with a logged reason while
//! sibling keys still apply.

use anyhow::Result;
use chrono_tz::Tz;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::db::{Controller, Db};
use crate::history;
use crate::mqtt;

// ---------------------------------------------------------------------------
// Device families
// ---------------------------------------------------------------------------

/// Closed set of device families the reconciler understands. Each
/// family knows how to split a telemetry value into normalized
/// per-channel updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceKind {
    Relay,
    Buzzer,
    Rfid,
    /// Multi-probe temperature bus; one channel per declared probe.
    Ds18b20,
    /// Temperature/humidity combo sensor; exactly two channels.
    Dht,
    /// Gas sensor family (MQ-2, MQ-135, ...); raw + ppm channels.
    MqGas,
    Unknown(String),
}

/// One normalized update: which sub-channel row it lands on and the
/// scalar value (booleans as 0/1).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Channel {
    pub extra_name: String,
    pub value: f64,
}

fn scalar(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn field(value: &Value, name: &str) -> Result<f64, String> {
    value
        .get(name)
        .and_then(scalar)
        .ok_or_else(|| format!("missing numeric field '{name}'"))
}

impl DeviceKind {
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "Relay" => Self::Relay,
            "Buzzer" => Self::Buzzer,
            "RFID" => Self::Rfid,
            "DS18B20" => Self::Ds18b20,
            "DHT" => Self::Dht,
            _ if s.starts_with("MQ") => Self::MqGas,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Split a telemetry value into channel updates, or explain why it
    /// does not fit this family.
    pub(crate) fn channels(&self, value: &Value) -> Result<Vec<Channel>, String> {
        match self {
            Self::Relay => {
                let on = value.as_str() == Some("on");
                Ok(vec![Channel {
                    extra_name: String::new(),
                    value: if on { 1.0 } else { 0.0 },
                }])
            }
            Self::Buzzer | Self::Rfid => {
                let v = scalar(value).ok_or_else(|| format!("expected a scalar, got {value}"))?;
                Ok(vec![Channel {
                    extra_name: String::new(),
                    value: v,
                }])
            }
            Self::Ds18b20 => {
                let probes = value
                    .as_object()
                    .ok_or_else(|| format!("expected probe map, got {value}"))?;
                probes
                    .iter()
                    .map(|(probe, reading)| {
                        scalar(reading)
                            .map(|v| Channel {
                                extra_name: probe.clone(),
                                value: v,
                            })
                            .ok_or_else(|| format!("probe '{probe}' is not numeric: {reading}"))
                    })
                    .collect()
            }
            Self::Dht => Ok(vec![
                Channel {
                    extra_name: "temperature".to_string(),
                    value: field(value, "temperature")?,
                },
                Channel {
                    extra_name: "humidity".to_string(),
                    value: field(value, "humidity")?,
                },
            ]),
            Self::MqGas => Ok(vec![
                Channel {
                    extra_name: "gas_raw".to_string(),
                    value: field(value, "gas_raw")?,
                },
                Channel {
                    extra_name: "gas_ppm".to_string(),
                    value: field(value, "gas_ppm")?,
                },
            ]),
            Self::Unknown(name) => Err(format!("unknown device type '{name}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-key outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) enum DeviceOutcome {
    Updated { device: String, channels: usize },
    Skipped { device: String, reason: String },
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Resolve the controller for a message topic and apply the telemetry
/// object. A topic that resolves to no controller is logged and
/// dropped; it never raises past the dispatcher.
pub(crate) async fn handle(
    db: &Db,
    tz: Tz,
    topic: &str,
    payload: serde_json::Map<String, Value>,
) -> Result<()> {
    let root = mqtt::root_topic(topic);
    let Some(controller) = db.controller_by_topic(&root).await? else {
        error!(topic = %root, "controller not found for telemetry topic");
        return Ok(());
    };

    let outcomes = apply_telemetry(db, tz, &controller, &payload).await?;
    for outcome in &outcomes {
        match outcome {
            DeviceOutcome::Updated { device, channels } => {
                debug!(topic = %root, device = %device, channels, "state updated");
            }
            DeviceOutcome::Skipped { device, reason } => {
                error!(topic = %root, device = %device, %reason, "telemetry key skipped");
            }
        }
    }
    Ok(())
}

/// Apply one decoded telemetry object for a known controller,
/// returning a per-device outcome list. Persistence errors propagate;
/// malformed units of work are collected as `Skipped`.
pub(crate) async fn apply_telemetry(
    db: &Db,
    tz: Tz,
    controller: &Controller,
    payload: &serde_json::Map<String, Value>,
) -> Result<Vec<DeviceOutcome>> {
    let reported_unix = payload.get("time").and_then(Value::as_i64);
    let mut outcomes = Vec::new();

    for (name, value) in payload {
        if name == "time" {
            continue;
        }

        let Some(kind_str) = db.device_type_for(controller.id, name).await? else {
            outcomes.push(DeviceOutcome::Skipped {
                device: name.clone(),
                reason: "no such device on this controller".to_string(),
            });
            continue;
        };

        let channels = match DeviceKind::parse(&kind_str).channels(value) {
            Ok(channels) => channels,
            Err(reason) => {
                outcomes.push(DeviceOutcome::Skipped {
                    device: name.clone(),
                    reason,
                });
                continue;
            }
        };

        let mut updated = 0;
        for channel in channels {
            let Some(device) = db
                .device_by_name(controller.id, name, &channel.extra_name)
                .await?
            else {
                warn!(
                    device = %name,
                    extra_name = %channel.extra_name,
                    "channel row not provisioned, skipping"
                );
                continue;
            };

            db.upsert_device_state(device.id, channel.value).await?;
            updated += 1;

            // Rollup is best-effort; it must not fail the state write.
            if let Err(e) = history::record(db, tz, device.id, channel.value, reported_unix).await {
                warn!(device_id = device.id, error = %e, "history rollup failed");
            }
        }

        if updated == 0 {
            outcomes.push(DeviceOutcome::Skipped {
                device: name.clone(),
                reason: "no provisioned channel rows".to_string(),
            });
        } else {
            outcomes.push(DeviceOutcome::Updated {
                device: name.clone(),
                channels: updated,
            });
        }
    }

    Ok(outcomes)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ControllerPatch, NewDevice};
    use chrono_tz::Europe::Moscow;
    use serde_json::json;

    // -- DeviceKind::parse --------------------------------------------------

    #[test]
    fn parse_known_types() {
        assert_eq!(DeviceKind::parse("Relay"), DeviceKind::Relay);
        assert_eq!(DeviceKind::parse("DS18B20"), DeviceKind::Ds18b20);
        assert_eq!(DeviceKind::parse("DHT"), DeviceKind::Dht);
        assert_eq!(DeviceKind::parse("RFID"), DeviceKind::Rfid);
    }

    #[test]
    fn mq_prefix_is_gas_family() {
        assert_eq!(DeviceKind::parse("MQ2"), DeviceKind::MqGas);
        assert_eq!(DeviceKind::parse("MQ135"), DeviceKind::MqGas);
    }

    #[test]
    fn unrecognized_type_is_unknown() {
        assert_eq!(
            DeviceKind::parse("Servo"),
            DeviceKind::Unknown("Servo".to_string())
        );
    }

    // -- Channel extraction -------------------------------------------------

    #[test]
    fn relay_on_normalizes_to_one() {
        let ch = DeviceKind::Relay.channels(&json!("on")).unwrap();
        assert_eq!(ch, vec![Channel { extra_name: String::new(), value: 1.0 }]);
    }

    #[test]
    fn relay_anything_else_normalizes_to_zero() {
        for v in [json!("off"), json!("ON"), json!(1), json!(null)] {
            let ch = DeviceKind::Relay.channels(&v).unwrap();
            assert_eq!(ch[0].value, 0.0, "payload {v}");
        }
    }

    #[test]
    fn ds18b20_yields_one_channel_per_probe() {
        let mut ch = DeviceKind::Ds18b20
            .channels(&json!({"Bedroom": 26.5625, "Passage": 25.0}))
            .unwrap();
        ch.sort_by(|a, b| a.extra_name.cmp(&b.extra_name));
        assert_eq!(ch.len(), 2);
        assert_eq!(ch[0].extra_name, "Bedroom");
        assert_eq!(ch[0].value, 26.5625);
        assert_eq!(ch[1].extra_name, "Passage");
    }

    #[test]
    fn ds18b20_non_numeric_probe_rejected() {
        assert!(DeviceKind::Ds18b20
            .channels(&json!({"Bedroom": "warm"}))
            .is_err());
        assert!(DeviceKind::Ds18b20.channels(&json!(26.5)).is_err());
    }

    #[test]
    fn dht_splits_temperature_and_humidity() {
        let ch = DeviceKind::Dht
            .channels(&json!({"temperature": 27.1, "humidity": 37.8}))
            .unwrap();
        assert_eq!(ch[0].extra_name, "temperature");
        assert_eq!(ch[0].value, 27.1);
        assert_eq!(ch[1].extra_name, "humidity");
        assert_eq!(ch[1].value, 37.8);
    }

    #[test]
    fn dht_missing_field_rejected() {
        let err = DeviceKind::Dht
            .channels(&json!({"temperature": 27.1}))
            .unwrap_err();
        assert!(err.contains("humidity"), "{err}");
    }

    #[test]
    fn gas_sensor_splits_raw_and_ppm() {
        let ch = DeviceKind::MqGas
            .channels(&json!({"gas_raw": 58, "gas_ppm": 6.72}))
            .unwrap();
        assert_eq!(ch[0].extra_name, "gas_raw");
        assert_eq!(ch[0].value, 58.0);
        assert_eq!(ch[1].extra_name, "gas_ppm");
        assert_eq!(ch[1].value, 6.72);
    }

    #[test]
    fn unknown_kind_never_yields_channels() {
        assert!(DeviceKind::Unknown("Servo".into())
            .channels(&json!(1))
            .is_err());
    }

    // -- apply_telemetry against in-memory sqlite ---------------------------

    async fn seeded_db() -> (Db, Controller) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let ctrl = db
            .upsert_controller("flat/room/ctrl", ControllerPatch::default())
            .await
            .unwrap();

        let device = |name: &str, kind: &str, extra: &str| NewDevice {
            name: name.to_string(),
            kind: kind.to_string(),
            extra_name: extra.to_string(),
            pin: None,
            description: None,
            device_key: String::new(),
        };

        db.get_or_create_device(ctrl.id, &device("Lamp", "Relay", ""))
            .await
            .unwrap();
        db.get_or_create_device(ctrl.id, &device("RoomClimate", "DHT", "temperature"))
            .await
            .unwrap();
        db.get_or_create_device(ctrl.id, &device("RoomClimate", "DHT", "humidity"))
            .await
            .unwrap();
        db.get_or_create_device(ctrl.id, &device("FloorSensors", "DS18B20", "Bedroom"))
            .await
            .unwrap();
        db.get_or_create_device(ctrl.id, &device("FloorSensors", "DS18B20", "Passage"))
            .await
            .unwrap();

        (db, ctrl)
    }

    async fn state_of(db: &Db, ctrl: &Controller, name: &str, extra: &str) -> f64 {
        let dev = db
            .device_by_name(ctrl.id, name, extra)
            .await
            .unwrap()
            .unwrap();
        db.device_state(dev.id).await.unwrap().unwrap().value
    }

    #[tokio::test]
    async fn relay_telemetry_normalized_to_binary() {
        let (db, ctrl) = seeded_db().await;

        let payload = json!({"Lamp": "on"});
        apply_telemetry(&db, Moscow, &ctrl, payload.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(state_of(&db, &ctrl, "Lamp", "").await, 1.0);

        let payload = json!({"Lamp": "off"});
        apply_telemetry(&db, Moscow, &ctrl, payload.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(state_of(&db, &ctrl, "Lamp", "").await, 0.0);
    }

    #[tokio::test]
    async fn combo_sensor_updates_two_rows() {
        let (db, ctrl) = seeded_db().await;

        let payload = json!({"RoomClimate": {"temperature": 27.1, "humidity": 37.8}});
        apply_telemetry(&db, Moscow, &ctrl, payload.as_object().unwrap())
            .await
            .unwrap();

        assert_eq!(state_of(&db, &ctrl, "RoomClimate", "temperature").await, 27.1);
        assert_eq!(state_of(&db, &ctrl, "RoomClimate", "humidity").await, 37.8);
    }

    #[tokio::test]
    async fn multi_probe_updates_each_probe_row() {
        let (db, ctrl) = seeded_db().await;

        let payload = json!({"FloorSensors": {"Bedroom": 26.5625, "Passage": 25.5}});
        apply_telemetry(&db, Moscow, &ctrl, payload.as_object().unwrap())
            .await
            .unwrap();

        assert_eq!(state_of(&db, &ctrl, "FloorSensors", "Bedroom").await, 26.5625);
        assert_eq!(state_of(&db, &ctrl, "FloorSensors", "Passage").await, 25.5);
    }

    #[tokio::test]
    async fn bad_key_does_not_abort_siblings() {
        let (db, ctrl) = seeded_db().await;

        let payload = json!({
            "Ghost": "on",
            "Lamp": "on",
            "time": 1743968248,
        });
        let outcomes = apply_telemetry(&db, Moscow, &ctrl, payload.as_object().unwrap())
            .await
            .unwrap();

        assert!(outcomes.iter().any(|o| matches!(
            o,
            DeviceOutcome::Skipped { device, .. } if device == "Ghost"
        )));
        assert!(outcomes.iter().any(|o| matches!(
            o,
            DeviceOutcome::Updated { device, .. } if device == "Lamp"
        )));
        assert_eq!(state_of(&db, &ctrl, "Lamp", "").await, 1.0);
        // "time" is never treated as a device
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn key_with_only_unprovisioned_channels_is_skipped() {
        let (db, ctrl) = seeded_db().await;

        // a probe name no inventory row exists for
        let payload = json!({"FloorSensors": {"Kitchen": 21.0}});
        let outcomes = apply_telemetry(&db, Moscow, &ctrl, payload.as_object().unwrap())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(
            matches!(
                &outcomes[0],
                DeviceOutcome::Skipped { device, .. } if device == "FloorSensors"
            ),
            "zero written channels must not count as an update: {outcomes:?}"
        );
    }

    #[tokio::test]
    async fn successful_update_writes_history_bucket() {
        let (db, ctrl) = seeded_db().await;

        let payload = json!({"RoomClimate": {"temperature": 27.1, "humidity": 37.8}});
        apply_telemetry(&db, Moscow, &ctrl, payload.as_object().unwrap())
            .await
            .unwrap();

        let dev = db
            .device_by_name(ctrl.id, "RoomClimate", "temperature")
            .await
            .unwrap()
            .unwrap();
        let hour = crate::history::current_hour(Moscow, None);
        let row = db.history_for_hour(dev.id, hour).await.unwrap().unwrap();
        assert_eq!(row.value, Some(27.1));
    }

    #[tokio::test]
    async fn handle_unknown_controller_is_silent() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let payload = json!({"Lamp": "on"});
        handle(
            &db,
            Moscow,
            "no/such/controller",
            payload.as_object().unwrap().clone(),
        )
        .await
        .unwrap();
    }
}
