use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A physical gateway board. `topic` is the only stable identity.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Controller {
    pub id: i64,
    pub topic: String,
    pub ip: Option<String>,
    pub broker_user: Option<String>,
    pub period: i64,
    pub description: String,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A logical sensor/actuator. Sub-channels of a physical part (probe
/// names, "temperature"/"humidity") are distinct rows discriminated by
/// `extra_name` ('' for bare devices).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Device {
    pub id: i64,
    pub controller_id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub extra_name: String,
    pub pin: Option<String>,
    pub description: Option<String>,
    pub device_key: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeviceState {
    pub device_id: i64,
    pub value: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeviceHistory {
    pub device_id: i64,
    pub hour: NaiveDateTime,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub value: Option<f64>,
    pub status: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Single-use provisioning ticket.
#[derive(Debug, Clone, FromRow)]
pub struct FileRequest {
    pub id: i64,
    pub topic: String,
    pub secret_key: String,
    pub filename: String,
    pub requested_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Write-side inputs
// ---------------------------------------------------------------------------

/// Optional field updates applied to a controller row; `None` leaves
/// the existing value untouched.
#[derive(Debug, Default, Clone)]
pub struct ControllerPatch {
    pub ip: Option<String>,
    pub broker_user: Option<String>,
    pub period: Option<i64>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDevice {
    pub name: String,
    pub kind: String,
    pub extra_name: String,
    pub pin: Option<String>,
    pub description: Option<String>,
    pub device_key: String,
}

#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub trigger_device: String,
    pub parameter: String,
    pub condition: String,
    pub threshold: f64,
    pub action: String,
    pub active: bool,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/fieldbus/hub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Controllers
    // ----------------------------

    pub async fn controller_by_topic(&self, topic: &str) -> Result<Option<Controller>> {
        sqlx::query_as::<_, Controller>("SELECT * FROM controllers WHERE topic = ?")
            .bind(topic)
            .fetch_optional(&self.pool)
            .await
            .context("controller_by_topic failed")
    }

    /// Create the controller for `topic` or update the existing row in
    /// place. Re-provisioning a known topic never yields a second row.
    pub async fn upsert_controller(&self, topic: &str, patch: ControllerPatch) -> Result<Controller> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO controllers (topic, ip, broker_user, period, description, last_seen, created_at, updated_at)
            VALUES (?1, ?2, ?3, COALESCE(?4, 60), '', COALESCE(?5, ?6), ?6, ?6)
            ON CONFLICT(topic) DO UPDATE SET
              ip          = COALESCE(excluded.ip, controllers.ip),
              broker_user = COALESCE(excluded.broker_user, controllers.broker_user),
              period      = COALESCE(?4, controllers.period),
              last_seen   = COALESCE(?5, controllers.last_seen),
              updated_at  = excluded.updated_at
            "#,
        )
        .bind(topic)
        .bind(&patch.ip)
        .bind(&patch.broker_user)
        .bind(patch.period)
        .bind(patch.last_seen)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("upsert_controller failed")?;

        self.controller_by_topic(topic)
            .await?
            .context("controller vanished after upsert")
    }

    pub async fn list_controllers(&self) -> Result<Vec<Controller>> {
        sqlx::query_as::<_, Controller>("SELECT * FROM controllers ORDER BY topic")
            .fetch_all(&self.pool)
            .await
            .context("list_controllers failed")
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn device_by_name(
        &self,
        controller_id: i64,
        name: &str,
        extra_name: &str,
    ) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE controller_id = ? AND name = ? AND extra_name = ?",
        )
        .bind(controller_id)
        .bind(name)
        .bind(extra_name)
        .fetch_optional(&self.pool)
        .await
        .context("device_by_name failed")
    }

    /// Stored type string for a device name on a controller, ignoring
    /// sub-channels (all channels of one physical part share a type).
    pub async fn device_type_for(&self, controller_id: i64, name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT type FROM devices WHERE controller_id = ? AND name = ? LIMIT 1",
        )
        .bind(controller_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("device_type_for failed")?;
        Ok(row.map(|r| r.0))
    }

    /// Idempotent on (controller_id, name, extra_name); an existing row
    /// is returned untouched.
    pub async fn get_or_create_device(&self, controller_id: i64, new: &NewDevice) -> Result<Device> {
        if let Some(device) = self
            .device_by_name(controller_id, &new.name, &new.extra_name)
            .await?
        {
            return Ok(device);
        }

        sqlx::query(
            r#"
            INSERT INTO devices (controller_id, name, type, extra_name, pin, description, device_key)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(controller_id, name, extra_name) DO NOTHING
            "#,
        )
        .bind(controller_id)
        .bind(&new.name)
        .bind(&new.kind)
        .bind(&new.extra_name)
        .bind(&new.pin)
        .bind(&new.description)
        .bind(&new.device_key)
        .execute(&self.pool)
        .await
        .context("get_or_create_device insert failed")?;

        self.device_by_name(controller_id, &new.name, &new.extra_name)
            .await?
            .context("device vanished after insert")
    }

    // ----------------------------
    // Device state (latest value, one row per device)
    // ----------------------------

    pub async fn device_state(&self, device_id: i64) -> Result<Option<DeviceState>> {
        sqlx::query_as::<_, DeviceState>("SELECT * FROM device_states WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("device_state failed")
    }

    /// Monotonically replace the device's latest value.
    pub async fn upsert_device_state(&self, device_id: i64, value: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_states (device_id, value, last_updated)
            VALUES (?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              value = excluded.value,
              last_updated = excluded.last_updated
            "#,
        )
        .bind(device_id)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("upsert_device_state failed")?;
        Ok(())
    }

    // ----------------------------
    // Hourly history rollup
    // ----------------------------

    pub async fn history_for_hour(
        &self,
        device_id: i64,
        hour: NaiveDateTime,
    ) -> Result<Option<DeviceHistory>> {
        sqlx::query_as::<_, DeviceHistory>(
            "SELECT * FROM device_history WHERE device_id = ? AND hour = ?",
        )
        .bind(device_id)
        .bind(hour)
        .fetch_optional(&self.pool)
        .await
        .context("history_for_hour failed")
    }

    /// At most one row per device per hour; running min/max plus last
    /// observed value.
    pub async fn upsert_history(
        &self,
        device_id: i64,
        hour: NaiveDateTime,
        value: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_history (device_id, hour, min_value, max_value, value, status, last_updated)
            VALUES (?1, ?2, ?3, ?3, ?3, NULL, ?4)
            ON CONFLICT(device_id, hour) DO UPDATE SET
              min_value = MIN(device_history.min_value, excluded.min_value),
              max_value = MAX(device_history.max_value, excluded.max_value),
              value = excluded.value,
              last_updated = excluded.last_updated
            "#,
        )
        .bind(device_id)
        .bind(hour)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("upsert_history failed")?;
        Ok(())
    }

    // ----------------------------
    // File requests (provisioning tickets)
    // ----------------------------

    pub async fn insert_file_request(
        &self,
        topic: &str,
        secret_key: &str,
        filename: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_requests (topic, secret_key, filename, requested_at) VALUES (?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(secret_key)
        .bind(filename)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("insert_file_request failed")?;
        Ok(())
    }

    /// Drop every outstanding ticket for one (topic, filename) pair.
    /// Called when a new request supersedes them; old secrets stop
    /// working the moment a replacement is issued.
    pub async fn delete_file_requests_for(&self, topic: &str, filename: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file_requests WHERE topic = ? AND filename = ?")
            .bind(topic)
            .bind(filename)
            .execute(&self.pool)
            .await
            .context("delete_file_requests_for failed")?;
        Ok(result.rows_affected())
    }

    pub async fn file_request_by_topic_and_key(
        &self,
        topic: &str,
        secret_key: &str,
    ) -> Result<Option<FileRequest>> {
        sqlx::query_as::<_, FileRequest>(
            "SELECT * FROM file_requests WHERE topic = ? AND secret_key = ?",
        )
        .bind(topic)
        .bind(secret_key)
        .fetch_optional(&self.pool)
        .await
        .context("file_request_by_topic_and_key failed")
    }

    /// Consume a ticket. Re-presenting the same secret key afterwards
    /// finds nothing.
    pub async fn delete_file_request(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM file_requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_file_request failed")?;
        Ok(())
    }

    // ----------------------------
    // Triggers
    // ----------------------------

    /// Idempotent create: an identical (device, trigger_device,
    /// parameter, condition, threshold) rule is not duplicated.
    pub async fn ensure_trigger(&self, device_id: i64, spec: &TriggerSpec) -> Result<()> {
        let existing: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM triggers
            WHERE device_id = ? AND trigger_device = ? AND parameter = ?
              AND condition = ? AND threshold = ?
            "#,
        )
        .bind(device_id)
        .bind(&spec.trigger_device)
        .bind(&spec.parameter)
        .bind(&spec.condition)
        .bind(spec.threshold)
        .fetch_optional(&self.pool)
        .await
        .context("ensure_trigger lookup failed")?;

        if existing.is_some() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO triggers (device_id, trigger_device, parameter, condition, threshold, action, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(&spec.trigger_device)
        .bind(&spec.parameter)
        .bind(&spec.condition)
        .bind(spec.threshold)
        .bind(&spec.action)
        .bind(spec.active)
        .execute(&self.pool)
        .await
        .context("ensure_trigger insert failed")?;
        Ok(())
    }

    pub async fn trigger_count(&self, device_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM triggers WHERE device_id = ?")
            .bind(device_id)
            .fetch_one(&self.pool)
            .await
            .context("trigger_count failed")?;
        Ok(row.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
