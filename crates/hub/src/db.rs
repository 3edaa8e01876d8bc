use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::ControlError;
use crate::model::{ActionRecord, SensorSample, Zone, ZoneMode, ZoneSetting};
use crate::store::{AuditLog, ThresholdStore};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Device row as persisted. Live status lives in the registry, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    pub device_id: String,
    pub name: String,
    pub zone_id: Option<String>,
}

#[derive(FromRow)]
struct ZoneJoinRow {
    zone_id: String,
    name: String,
    crop_type: String,
    mode: Option<String>,
    min_soil_moisture: Option<f64>,
    max_soil_moisture: Option<f64>,
    heat_shock_temp: Option<f64>,
    pump_duration: Option<i64>,
    mist_duration: Option<i64>,
}

impl ZoneJoinRow {
    /// Zones without a settings row get the defaults.
    fn setting(&self) -> ZoneSetting {
        let d = ZoneSetting::default();
        ZoneSetting {
            mode: self
                .mode
                .as_deref()
                .and_then(|m| ZoneMode::from_str(m).ok())
                .unwrap_or(d.mode),
            min_soil_moisture: self.min_soil_moisture.unwrap_or(d.min_soil_moisture),
            max_soil_moisture: self.max_soil_moisture.unwrap_or(d.max_soil_moisture),
            heat_shock_temp: self.heat_shock_temp.unwrap_or(d.heat_shock_temp),
            pump_duration: self.pump_duration.unwrap_or(d.pump_duration),
            mist_duration: self.mist_duration.unwrap_or(d.mist_duration),
        }
    }

    fn into_zone(self) -> Zone {
        let setting = self.setting();
        Zone {
            zone_id: self.zone_id,
            name: self.name,
            crop_type: self.crop_type,
            setting,
        }
    }
}

#[derive(FromRow)]
struct SampleRow {
    ts: i64,
    temp: Option<f64>,
    hum_air: Option<f64>,
    hum_soil: Option<f64>,
    light: Option<f64>,
}

const ZONE_SELECT: &str = r#"
    SELECT z.zone_id, z.name, z.crop_type,
           s.mode, s.min_soil_moisture, s.max_soil_moisture,
           s.heat_shock_temp, s.pump_duration, s.mist_duration
    FROM zones z
    LEFT JOIN zone_settings s ON s.zone_id = z.zone_id
"#;

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/farm-hub/farm.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database only lives as long as its connection.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
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
    // Zones
    // ----------------------------

    /// Create or update a zone and its setting in one transaction.
    pub async fn upsert_zone(&self, z: &Zone) -> Result<()> {
        let mut tx = self.pool.begin().await.context("upsert_zone: begin failed")?;

        sqlx::query(
            r#"
            INSERT INTO zones (zone_id, name, crop_type) VALUES (?, ?, ?)
            ON CONFLICT(zone_id) DO UPDATE SET
              name=excluded.name,
              crop_type=excluded.crop_type
            "#,
        )
        .bind(&z.zone_id)
        .bind(&z.name)
        .bind(&z.crop_type)
        .execute(&mut *tx)
        .await
        .context("upsert_zone failed")?;

        write_setting(&mut *tx, &z.zone_id, &z.setting)
            .await
            .context("upsert_zone: setting write failed")?;

        tx.commit().await.context("upsert_zone: commit failed")?;
        Ok(())
    }

    /// Seed a zone only if it does not exist yet. Existing rows keep their
    /// runtime changes (mode switches, threshold edits).
    pub async fn insert_zone_if_absent(&self, z: &Zone) -> Result<bool> {
        let existing = self.get_zone(&z.zone_id).await?;
        if existing.is_some() {
            return Ok(false);
        }
        self.upsert_zone(z).await?;
        Ok(true)
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        let rows: Vec<ZoneJoinRow> = sqlx::query_as(&format!("{ZONE_SELECT} ORDER BY z.zone_id"))
            .fetch_all(&self.pool)
            .await
            .context("load_zones failed")?;
        Ok(rows.into_iter().map(ZoneJoinRow::into_zone).collect())
    }

    pub async fn get_zone(&self, zone_id: &str) -> Result<Option<Zone>> {
        let row: Option<ZoneJoinRow> =
            sqlx::query_as(&format!("{ZONE_SELECT} WHERE z.zone_id = ?"))
                .bind(zone_id)
                .fetch_optional(&self.pool)
                .await
                .context("get_zone failed")?;
        Ok(row.map(ZoneJoinRow::into_zone))
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn upsert_device(&self, d: &DeviceRow, position: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, name, zone_id, position) VALUES (?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              name=excluded.name,
              zone_id=excluded.zone_id,
              position=excluded.position
            "#,
        )
        .bind(&d.device_id)
        .bind(&d.name)
        .bind(&d.zone_id)
        .bind(position)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    /// Devices in registration order.
    pub async fn load_devices(&self) -> Result<Vec<DeviceRow>> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT device_id, name, zone_id FROM devices ORDER BY position, device_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_devices failed")?;

        Ok(rows
            .into_iter()
            .map(|(device_id, name, zone_id)| DeviceRow {
                device_id,
                name,
                zone_id,
            })
            .collect())
    }

    // ----------------------------
    // Samples
    // ----------------------------

    pub async fn insert_sample(&self, device_id: &str, s: &SensorSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_samples (ts, device_id, temp, hum_air, hum_soil, light)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(s.timestamp.unix_timestamp())
        .bind(device_id)
        .bind(s.temp)
        .bind(s.hum_air)
        .bind(s.hum_soil)
        .bind(s.light)
        .execute(&self.pool)
        .await
        .context("insert_sample failed")?;
        Ok(())
    }

    /// Newest persisted sample for a device, used to warm the registry after
    /// a restart.
    pub async fn latest_sample(&self, device_id: &str) -> Result<Option<SensorSample>> {
        let row: Option<SampleRow> = sqlx::query_as(
            r#"
            SELECT ts, temp, hum_air, hum_soil, light
            FROM sensor_samples
            WHERE device_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_sample failed")?;

        row.map(|r| -> Result<SensorSample> {
            let timestamp = OffsetDateTime::from_unix_timestamp(r.ts)
                .with_context(|| format!("bad sample timestamp {}", r.ts))?;
            Ok(SensorSample {
                temp: r.temp,
                hum_soil: r.hum_soil,
                hum_air: r.hum_air,
                light: r.light,
                timestamp,
            })
        })
        .transpose()
    }

    // ----------------------------
    // Action log
    // ----------------------------

    #[cfg(test)]
    pub async fn count_actions(&self, device_id: &str, outcome: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM action_logs WHERE device_id = ? AND outcome = ?",
        )
        .bind(device_id)
        .bind(outcome)
        .fetch_one(&self.pool)
        .await
        .context("count_actions failed")?;
        Ok(n)
    }
}

async fn write_setting<'e, E>(exec: E, zone_id: &str, s: &ZoneSetting) -> sqlx::Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO zone_settings (
          zone_id, mode,
          min_soil_moisture, max_soil_moisture, heat_shock_temp,
          pump_duration, mist_duration
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(zone_id) DO UPDATE SET
          mode=excluded.mode,
          min_soil_moisture=excluded.min_soil_moisture,
          max_soil_moisture=excluded.max_soil_moisture,
          heat_shock_temp=excluded.heat_shock_temp,
          pump_duration=excluded.pump_duration,
          mist_duration=excluded.mist_duration
        "#,
    )
    .bind(zone_id)
    .bind(s.mode.as_str())
    .bind(s.min_soil_moisture)
    .bind(s.max_soil_moisture)
    .bind(s.heat_shock_temp)
    .bind(s.pump_duration)
    .bind(s.mist_duration)
    .execute(exec)
    .await?;
    Ok(())
}

#[async_trait]
impl ThresholdStore for Db {
    async fn list_zones(&self) -> Result<Vec<Zone>, ControlError> {
        self.load_zones()
            .await
            .map_err(|e| ControlError::Store(format!("{e:#}")))
    }

    async fn get_settings(&self, zone_id: &str) -> Result<ZoneSetting, ControlError> {
        match self.get_zone(zone_id).await {
            Ok(Some(z)) => Ok(z.setting),
            Ok(None) => Err(ControlError::UnknownZone(zone_id.to_string())),
            Err(e) => Err(ControlError::Store(format!("{e:#}"))),
        }
    }

    async fn put_settings(&self, zone_id: &str, setting: &ZoneSetting) -> Result<(), ControlError> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT zone_id FROM zones WHERE zone_id = ?")
            .bind(zone_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(ControlError::UnknownZone(zone_id.to_string()));
        }
        write_setting(&self.pool, zone_id, setting).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for Db {
    async fn record(&self, e: &ActionRecord) -> Result<(), ControlError> {
        sqlx::query(
            r#"
            INSERT INTO action_logs (ts, zone_id, device_id, action, origin, outcome, detail)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(e.ts.unix_timestamp())
        .bind(&e.zone_id)
        .bind(&e.device_id)
        .bind(e.action.as_str())
        .bind(e.origin.as_str())
        .bind(e.outcome.as_str())
        .bind(&e.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
