//! TOML config file loading, validation, and database seeding for zones,
//! devices and controller tunables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::db::{Db, DeviceRow};
use crate::dispatch::DispatchConfig;
use crate::model::{Zone, ZoneMode, ZoneSetting};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub poll_interval_sec: u64,
    pub freshness_window_sec: u64,
    pub rate_limit_window_sec: u64,
    pub retry_delay_ms: u64,
    pub offline_after_sec: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            poll_interval_sec: 15,
            freshness_window_sec: 120,
            rate_limit_window_sec: 10,
            retry_delay_ms: 500,
            offline_after_sec: 90,
        }
    }
}

impl ControllerSection {
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_sec),
            freshness_window: Duration::from_secs(self.freshness_window_sec),
        }
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            rate_window: Duration::from_secs(self.rate_limit_window_sec),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_sec)
    }
}

/// Zone seed. Missing thresholds fall back to the stock defaults.
#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub name: String,
    #[serde(default = "default_crop")]
    pub crop_type: String,
    pub mode: Option<ZoneMode>,
    pub min_soil_moisture: Option<f64>,
    pub max_soil_moisture: Option<f64>,
    pub heat_shock_temp: Option<f64>,
    pub pump_duration: Option<i64>,
    pub mist_duration: Option<i64>,
}

fn default_crop() -> String {
    "Lettuce".to_string()
}

impl ZoneEntry {
    pub fn setting(&self) -> ZoneSetting {
        let d = ZoneSetting::default();
        ZoneSetting {
            mode: self.mode.unwrap_or(d.mode),
            min_soil_moisture: self.min_soil_moisture.unwrap_or(d.min_soil_moisture),
            max_soil_moisture: self.max_soil_moisture.unwrap_or(d.max_soil_moisture),
            heat_shock_temp: self.heat_shock_temp.unwrap_or(d.heat_shock_temp),
            pump_duration: self.pump_duration.unwrap_or(d.pump_duration),
            mist_duration: self.mist_duration.unwrap_or(d.mist_duration),
        }
    }

    fn to_zone(&self) -> Zone {
        Zone {
            zone_id: self.zone_id.clone(),
            name: self.name.clone(),
            crop_type: self.crop_type.clone(),
            setting: self.setting(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: String,
    /// Omit to keep the device in inventory.
    pub zone_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        for (name, value) in [
            ("poll_interval_sec", c.poll_interval_sec),
            ("freshness_window_sec", c.freshness_window_sec),
            ("rate_limit_window_sec", c.rate_limit_window_sec),
            ("offline_after_sec", c.offline_after_sec),
        ] {
            if value == 0 {
                errors.push(format!("controller: {name} must be positive"));
            }
        }
        if c.freshness_window_sec > 0
            && c.poll_interval_sec > 0
            && c.freshness_window_sec < c.poll_interval_sec
        {
            errors.push(format!(
                "controller: freshness_window_sec ({}) is shorter than poll_interval_sec ({})",
                c.freshness_window_sec, c.poll_interval_sec
            ));
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Thresholds + run times ──────────────────────────
            for v in z.setting().violations() {
                errors.push(format!("{}: {v}", ctx()));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<&str> = self.zones.iter().map(|z| z.zone_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if d.device_id.contains(['/', '+', '#']) {
                errors.push(format!(
                    "{}: device_id must not contain MQTT topic characters",
                    ctx()
                ));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Zone binding ────────────────────────────────────
            if let Some(zone_id) = &d.zone_id {
                if !zone_ids.contains(zone_id.as_str()) {
                    errors.push(format!(
                        "{}: zone_id '{}' does not match any defined zone",
                        ctx(),
                        zone_id
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Seed zones and devices into the database.
///
/// Zones that already exist keep their stored setting: the database is the
/// source of truth for mode and thresholds once the hub has run. Devices are
/// upserted so the file controls names, bindings and primary order.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let mut seeded = 0usize;
    for z in &config.zones {
        if db
            .insert_zone_if_absent(&z.to_zone())
            .await
            .with_context(|| format!("failed to seed zone '{}'", z.zone_id))?
        {
            seeded += 1;
        }
    }

    for (position, d) in config.devices.iter().enumerate() {
        db.upsert_device(
            &DeviceRow {
                device_id: d.device_id.clone(),
                name: d.name.clone(),
                zone_id: d.zone_id.clone(),
            },
            position as i64,
        )
        .await
        .with_context(|| format!("failed to upsert device '{}'", d.device_id))?;
    }

    tracing::info!(
        zones = config.zones.len(),
        new_zones = seeded,
        devices = config.devices.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
