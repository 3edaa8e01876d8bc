//! Domain types shared by the controller, the stores and the HTTP layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Zone mode + setting
// ---------------------------------------------------------------------------

/// Who drives a zone's actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZoneMode {
    /// External AI decision process.
    Auto,
    /// Operator commands, backed by the fail-safe evaluator.
    Manual,
}

impl ZoneMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ZoneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZoneMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Ok(Self::Auto),
            "MANUAL" => Ok(Self::Manual),
            other => Err(format!("unknown zone mode '{other}'")),
        }
    }
}

/// Per-zone automation setting, as held by the threshold store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneSetting {
    pub mode: ZoneMode,
    /// Soil moisture percent below which the pump fail-safe fires.
    pub min_soil_moisture: f64,
    pub max_soil_moisture: f64,
    /// Air temperature (°C) at or above which the mist fail-safe fires.
    pub heat_shock_temp: f64,
    /// Pump run time in seconds.
    pub pump_duration: i64,
    /// Mist run time in seconds.
    pub mist_duration: i64,
}

impl Default for ZoneSetting {
    fn default() -> Self {
        Self {
            mode: ZoneMode::Auto,
            min_soil_moisture: 40.0,
            max_soil_moisture: 70.0,
            heat_shock_temp: 35.0,
            pump_duration: 30,
            mist_duration: 60,
        }
    }
}

impl ZoneSetting {
    /// Collect every invariant violation. Empty means valid.
    pub fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !(0.0..=100.0).contains(&self.min_soil_moisture) {
            errors.push(format!(
                "min_soil_moisture {} out of range [0, 100]",
                self.min_soil_moisture
            ));
        }
        if !(0.0..=100.0).contains(&self.max_soil_moisture) {
            errors.push(format!(
                "max_soil_moisture {} out of range [0, 100]",
                self.max_soil_moisture
            ));
        }
        if self.min_soil_moisture >= self.max_soil_moisture {
            errors.push(format!(
                "min_soil_moisture ({}) must be less than max_soil_moisture ({})",
                self.min_soil_moisture, self.max_soil_moisture
            ));
        }
        if !self.heat_shock_temp.is_finite() {
            errors.push("heat_shock_temp must be a finite number".to_string());
        }
        if self.pump_duration <= 0 {
            errors.push(format!(
                "pump_duration must be positive, got {}",
                self.pump_duration
            ));
        }
        if self.mist_duration <= 0 {
            errors.push(format!(
                "mist_duration must be positive, got {}",
                self.mist_duration
            ));
        }

        errors
    }

    /// Run time for a duration-bound action, `None` for everything else.
    pub fn run_time_for(&self, action: Action) -> Option<Duration> {
        match action {
            Action::PumpOn => Some(Duration::from_secs(self.pump_duration.max(0) as u64)),
            Action::MistOn => Some(Duration::from_secs(self.mist_duration.max(0) as u64)),
            _ => None,
        }
    }
}

/// Operator threshold edit. Absent fields keep their stored value; the mode
/// is deliberately not editable here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdUpdate {
    pub min_soil_moisture: Option<f64>,
    pub max_soil_moisture: Option<f64>,
    pub heat_shock_temp: Option<f64>,
    pub pump_duration: Option<i64>,
    pub mist_duration: Option<i64>,
}

impl ThresholdUpdate {
    pub fn apply_to(&self, setting: &ZoneSetting) -> ZoneSetting {
        ZoneSetting {
            mode: setting.mode,
            min_soil_moisture: self.min_soil_moisture.unwrap_or(setting.min_soil_moisture),
            max_soil_moisture: self.max_soil_moisture.unwrap_or(setting.max_soil_moisture),
            heat_shock_temp: self.heat_shock_temp.unwrap_or(setting.heat_shock_temp),
            pump_duration: self.pump_duration.unwrap_or(setting.pump_duration),
            mist_duration: self.mist_duration.unwrap_or(setting.mist_duration),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: String,
    pub name: String,
    pub crop_type: String,
    pub setting: ZoneSetting,
}

// ---------------------------------------------------------------------------
// Devices + telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(Self::Online),
            "OFFLINE" => Ok(Self::Offline),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown device status '{other}'")),
        }
    }
}

/// One telemetry sample. Every reading may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub temp: Option<f64>,
    pub hum_soil: Option<f64>,
    pub hum_air: Option<f64>,
    pub light: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    /// `None` while the device sits in inventory.
    pub zone_id: Option<String>,
    pub status: DeviceStatus,
    pub last_sample: Option<SensorSample>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Physical actuator channel on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Actuator {
    Pump,
    Mist,
    Light,
}

impl Actuator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pump => "PUMP",
            Self::Mist => "MIST",
            Self::Light => "LIGHT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    PumpOn,
    PumpOff,
    MistOn,
    MistOff,
    LightOn,
    LightOff,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PumpOn => "PUMP_ON",
            Self::PumpOff => "PUMP_OFF",
            Self::MistOn => "MIST_ON",
            Self::MistOff => "MIST_OFF",
            Self::LightOn => "LIGHT_ON",
            Self::LightOff => "LIGHT_OFF",
        }
    }

    pub fn actuator(&self) -> Actuator {
        match self {
            Self::PumpOn | Self::PumpOff => Actuator::Pump,
            Self::MistOn | Self::MistOff => Actuator::Mist,
            Self::LightOn | Self::LightOff => Actuator::Light,
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, Self::PumpOn | Self::MistOn | Self::LightOn)
    }

    /// The `_OFF` action for the same actuator.
    pub fn off_counterpart(&self) -> Action {
        match self.actuator() {
            Actuator::Pump => Self::PumpOff,
            Actuator::Mist => Self::MistOff,
            Actuator::Light => Self::LightOff,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PUMP_ON" => Ok(Self::PumpOn),
            "PUMP_OFF" => Ok(Self::PumpOff),
            "MIST_ON" => Ok(Self::MistOn),
            "MIST_OFF" => Ok(Self::MistOff),
            "LIGHT_ON" => Ok(Self::LightOn),
            "LIGHT_OFF" => Ok(Self::LightOff),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Who asked for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    Manual,
    Failsafe,
    AiModel,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Failsafe => "FAILSAFE",
            Self::AiModel => "AI_MODEL",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub device_id: String,
    pub action: Action,
    pub origin: Origin,
    pub issued_at: OffsetDateTime,
    /// Set for duration-bound actions; the dispatcher sends the matching
    /// `_OFF` once it elapses.
    pub run_for: Option<Duration>,
}

impl CommandRequest {
    pub fn new(device_id: impl Into<String>, action: Action, origin: Origin) -> Self {
        Self {
            device_id: device_id.into(),
            action,
            origin,
            issued_at: OffsetDateTime::now_utc(),
            run_for: None,
        }
    }

    pub fn run_for(mut self, duration: Option<Duration>) -> Self {
        self.run_for = duration;
        self
    }
}

/// A requested mode change while it is being authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeTransition {
    pub zone_id: String,
    pub from_mode: ZoneMode,
    pub to_mode: ZoneMode,
    pub confirmed: bool,
}

// ---------------------------------------------------------------------------
// Audit + status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    RateLimited,
    DeviceOffline,
    TransportError,
    /// Scheduled duration-bound shutoff delivered.
    Shutoff,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::RateLimited => "rate_limited",
            Self::DeviceOffline => "device_offline",
            Self::TransportError => "transport_error",
            Self::Shutoff => "shutoff",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub zone_id: Option<String>,
    pub device_id: String,
    pub action: Action,
    pub origin: Origin,
    pub outcome: Outcome,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrimaryDevice {
    pub device_id: String,
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub zone_id: String,
    pub mode: ZoneMode,
    pub primary_device: Option<PrimaryDevice>,
    pub last_sample: Option<SensorSample>,
    pub last_action: Option<ActionRecord>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_setting_is_valid_and_auto() {
        let s = ZoneSetting::default();
        assert!(s.violations().is_empty());
        assert_eq!(s.mode, ZoneMode::Auto);
    }

    #[test]
    fn min_must_be_below_max() {
        let s = ZoneSetting {
            min_soil_moisture: 60.0,
            max_soil_moisture: 60.0,
            ..ZoneSetting::default()
        };
        let v = s.violations();
        assert_eq!(v.len(), 1);
        assert!(v[0].contains("must be less than max_soil_moisture"));
    }

    #[test]
    fn durations_must_be_positive() {
        let s = ZoneSetting {
            pump_duration: 0,
            mist_duration: -3,
            ..ZoneSetting::default()
        };
        let v = s.violations().join("; ");
        assert!(v.contains("pump_duration must be positive"));
        assert!(v.contains("mist_duration must be positive, got -3"));
    }

    #[test]
    fn run_time_only_for_pump_and_mist_on() {
        let s = ZoneSetting::default();
        assert_eq!(s.run_time_for(Action::PumpOn), Some(Duration::from_secs(30)));
        assert_eq!(s.run_time_for(Action::MistOn), Some(Duration::from_secs(60)));
        assert_eq!(s.run_time_for(Action::LightOn), None);
        assert_eq!(s.run_time_for(Action::PumpOff), None);
    }

    #[test]
    fn threshold_update_keeps_mode() {
        let s = ZoneSetting {
            mode: ZoneMode::Manual,
            ..ZoneSetting::default()
        };
        let upd = ThresholdUpdate {
            min_soil_moisture: Some(25.0),
            ..ThresholdUpdate::default()
        };
        let out = upd.apply_to(&s);
        assert_eq!(out.mode, ZoneMode::Manual);
        assert_eq!(out.min_soil_moisture, 25.0);
        assert_eq!(out.max_soil_moisture, s.max_soil_moisture);
    }

    #[test]
    fn action_parse_and_pairing() {
        assert_eq!("pump_on".parse::<Action>(), Ok(Action::PumpOn));
        assert_eq!(" MIST_OFF ".parse::<Action>(), Ok(Action::MistOff));
        assert!("HACK_ON".parse::<Action>().is_err());
        assert_eq!(Action::MistOn.off_counterpart(), Action::MistOff);
        assert_eq!(Action::LightOff.actuator(), Actuator::Light);
        assert!(Action::PumpOn.is_on());
        assert!(!Action::PumpOff.is_on());
    }

    #[test]
    fn action_serializes_screaming_snake() {
        let json = serde_json::to_string(&Action::LightOn).unwrap();
        assert_eq!(json, "\"LIGHT_ON\"");
        let origin = serde_json::to_string(&Origin::AiModel).unwrap();
        assert_eq!(origin, "\"AI_MODEL\"");
    }

    #[test]
    fn mode_and_status_parse_case_insensitive() {
        assert_eq!("manual".parse::<ZoneMode>(), Ok(ZoneMode::Manual));
        assert_eq!("Online".parse::<DeviceStatus>(), Ok(DeviceStatus::Online));
        assert!("sleeping".parse::<DeviceStatus>().is_err());
    }
}
