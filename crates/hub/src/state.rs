use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::model::{ActionRecord, DeviceStatus, Outcome, SensorSample, ZoneMode, ZoneStatus};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    /// Most recent dispatch outcome per zone.
    pub last_actions: HashMap<String, ActionRecord>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Command,
    Mode,
    Failsafe,
    /// A fail-safe that is not working; someone should go and look.
    Escalation,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub zones: Vec<ZoneStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            last_actions: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a telemetry sample from a device.
    pub fn record_telemetry(&mut self, device_id: &str, s: &SensorSample) {
        let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"));
        let detail = format!(
            "{device_id}: temp={} hum_soil={} hum_air={} light={}",
            fmt(s.temp),
            fmt(s.hum_soil),
            fmt(s.hum_air),
            fmt(s.light)
        );
        self.push_event(EventKind::Telemetry, detail);
    }

    pub fn record_device_status(&mut self, device_id: &str, status: DeviceStatus) {
        self.push_event(EventKind::System, format!("{device_id} is {}", status.as_str()));
    }

    /// Record a dispatch outcome.
    pub fn record_action(&mut self, rec: &ActionRecord) {
        let zone = rec.zone_id.as_deref().unwrap_or("-");
        let mut detail = format!(
            "{zone}/{} {} ({}) {}",
            rec.device_id,
            rec.action,
            rec.origin,
            rec.outcome.as_str()
        );
        if !rec.detail.is_empty() {
            detail.push_str(": ");
            detail.push_str(&rec.detail);
        }
        let kind = match rec.outcome {
            Outcome::Accepted | Outcome::Shutoff | Outcome::RateLimited => EventKind::Command,
            Outcome::DeviceOffline | Outcome::TransportError => EventKind::Error,
        };
        self.push_event(kind, detail);

        if let Some(zone_id) = &rec.zone_id {
            self.last_actions.insert(zone_id.clone(), rec.clone());
        }
    }

    pub fn record_mode(&mut self, zone_id: &str, from: ZoneMode, to: ZoneMode) {
        self.push_event(EventKind::Mode, format!("{zone_id} {from} -> {to}"));
    }

    pub fn record_failsafe(&mut self, zone_id: &str, detail: String) {
        self.push_event(EventKind::Failsafe, format!("{zone_id}: {detail}"));
    }

    pub fn record_escalation(&mut self, zone_id: &str, detail: String) {
        self.push_event(EventKind::Escalation, format!("{zone_id}: {detail}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn last_action(&self, zone_id: &str) -> Option<ActionRecord> {
        self.last_actions.get(zone_id).cloned()
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, zones: Vec<ZoneStatus>) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            zones,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
