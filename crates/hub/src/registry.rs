//! Device registry: last-known state of every field node.
//!
//! The controller only sees the read-only [`DeviceRegistry`] trait. The
//! telemetry collector in `main` writes through [`TelemetryRegistry`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::model::{Device, DeviceStatus, SensorSample};

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Devices bound to a zone, in registration order. The first one is the
    /// zone's primary device.
    async fn devices_by_zone(&self, zone_id: &str) -> Vec<Device>;

    async fn device(&self, device_id: &str) -> Option<Device>;
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    /// Registration order, for primary-device selection.
    order: Vec<String>,
}

/// In-memory registry fed by telemetry. Clones share the same state.
#[derive(Clone, Default)]
pub struct TelemetryRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or rebind) a device. New devices start OFFLINE until they
    /// report in.
    pub async fn register(&self, device_id: &str, name: &str, zone_id: Option<&str>) {
        let mut inner = self.inner.write().await;
        match inner.devices.get_mut(device_id) {
            Some(d) => {
                d.name = name.to_string();
                d.zone_id = zone_id.map(str::to_string);
            }
            None => {
                inner.devices.insert(
                    device_id.to_string(),
                    Device {
                        device_id: device_id.to_string(),
                        name: name.to_string(),
                        zone_id: zone_id.map(str::to_string),
                        status: DeviceStatus::Offline,
                        last_sample: None,
                        last_seen: None,
                    },
                );
                inner.order.push(device_id.to_string());
            }
        }
    }

    /// Store a telemetry sample. A reporting device is ONLINE by definition.
    /// Returns `false` for devices nobody registered.
    pub async fn record_sample(&self, device_id: &str, sample: SensorSample) -> bool {
        let mut inner = self.inner.write().await;
        let Some(d) = inner.devices.get_mut(device_id) else {
            return false;
        };
        d.last_sample = Some(sample);
        d.last_seen = Some(OffsetDateTime::now_utc());
        d.status = DeviceStatus::Online;
        true
    }

    /// Restore a persisted sample after a restart. Status and `last_seen` are
    /// left alone: an old sample says nothing about liveness.
    pub async fn restore_sample(&self, device_id: &str, sample: SensorSample) -> bool {
        let mut inner = self.inner.write().await;
        let Some(d) = inner.devices.get_mut(device_id) else {
            return false;
        };
        d.last_sample = Some(sample);
        true
    }

    pub async fn set_status(&self, device_id: &str, status: DeviceStatus) -> bool {
        let mut inner = self.inner.write().await;
        let Some(d) = inner.devices.get_mut(device_id) else {
            return false;
        };
        d.status = status;
        if status == DeviceStatus::Online {
            d.last_seen = Some(OffsetDateTime::now_utc());
        }
        true
    }

    /// Mark ONLINE devices silent for longer than `max_silence` as OFFLINE.
    /// Returns the ids that changed.
    pub async fn sweep_offline(&self, now: OffsetDateTime, max_silence: Duration) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let mut changed = Vec::new();
        for d in inner.devices.values_mut() {
            if d.status != DeviceStatus::Online {
                continue;
            }
            let silent_for: Duration = match d.last_seen {
                Some(seen) => (now - seen).try_into().unwrap_or(Duration::ZERO),
                None => Duration::MAX,
            };
            if silent_for > max_silence {
                d.status = DeviceStatus::Offline;
                changed.push(d.device_id.clone());
            }
        }
        changed.sort();
        changed
    }
}

#[async_trait]
impl DeviceRegistry for TelemetryRegistry {
    async fn devices_by_zone(&self, zone_id: &str) -> Vec<Device> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.devices.get(id))
            .filter(|d| d.zone_id.as_deref() == Some(zone_id))
            .cloned()
            .collect()
    }

    async fn device(&self, device_id: &str) -> Option<Device> {
        self.inner.read().await.devices.get(device_id).cloned()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
