//! Threshold store and audit log seams.
//!
//! Production uses the SQLite-backed [`crate::db::Db`]; `testing::MemoryStore`
//! backs the controller and HTTP tests.

use async_trait::async_trait;

use crate::error::ControlError;
use crate::model::{ActionRecord, Zone, ZoneSetting};

#[async_trait]
pub trait ThresholdStore: Send + Sync {
    async fn list_zones(&self) -> Result<Vec<Zone>, ControlError>;

    /// `UnknownZone` when the zone does not exist.
    async fn get_settings(&self, zone_id: &str) -> Result<ZoneSetting, ControlError>;

    /// Single-key write, last writer wins.
    async fn put_settings(&self, zone_id: &str, setting: &ZoneSetting) -> Result<(), ControlError>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: &ActionRecord) -> Result<(), ControlError>;
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;
    use crate::model::ZoneMode;

    fn zone(id: &str) -> Zone {
        Zone {
            zone_id: id.into(),
            name: format!("Zone {id}"),
            crop_type: "Lettuce".into(),
            setting: ZoneSetting::default(),
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let store = MemoryStore::new();
        store.insert_zone(zone("z1")).await;

        let mut s = store.get_settings("z1").await.unwrap();
        s.mode = ZoneMode::Manual;
        store.put_settings("z1", &s).await.unwrap();
        assert_eq!(store.get_settings("z1").await.unwrap().mode, ZoneMode::Manual);
    }

    #[tokio::test]
    async fn unknown_zone_is_reported() {
        let store = MemoryStore::new();
        let err = store.get_settings("nope").await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownZone(ref z) if z == "nope"));
        let err = store
            .put_settings("nope", &ZoneSetting::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_zone");
    }

    #[tokio::test]
    async fn list_zones_sorted_by_id() {
        let store = MemoryStore::new();
        store.insert_zone(zone("z2")).await;
        store.insert_zone(zone("z1")).await;
        let ids: Vec<String> = store
            .list_zones()
            .await
            .unwrap()
            .into_iter()
            .map(|z| z.zone_id)
            .collect();
        assert_eq!(ids, vec!["z1", "z2"]);
    }
}
