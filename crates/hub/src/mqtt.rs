use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{Action, DeviceStatus, SensorSample};

pub(crate) const TELEMETRY_FILTER: &str = "farm/+/telemetry";
pub(crate) const STATUS_FILTER: &str = "farm/+/status";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Node telemetry. Every field may be missing; `ts` is unix seconds.
#[derive(Debug, Deserialize)]
pub(crate) struct TelemetryMsg {
    pub(crate) ts: Option<i64>,
    pub(crate) temp: Option<f64>,
    pub(crate) hum_air: Option<f64>,
    pub(crate) hum_soil: Option<f64>,
    pub(crate) light: Option<f64>,
}

impl TelemetryMsg {
    /// Convert to a sample stamped with the receive time. Freshness is
    /// judged on the hub's clock; the node's `ts` never moves it.
    pub(crate) fn into_sample(self, received_at: OffsetDateTime) -> SensorSample {
        SensorSample {
            temp: self.temp,
            hum_soil: self.hum_soil,
            hum_air: self.hum_air,
            light: self.light,
            timestamp: received_at,
        }
    }

    /// Seconds the node's clock runs ahead of ours (negative when behind).
    /// `None` when the node sent no `ts`.
    pub(crate) fn clock_skew(&self, received_at: OffsetDateTime) -> Option<i64> {
        self.ts.map(|ts| ts - received_at.unix_timestamp())
    }
}

/// Wire format of `farm/<id>/control`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct ControlMsg {
    pub(crate) device: String,
    pub(crate) status: String,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

fn extract_device_id<'a>(topic: &'a str, suffix: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "farm" && parts[2] == suffix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract device_id from "farm/<device_id>/telemetry".
pub(crate) fn extract_telemetry_device(topic: &str) -> Option<&str> {
    extract_device_id(topic, "telemetry")
}

/// Extract device_id from "farm/<device_id>/status".
pub(crate) fn extract_status_device(topic: &str) -> Option<&str> {
    extract_device_id(topic, "status")
}

pub(crate) fn control_topic(device_id: &str) -> String {
    format!("farm/{device_id}/control")
}

pub(crate) fn command_payload(action: Action) -> Vec<u8> {
    let msg = ControlMsg {
        device: action.actuator().as_str().to_string(),
        status: if action.is_on() { "ON" } else { "OFF" }.to_string(),
    };
    // Serializing two plain strings cannot fail.
    serde_json::to_vec(&msg).unwrap_or_default()
}

/// Parse an "ONLINE"/"OFFLINE"/"ERROR" payload (case-insensitive, trims
/// whitespace).
pub(crate) fn parse_status_payload(payload: &[u8]) -> Result<DeviceStatus, String> {
    String::from_utf8_lossy(payload).parse()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failsafe::{Evaluation, Evaluator, Skip};
    use crate::model::{ZoneMode, ZoneSetting};
    use std::time::Duration;

    // -- extract_telemetry_device --------------------------------------------

    #[test]
    fn extract_telemetry_device_valid_topic() {
        assert_eq!(extract_telemetry_device("farm/node-a/telemetry"), Some("node-a"));
    }

    #[test]
    fn extract_telemetry_device_wrong_prefix() {
        assert_eq!(extract_telemetry_device("tele/node-a/telemetry"), None);
    }

    #[test]
    fn extract_telemetry_device_wrong_suffix() {
        assert_eq!(extract_telemetry_device("farm/node-a/status"), None);
    }

    #[test]
    fn extract_telemetry_device_bad_segments() {
        assert_eq!(extract_telemetry_device("farm/telemetry"), None);
        assert_eq!(extract_telemetry_device("farm/a/b/telemetry"), None);
        assert_eq!(extract_telemetry_device("farm//telemetry"), None);
        assert_eq!(extract_telemetry_device(""), None);
    }

    // -- extract_status_device -----------------------------------------------

    #[test]
    fn extract_status_device_valid_topic() {
        assert_eq!(extract_status_device("farm/gh-1/status"), Some("gh-1"));
    }

    #[test]
    fn extract_status_device_rejects_control() {
        assert_eq!(extract_status_device("farm/gh-1/control"), None);
    }

    // -- control ---------------------------------------------------------------

    #[test]
    fn control_topic_format() {
        assert_eq!(control_topic("esp32-01"), "farm/esp32-01/control");
    }

    #[test]
    fn command_payload_matches_firmware_format() {
        let on: ControlMsg = serde_json::from_slice(&command_payload(Action::PumpOn)).unwrap();
        assert_eq!(
            on,
            ControlMsg {
                device: "PUMP".into(),
                status: "ON".into()
            }
        );
        let off: ControlMsg = serde_json::from_slice(&command_payload(Action::LightOff)).unwrap();
        assert_eq!(off.device, "LIGHT");
        assert_eq!(off.status, "OFF");
    }

    // -- parse_status_payload ------------------------------------------------

    #[test]
    fn parse_status_payload_variants() {
        assert_eq!(parse_status_payload(b"ONLINE"), Ok(DeviceStatus::Online));
        assert_eq!(parse_status_payload(b" offline\n"), Ok(DeviceStatus::Offline));
        assert_eq!(parse_status_payload(b"Error"), Ok(DeviceStatus::Error));
    }

    #[test]
    fn parse_status_payload_garbage() {
        assert!(parse_status_payload(b"SLEEPING").is_err());
        assert!(parse_status_payload(b"").is_err());
    }

    // -- TelemetryMsg deserialization ----------------------------------------

    #[test]
    fn telemetry_full_message() {
        let json = r#"{"ts":1700000000,"temp":24.5,"hum_air":61.0,"hum_soil":38.2,"light":900.0}"#;
        let msg: TelemetryMsg = serde_json::from_str(json).unwrap();
        let received = OffsetDateTime::from_unix_timestamp(1_700_000_003).unwrap();
        assert_eq!(msg.clock_skew(received), Some(-3));
        let s = msg.into_sample(received);
        assert_eq!(s.timestamp, received);
        assert_eq!(s.hum_soil, Some(38.2));
        assert_eq!(s.light, Some(900.0));
    }

    #[test]
    fn lagging_node_clock_does_not_make_fresh_reading_stale() {
        let received = OffsetDateTime::now_utc();
        let ts = received.unix_timestamp() - 300;
        let json = format!(r#"{{"ts":{ts},"hum_soil":10.0}}"#);
        let msg: TelemetryMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(msg.clock_skew(received), Some(-300));

        let sample = msg.into_sample(received);
        let setting = ZoneSetting {
            mode: ZoneMode::Manual,
            ..ZoneSetting::default()
        };
        let eval = Evaluator::new(Duration::from_secs(120)).evaluate(Some(&sample), &setting, received);
        assert_eq!(eval.proposals().len(), 1);
        assert_eq!(eval.proposals()[0].action, Action::PumpOn);
    }

    #[test]
    fn leading_node_clock_does_not_keep_old_reading_fresh() {
        let received = OffsetDateTime::now_utc();
        let ts = received.unix_timestamp() + 3600;
        let json = format!(r#"{{"ts":{ts},"hum_soil":10.0}}"#);
        let msg: TelemetryMsg = serde_json::from_str(&json).unwrap();

        let sample = msg.into_sample(received);
        let later = received + time::Duration::seconds(600);
        let eval = Evaluator::new(Duration::from_secs(120)).evaluate(
            Some(&sample),
            &ZoneSetting::default(),
            later,
        );
        assert!(matches!(eval, Evaluation::Skipped(Skip::StaleData { .. })));
    }

    #[test]
    fn telemetry_partial_message_keeps_gaps() {
        let msg: TelemetryMsg = serde_json::from_str(r#"{"temp":30.0}"#).unwrap();
        let now = OffsetDateTime::now_utc();
        let s = msg.into_sample(now);
        assert_eq!(s.temp, Some(30.0));
        assert_eq!(s.hum_soil, None);
        assert_eq!(s.timestamp, now);
    }

    #[test]
    fn telemetry_extra_fields_ignored() {
        let msg: TelemetryMsg = serde_json::from_str(r#"{"rssi":-70,"hum_soil":40}"#).unwrap();
        assert_eq!(msg.hum_soil, Some(40.0));
    }

    #[test]
    fn telemetry_wrong_type_fails() {
        assert!(serde_json::from_str::<TelemetryMsg>(r#"{"temp":"hot"}"#).is_err());
    }
}
