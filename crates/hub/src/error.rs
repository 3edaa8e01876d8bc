//! Controller error taxonomy. Every variant maps to its own machine code and
//! message so an operator can tell them apart.

use std::time::Duration;

use crate::model::ModeTransition;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Manual command (or unconfirmed switch) while the AI owns the zone, or
    /// an AI command while the operator owns it.
    #[error("zone {zone_id} is in {} mode; confirm the switch to {} first", .required.from_mode, .required.to_mode)]
    ModeConflict { zone_id: String, required: ModeTransition },

    #[error("command for device {device_id} suppressed by rate limit; retry in {} ms", .retry_after.as_millis())]
    RateLimited { device_id: String, retry_after: Duration },

    #[error("device {device_id} is offline; command was not sent")]
    DeviceOffline { device_id: String },

    #[error("device {device_id} unreachable: {reason}")]
    Transport { device_id: String, reason: String },

    #[error("unknown zone {0}")]
    UnknownZone(String),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("zone {0} has no device bound to it")]
    NoDevice(String),

    #[error("invalid zone setting: {}", .0.join("; "))]
    InvalidSetting(Vec<String>),

    #[error("storage error: {0}")]
    Store(String),
}

impl ControlError {
    /// Stable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModeConflict { .. } => "mode_conflict",
            Self::RateLimited { .. } => "rate_limited",
            Self::DeviceOffline { .. } => "device_offline",
            Self::Transport { .. } => "transport_error",
            Self::UnknownZone(_) => "unknown_zone",
            Self::UnknownDevice(_) => "unknown_device",
            Self::NoDevice(_) => "no_device",
            Self::InvalidSetting(_) => "invalid_setting",
            Self::Store(_) => "storage_error",
        }
    }

    /// `RateLimited` is normal backpressure, not a failure.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

impl From<sqlx::Error> for ControlError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ZoneMode;

    fn all_errors() -> Vec<ControlError> {
        vec![
            ControlError::ModeConflict {
                zone_id: "z1".into(),
                required: ModeTransition {
                    zone_id: "z1".into(),
                    from_mode: ZoneMode::Auto,
                    to_mode: ZoneMode::Manual,
                    confirmed: true,
                },
            },
            ControlError::RateLimited {
                device_id: "d1".into(),
                retry_after: Duration::from_millis(1500),
            },
            ControlError::DeviceOffline {
                device_id: "d1".into(),
            },
            ControlError::Transport {
                device_id: "d1".into(),
                reason: "broker disconnected".into(),
            },
        ]
    }

    #[test]
    fn operator_facing_messages_do_not_overlap() {
        let msgs: Vec<String> = all_errors().iter().map(|e| e.to_string()).collect();
        assert!(msgs[0].contains("confirm the switch to MANUAL"));
        assert!(msgs[1].contains("rate limit; retry in 1500 ms"));
        assert!(msgs[2].contains("offline"));
        assert!(msgs[3].contains("unreachable"));
        for (i, a) in msgs.iter().enumerate() {
            for b in msgs.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn codes_are_distinct() {
        let mut codes: Vec<&str> = all_errors().iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 4);
    }

    #[test]
    fn only_rate_limit_is_backpressure() {
        let errs = all_errors();
        assert!(!errs[0].is_backpressure());
        assert!(errs[1].is_backpressure());
        assert!(!errs[2].is_backpressure());
        assert!(!errs[3].is_backpressure());
    }
}
