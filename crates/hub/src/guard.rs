//! Mode transition guard.
//!
//! ```text
//!          confirmed = true
//!   AUTO ──────────────────▶ MANUAL
//!    ▲                         │
//!    └──────── always ─────────┘
//! ```
//!
//! Self-transitions succeed without side effects. Leaving AUTO without
//! confirmation is refused and the caller gets back the confirmed transition
//! it has to submit instead.

use crate::error::ControlError;
use crate::model::{ModeTransition, Origin, ZoneMode};

/// Result of an authorized transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Mode already matches; nothing to persist.
    Unchanged(ZoneMode),
    /// Mode changes and must be written back to the store.
    Changed(ModeTransition),
}

impl Transition {
    pub fn new_mode(&self) -> ZoneMode {
        match self {
            Self::Unchanged(m) => *m,
            Self::Changed(t) => t.to_mode,
        }
    }
}

pub fn request_transition(
    zone_id: &str,
    current: ZoneMode,
    target: ZoneMode,
    confirmed: bool,
) -> Result<Transition, ControlError> {
    match (current, target) {
        (from, to) if from == to => Ok(Transition::Unchanged(to)),
        (ZoneMode::Auto, ZoneMode::Manual) if !confirmed => Err(confirmation_required(zone_id)),
        (from, to) => Ok(Transition::Changed(ModeTransition {
            zone_id: zone_id.to_string(),
            from_mode: from,
            to_mode: to,
            confirmed,
        })),
    }
}

/// Check that a command of the given origin may drive the zone right now.
///
/// Manual commands need MANUAL mode; they never switch the mode on their own.
/// AI commands need AUTO mode. Fail-safe commands are only produced while
/// MANUAL and are re-checked the same way.
pub fn authorize_command(zone_id: &str, mode: ZoneMode, origin: Origin) -> Result<(), ControlError> {
    match (origin, mode) {
        (Origin::Manual | Origin::Failsafe, ZoneMode::Manual) => Ok(()),
        (Origin::AiModel, ZoneMode::Auto) => Ok(()),
        (Origin::Manual | Origin::Failsafe, ZoneMode::Auto) => Err(confirmation_required(zone_id)),
        (Origin::AiModel, ZoneMode::Manual) => Err(ControlError::ModeConflict {
            zone_id: zone_id.to_string(),
            required: ModeTransition {
                zone_id: zone_id.to_string(),
                from_mode: ZoneMode::Manual,
                to_mode: ZoneMode::Auto,
                confirmed: false,
            },
        }),
    }
}

fn confirmation_required(zone_id: &str) -> ControlError {
    ControlError::ModeConflict {
        zone_id: zone_id.to_string(),
        required: ModeTransition {
            zone_id: zone_id.to_string(),
            from_mode: ZoneMode::Auto,
            to_mode: ZoneMode::Manual,
            confirmed: true,
        },
    }
}

// ===========================================================================
// Tests
// ===========================================================================
