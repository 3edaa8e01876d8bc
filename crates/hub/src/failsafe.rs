//! Fail-safe evaluator: rule-based safety net for zones in MANUAL mode.
//!
//! Pure: no I/O, no clock reads. The caller supplies the sample, the zone
//! setting and "now".

use std::time::Duration;

use time::OffsetDateTime;

use crate::model::{Action, Origin, SensorSample, ZoneSetting};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedAction {
    pub action: Action,
    pub run_for: Duration,
    pub origin: Origin,
}

/// Why an evaluation produced nothing. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    NoSample,
    StaleData { age: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Proposals(Vec<ProposedAction>),
    Skipped(Skip),
}

impl Evaluation {
    pub fn proposals(&self) -> &[ProposedAction] {
        match self {
            Self::Proposals(p) => p,
            Self::Skipped(_) => &[],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    /// Samples older than this never trigger anything.
    pub freshness_window: Duration,
}

impl Evaluator {
    pub fn new(freshness_window: Duration) -> Self {
        Self { freshness_window }
    }

    pub fn evaluate(
        &self,
        sample: Option<&SensorSample>,
        setting: &ZoneSetting,
        now: OffsetDateTime,
    ) -> Evaluation {
        let Some(sample) = sample else {
            return Evaluation::Skipped(Skip::NoSample);
        };

        // A timestamp in the future (clock skew) counts as age zero.
        let age: Duration = (now - sample.timestamp).try_into().unwrap_or(Duration::ZERO);
        if age > self.freshness_window {
            return Evaluation::Skipped(Skip::StaleData { age });
        }

        let mut proposals = Vec::with_capacity(2);

        if let Some(hum_soil) = sample.hum_soil {
            if hum_soil < setting.min_soil_moisture {
                proposals.push(ProposedAction {
                    action: Action::PumpOn,
                    run_for: Duration::from_secs(setting.pump_duration.max(0) as u64),
                    origin: Origin::Failsafe,
                });
            }
        }

        if let Some(temp) = sample.temp {
            if temp >= setting.heat_shock_temp {
                proposals.push(ProposedAction {
                    action: Action::MistOn,
                    run_for: Duration::from_secs(setting.mist_duration.max(0) as u64),
                    origin: Origin::Failsafe,
                });
            }
        }

        Evaluation::Proposals(proposals)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
