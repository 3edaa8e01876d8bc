//! Stateful greenhouse environment simulator for local development.
//!
//! Models one node's surroundings closely enough to exercise the hub:
//! - Random walk with mean reversion for every channel
//! - Soil drying drift, faster when it is hot
//! - Diurnal (day/night) temperature and light cycle
//! - Actuator feedback: the pump wets the soil, the mist cools the air and
//!   raises humidity, the grow light adds lux
//! - Occasional dropped channels (flaky sensors report nothing)

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Warm, soil drying at a steady pace. Crosses the default moisture
    /// floor within a few minutes.
    Drying,
    /// Hot afternoon. Temperature climbs past the heat-shock threshold.
    Heatwave,
    /// Comfortable conditions, low noise. Nothing should fire.
    Stable,
    /// Noisy readings and ~10% dropped channels.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "heatwave" => Self::Heatwave,
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Heatwave => write!(f, "heatwave"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

struct Profile {
    start_temp: f64,
    start_soil: f64,
    /// Temperature the walk reverts toward during the day peak.
    target_temp: f64,
    /// Percentage points of soil moisture lost per tick at 25 °C.
    soil_drift: f64,
    noise: f64,
    dropout_prob: f32,
}

impl Profile {
    fn for_scenario(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Drying => Profile {
                start_temp: 26.0,
                start_soil: 45.0,
                target_temp: 27.0,
                soil_drift: 0.6,
                noise: 0.3,
                dropout_prob: 0.0,
            },
            Scenario::Heatwave => Profile {
                start_temp: 31.0,
                start_soil: 50.0,
                target_temp: 38.0,
                soil_drift: 0.4,
                noise: 0.3,
                dropout_prob: 0.0,
            },
            Scenario::Stable => Profile {
                start_temp: 24.0,
                start_soil: 55.0,
                target_temp: 24.0,
                soil_drift: 0.02,
                noise: 0.1,
                dropout_prob: 0.0,
            },
            Scenario::Flaky => Profile {
                start_temp: 26.0,
                start_soil: 45.0,
                target_temp: 27.0,
                soil_drift: 0.4,
                noise: 1.5,
                dropout_prob: 0.10,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Readings and actuators
// ---------------------------------------------------------------------------

/// One tick of sensor output. `None` means the channel dropped out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temp: Option<f64>,
    pub hum_air: Option<f64>,
    pub hum_soil: Option<f64>,
    pub light: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuator {
    Pump,
    Mist,
    Light,
}

impl Actuator {
    /// Parse the wire name used in control messages (`PUMP`, `MIST`, `LIGHT`).
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "PUMP" => Some(Self::Pump),
            "MIST" => Some(Self::Mist),
            "LIGHT" => Some(Self::Light),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct EnvironmentSim {
    profile: Profile,

    // True state, evolved every tick.
    temp: f64,
    hum_air: f64,
    hum_soil: f64,

    // Diurnal cycle
    tick: u64,
    ticks_per_day: f64,

    pump: bool,
    mist: bool,
    light: bool,
}

impl EnvironmentSim {
    /// `ticks_per_day` sets the day/night cycle length in samples. Use a
    /// small number (e.g. 120) for fast dev iteration.
    pub fn new(scenario: Scenario, ticks_per_day: u64) -> Self {
        let profile = Profile::for_scenario(scenario);
        Self {
            temp: profile.start_temp,
            hum_air: 60.0,
            hum_soil: profile.start_soil,
            profile,
            tick: 0,
            ticks_per_day: ticks_per_day.max(1) as f64,
            pump: false,
            mist: false,
            light: false,
        }
    }

    pub fn set_actuator(&mut self, actuator: Actuator, on: bool) {
        match actuator {
            Actuator::Pump => self.pump = on,
            Actuator::Mist => self.mist = on,
            Actuator::Light => self.light = on,
        }
    }

    pub fn actuator(&self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Pump => self.pump,
            Actuator::Mist => self.mist,
            Actuator::Light => self.light,
        }
    }

    /// 0.0 at midnight, 1.0 at the afternoon peak.
    fn daylight(&self) -> f64 {
        let phase = 2.0 * std::f64::consts::PI * self.tick as f64 / self.ticks_per_day;
        (1.0 - phase.cos()) / 2.0
    }

    /// Advance the environment one tick and read every sensor.
    pub fn step(&mut self) -> Reading {
        self.tick += 1;
        let daylight = self.daylight();
        let p = &self.profile;

        // -- Temperature --------------------------------------------------
        let target = p.target_temp - 6.0 * (1.0 - daylight);
        let mut temp = self.temp + 0.1 * (target - self.temp) + gaussian(0.0, p.noise * 0.5);
        if self.mist {
            temp -= 0.8;
        }
        self.temp = temp.clamp(-10.0, 55.0);

        // -- Air humidity -------------------------------------------------
        let mut hum_air = self.hum_air + 0.05 * (60.0 - self.hum_air) + gaussian(0.0, p.noise);
        if self.mist {
            hum_air += 4.0;
        }
        self.hum_air = hum_air.clamp(0.0, 100.0);

        // -- Soil moisture ------------------------------------------------
        let heat = (self.temp / 25.0).max(0.2);
        let mut hum_soil = self.hum_soil - p.soil_drift * heat + gaussian(0.0, p.noise * 0.2);
        if self.pump {
            hum_soil += 3.0;
        }
        self.hum_soil = hum_soil.clamp(0.0, 100.0);

        // -- Light --------------------------------------------------------
        let sun = 20_000.0 * daylight;
        let lamp = if self.light { 8_000.0 } else { 0.0 };
        let light = (sun + lamp + gaussian(0.0, 200.0 * p.noise)).max(0.0);

        let dropout = p.dropout_prob;
        let keep = |v: f64| (fastrand::f32() >= dropout).then_some(round1(v));
        Reading {
            temp: keep(self.temp),
            hum_air: keep(self.hum_air),
            hum_soil: keep(self.hum_soil),
            light: keep(light),
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
