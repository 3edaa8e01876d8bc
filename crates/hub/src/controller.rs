//! Zone automation controller.
//!
//! One worker per zone runs the poll cycle. Operator requests, AI requests
//! and the poll tick for a zone all go through the same per-zone lock, so
//! the guard decision and the dispatch it authorizes see the same mode.
//!
//! ```text
//!   tick ─▶ settings ─▶ AUTO?  ── yes ──▶ done
//!                         │ no
//!                         ▼
//!           primary device sample ─▶ evaluator ─▶ dispatch (FAILSAFE)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchReceipt, Dispatcher, ShutoffReport};
use crate::error::ControlError;
use crate::failsafe::{Evaluation, Evaluator, Skip};
use crate::guard::{self, Transition};
use crate::model::{
    Action, ActionRecord, CommandRequest, Device, Origin, Outcome, PrimaryDevice, ThresholdUpdate,
    ZoneMode, ZoneSetting, ZoneStatus,
};
use crate::registry::DeviceRegistry;
use crate::state::SharedState;
use crate::store::{AuditLog, ThresholdStore};

#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub poll_interval: Duration,
    pub freshness_window: Duration,
}

/// Heat shock that outlasts this much misting gets escalated to the operator.
const HEAT_ESCALATE_AFTER: Duration = Duration::from_secs(15 * 60);

/// What one poll did with each fail-safe proposal.
pub type PollOutcome = Vec<(Action, Result<DispatchReceipt, ControlError>)>;

struct Inner {
    store: Arc<dyn ThresholdStore>,
    audit: Arc<dyn AuditLog>,
    registry: Arc<dyn DeviceRegistry>,
    dispatcher: Dispatcher,
    evaluator: Evaluator,
    shared: SharedState,
    poll_interval: Duration,
    heat_escalate_after: Duration,
    zone_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    heat_incidents: Mutex<HashMap<String, HeatIncident>>,
}

/// A zone whose fail-safe keeps asking for mist.
struct HeatIncident {
    since: Instant,
    escalated: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum HeatTrack {
    Quiet,
    Ongoing,
    Escalate(Duration),
    Cleared(Duration),
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ThresholdStore>,
        audit: Arc<dyn AuditLog>,
        registry: Arc<dyn DeviceRegistry>,
        dispatcher: Dispatcher,
        shared: SharedState,
        config: ControllerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                audit,
                registry,
                dispatcher,
                evaluator: Evaluator::new(config.freshness_window),
                shared,
                poll_interval: config.poll_interval,
                heat_escalate_after: HEAT_ESCALATE_AFTER,
                zone_locks: Mutex::new(HashMap::new()),
                heat_incidents: Mutex::new(HashMap::new()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Operator API
    // -----------------------------------------------------------------------

    pub async fn request_mode_change(
        &self,
        zone_id: &str,
        target: ZoneMode,
        confirmed: bool,
    ) -> Result<ZoneMode, ControlError> {
        let lock = self.inner.zone_lock(zone_id).await?;
        let _held = lock.lock().await;

        let mut setting = self.inner.store.get_settings(zone_id).await?;
        let transition = guard::request_transition(zone_id, setting.mode, target, confirmed)?;

        if let Transition::Changed(t) = &transition {
            setting.mode = t.to_mode;
            self.inner.store.put_settings(zone_id, &setting).await?;
            info!(zone = %zone_id, from = %t.from_mode, to = %t.to_mode, confirmed, "mode changed");
            self.inner
                .shared
                .write()
                .await
                .record_mode(zone_id, t.from_mode, t.to_mode);
        }

        Ok(transition.new_mode())
    }

    pub async fn request_manual_action(
        &self,
        zone_id: &str,
        action: Action,
    ) -> Result<DispatchReceipt, ControlError> {
        self.command(zone_id, action, Origin::Manual).await
    }

    /// Entry point for the external AI decision source. Only honoured in
    /// AUTO mode.
    pub async fn request_ai_action(
        &self,
        zone_id: &str,
        action: Action,
    ) -> Result<DispatchReceipt, ControlError> {
        self.command(zone_id, action, Origin::AiModel).await
    }

    /// Edit thresholds and run times. The mode is never touched here.
    pub async fn update_thresholds(
        &self,
        zone_id: &str,
        update: &ThresholdUpdate,
    ) -> Result<ZoneSetting, ControlError> {
        let lock = self.inner.zone_lock(zone_id).await?;
        let _held = lock.lock().await;

        let current = self.inner.store.get_settings(zone_id).await?;
        let next = update.apply_to(&current);
        let violations = next.violations();
        if !violations.is_empty() {
            return Err(ControlError::InvalidSetting(violations));
        }

        self.inner.store.put_settings(zone_id, &next).await?;
        info!(
            zone = %zone_id,
            min_soil = next.min_soil_moisture,
            max_soil = next.max_soil_moisture,
            heat_shock = next.heat_shock_temp,
            pump_sec = next.pump_duration,
            mist_sec = next.mist_duration,
            "thresholds updated"
        );
        self.inner
            .shared
            .write()
            .await
            .record_system(format!("{zone_id} thresholds updated"));
        Ok(next)
    }

    pub async fn zone_status(&self, zone_id: &str) -> Result<ZoneStatus, ControlError> {
        let setting = self.inner.store.get_settings(zone_id).await?;
        let primary = self.inner.primary_device(zone_id).await;
        let last_action = self.inner.shared.read().await.last_action(zone_id);

        Ok(ZoneStatus {
            zone_id: zone_id.to_string(),
            mode: setting.mode,
            last_sample: primary.as_ref().and_then(|d| d.last_sample),
            primary_device: primary.map(|d| PrimaryDevice {
                device_id: d.device_id,
                status: d.status,
            }),
            last_action,
        })
    }

    pub async fn all_zone_status(&self) -> Result<Vec<ZoneStatus>, ControlError> {
        let zones = self.inner.store.list_zones().await?;
        let mut out = Vec::with_capacity(zones.len());
        for z in zones {
            out.push(self.zone_status(&z.zone_id).await?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Poll cycle
    // -----------------------------------------------------------------------

    /// One poll for one zone. AUTO zones, zones without a device and skipped
    /// evaluations yield an empty outcome.
    pub async fn poll_zone(&self, zone_id: &str) -> Result<PollOutcome, ControlError> {
        let lock = self.inner.zone_lock(zone_id).await?;
        let _held = lock.lock().await;

        let setting = self.inner.store.get_settings(zone_id).await?;
        if setting.mode == ZoneMode::Auto {
            self.inner.track_heat(zone_id, false).await;
            return Ok(Vec::new());
        }

        let Some(primary) = self.inner.primary_device(zone_id).await else {
            debug!(zone = %zone_id, "no device bound, nothing to evaluate");
            return Ok(Vec::new());
        };

        let evaluation = self.inner.evaluator.evaluate(
            primary.last_sample.as_ref(),
            &setting,
            OffsetDateTime::now_utc(),
        );

        let proposals = match evaluation {
            Evaluation::Proposals(p) => p,
            Evaluation::Skipped(Skip::NoSample) => {
                debug!(zone = %zone_id, device = %primary.device_id, "no sample yet");
                return Ok(Vec::new());
            }
            Evaluation::Skipped(Skip::StaleData { age }) => {
                debug!(zone = %zone_id, device = %primary.device_id, age_secs = age.as_secs(), "stale sample, skipping");
                return Ok(Vec::new());
            }
        };

        let hot = proposals.iter().any(|p| p.action == Action::MistOn);
        match self.inner.track_heat(zone_id, hot).await {
            HeatTrack::Escalate(lasted) => {
                warn!(zone = %zone_id, minutes = lasted.as_secs() / 60, "heat shock persists despite misting");
                self.inner.shared.write().await.record_escalation(
                    zone_id,
                    format!("heat shock for {} min despite misting, check the site", lasted.as_secs() / 60),
                );
            }
            HeatTrack::Cleared(lasted) => {
                info!(zone = %zone_id, minutes = lasted.as_secs() / 60, "heat shock cleared");
                self.inner
                    .shared
                    .write()
                    .await
                    .record_failsafe(zone_id, format!("heat shock cleared after {} min", lasted.as_secs() / 60));
            }
            HeatTrack::Quiet | HeatTrack::Ongoing => {}
        }

        let mut outcome = Vec::with_capacity(proposals.len());
        for p in proposals {
            if self
                .inner
                .dispatcher
                .is_running(&primary.device_id, p.action.actuator())
                .await
            {
                debug!(zone = %zone_id, action = %p.action, "already running");
                continue;
            }

            info!(zone = %zone_id, device = %primary.device_id, action = %p.action, "fail-safe triggered");
            self.inner
                .shared
                .write()
                .await
                .record_failsafe(zone_id, format!("{} triggered", p.action));

            let req = CommandRequest::new(&primary.device_id, p.action, p.origin).run_for(Some(p.run_for));
            let result = self.inner.dispatcher.dispatch(req).await;
            match &result {
                Err(e) if e.is_backpressure() => debug!(zone = %zone_id, error = %e, "fail-safe deferred"),
                Err(e) => warn!(zone = %zone_id, error = %e, "fail-safe dispatch failed"),
                Ok(_) => {}
            }
            self.inner
                .audit_dispatch(zone_id, &primary.device_id, p.action, p.origin, &result)
                .await;
            outcome.push((p.action, result));
        }

        Ok(outcome)
    }

    /// Spawn one poll worker per zone known to the store.
    pub async fn spawn_workers(&self) -> Result<Vec<JoinHandle<()>>, ControlError> {
        let zones = self.inner.store.list_zones().await?;
        let mut handles = Vec::with_capacity(zones.len());

        for zone in zones {
            let ctl = self.clone();
            let period = self.inner.poll_interval;
            handles.push(tokio::spawn(async move {
                let zone_id = zone.zone_id;
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(zone = %zone_id, poll_sec = period.as_secs(), "zone worker started");

                loop {
                    ticker.tick().await;
                    if let Err(e) = ctl.poll_zone(&zone_id).await {
                        warn!(zone = %zone_id, error = %e, "poll failed");
                        ctl.inner
                            .shared
                            .write()
                            .await
                            .record_error(format!("{zone_id}: poll failed: {e}"));
                    }
                }
            }));
        }

        Ok(handles)
    }

    /// Audit scheduled shutoffs as the dispatcher reports them.
    pub fn spawn_shutoff_recorder(
        &self,
        mut reports: mpsc::UnboundedReceiver<ShutoffReport>,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                let zone_id = inner
                    .registry
                    .device(&report.device_id)
                    .await
                    .and_then(|d| d.zone_id);
                let (outcome, detail) = match &report.result {
                    Ok(()) => (Outcome::Shutoff, String::new()),
                    Err(reason) => (Outcome::TransportError, format!("scheduled shutoff: {reason}")),
                };
                inner
                    .record(ActionRecord {
                        ts: OffsetDateTime::now_utc(),
                        zone_id,
                        device_id: report.device_id,
                        action: report.action,
                        origin: report.origin,
                        outcome,
                        detail,
                    })
                    .await;
            }
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn command(
        &self,
        zone_id: &str,
        action: Action,
        origin: Origin,
    ) -> Result<DispatchReceipt, ControlError> {
        let lock = self.inner.zone_lock(zone_id).await?;
        let _held = lock.lock().await;

        let setting = self.inner.store.get_settings(zone_id).await?;
        // Mode first: a conflict is reported whatever the device state.
        guard::authorize_command(zone_id, setting.mode, origin)?;

        let primary = self
            .inner
            .primary_device(zone_id)
            .await
            .ok_or_else(|| ControlError::NoDevice(zone_id.to_string()))?;

        let req = CommandRequest::new(&primary.device_id, action, origin)
            .run_for(setting.run_time_for(action));
        let result = self.inner.dispatcher.dispatch(req).await;
        self.inner
            .audit_dispatch(zone_id, &primary.device_id, action, origin, &result)
            .await;
        result
    }
}

impl Inner {
    /// Per-zone lock. Unknown zones are refused before an entry is made, so
    /// the map only ever holds zones the store knows.
    async fn zone_lock(&self, zone_id: &str) -> Result<Arc<Mutex<()>>, ControlError> {
        if let Some(lock) = self.zone_locks.lock().await.get(zone_id) {
            return Ok(lock.clone());
        }
        self.store.get_settings(zone_id).await?;
        Ok(self
            .zone_locks
            .lock()
            .await
            .entry(zone_id.to_string())
            .or_default()
            .clone())
    }

    /// Track heat shock across polls. `Escalate` is returned once per
    /// incident, on the first poll past the limit.
    async fn track_heat(&self, zone_id: &str, hot: bool) -> HeatTrack {
        let mut incidents = self.heat_incidents.lock().await;
        if !hot {
            return match incidents.remove(zone_id) {
                Some(i) => HeatTrack::Cleared(i.since.elapsed()),
                None => HeatTrack::Quiet,
            };
        }
        let incident = incidents.entry(zone_id.to_string()).or_insert_with(|| HeatIncident {
            since: Instant::now(),
            escalated: false,
        });
        let lasted = incident.since.elapsed();
        if !incident.escalated && lasted > self.heat_escalate_after {
            incident.escalated = true;
            HeatTrack::Escalate(lasted)
        } else {
            HeatTrack::Ongoing
        }
    }

    async fn primary_device(&self, zone_id: &str) -> Option<Device> {
        self.registry.devices_by_zone(zone_id).await.into_iter().next()
    }

    async fn audit_dispatch(
        &self,
        zone_id: &str,
        device_id: &str,
        action: Action,
        origin: Origin,
        result: &Result<DispatchReceipt, ControlError>,
    ) {
        let (outcome, detail) = match result {
            Ok(_) => (Outcome::Accepted, String::new()),
            Err(e @ ControlError::RateLimited { .. }) => (Outcome::RateLimited, e.to_string()),
            Err(e @ ControlError::DeviceOffline { .. }) => (Outcome::DeviceOffline, e.to_string()),
            Err(e @ ControlError::Transport { .. }) => (Outcome::TransportError, e.to_string()),
            // Never reached the dispatch pipeline proper.
            Err(_) => return,
        };

        self.record(ActionRecord {
            ts: OffsetDateTime::now_utc(),
            zone_id: Some(zone_id.to_string()),
            device_id: device_id.to_string(),
            action,
            origin,
            outcome,
            detail,
        })
        .await;
    }

    async fn record(&self, rec: ActionRecord) {
        if let Err(e) = self.audit.record(&rec).await {
            warn!(device = %rec.device_id, error = %e, "audit write failed");
        }
        self.shared.write().await.record_action(&rec);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
