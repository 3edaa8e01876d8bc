//! Command dispatcher.
//!
//! Every device has a lane: a FIFO async mutex held for the whole delivery,
//! so commands for one device leave in call order. The lane also carries
//! the rate-limit clock and the pending shutoff timer per actuator.
//!
//! Scheduled shutoffs are reported on a channel because nobody is waiting
//! on them when they fire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ControlError;
use crate::model::{Action, Actuator, CommandRequest, DeviceStatus, Origin};
use crate::registry::DeviceRegistry;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// At most one accepted command per device inside this window.
    pub rate_window: Duration,
    /// Pause before the single transport retry.
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReceipt {
    pub device_id: String,
    pub action: Action,
    /// Set when a shutoff was armed.
    pub shutoff_in: Option<Duration>,
}

/// Outcome of a scheduled shutoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutoffReport {
    pub device_id: String,
    pub action: Action,
    /// Origin of the command that armed the timer.
    pub origin: Origin,
    pub result: Result<(), String>,
}

struct PendingShutoff {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Lane {
    last_accepted: Option<Instant>,
    pending: HashMap<Actuator, PendingShutoff>,
    next_generation: u64,
}

struct Inner {
    registry: Arc<dyn DeviceRegistry>,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
    lanes: Mutex<HashMap<String, Arc<Mutex<Lane>>>>,
    reports: mpsc::UnboundedSender<ShutoffReport>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ShutoffReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            registry,
            transport,
            config,
            lanes: Mutex::new(HashMap::new()),
            reports,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Deliver one command.
    ///
    /// Checks run in order: device known, device ONLINE, rate window, then
    /// the transport with one retry. A shutoff timer is armed only after a
    /// successful delivery.
    pub async fn dispatch(&self, req: CommandRequest) -> Result<DispatchReceipt, ControlError> {
        let device = self
            .inner
            .registry
            .device(&req.device_id)
            .await
            .ok_or_else(|| ControlError::UnknownDevice(req.device_id.clone()))?;

        if device.status != DeviceStatus::Online {
            return Err(ControlError::DeviceOffline {
                device_id: req.device_id,
            });
        }

        let lane_ref = self.inner.lane(&req.device_id).await;
        let mut lane = lane_ref.lock().await;

        if let Some(last) = lane.last_accepted {
            let elapsed = Instant::now().saturating_duration_since(last);
            if elapsed < self.inner.config.rate_window {
                return Err(ControlError::RateLimited {
                    device_id: req.device_id,
                    retry_after: self.inner.config.rate_window - elapsed,
                });
            }
        }

        self.inner.deliver(&req.device_id, req.action).await?;
        lane.last_accepted = Some(Instant::now());

        let actuator = req.action.actuator();
        if let Some(old) = lane.pending.remove(&actuator) {
            old.handle.abort();
            info!(device = %req.device_id, actuator = actuator.as_str(), "pending shutoff superseded");
        }

        let shutoff_in = match req.run_for {
            Some(run_for) if req.action.is_on() => {
                let generation = lane.next_generation;
                lane.next_generation += 1;
                let handle = self.arm_shutoff(
                    lane_ref.clone(),
                    req.device_id.clone(),
                    req.action.off_counterpart(),
                    req.origin,
                    run_for,
                    generation,
                );
                lane.pending
                    .insert(actuator, PendingShutoff { generation, handle });
                Some(run_for)
            }
            _ => None,
        };

        info!(
            device = %req.device_id,
            action = %req.action,
            origin = %req.origin,
            shutoff_secs = shutoff_in.map(|d| d.as_secs()),
            latency_ms = (OffsetDateTime::now_utc() - req.issued_at).whole_milliseconds() as i64,
            "command accepted"
        );

        Ok(DispatchReceipt {
            device_id: req.device_id,
            action: req.action,
            shutoff_in,
        })
    }

    /// Whether a shutoff for this actuator is still pending.
    pub async fn is_running(&self, device_id: &str, actuator: Actuator) -> bool {
        let lane_ref = {
            let lanes = self.inner.lanes.lock().await;
            match lanes.get(device_id) {
                Some(l) => l.clone(),
                None => return false,
            }
        };
        let lane = lane_ref.lock().await;
        lane.pending
            .get(&actuator)
            .is_some_and(|p| !p.handle.is_finished())
    }

    fn arm_shutoff(
        &self,
        lane_ref: Arc<Mutex<Lane>>,
        device_id: String,
        off: Action,
        origin: Origin,
        run_for: Duration,
        generation: u64,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(run_for).await;

            let mut lane = lane_ref.lock().await;
            let actuator = off.actuator();
            if lane.pending.get(&actuator).map(|p| p.generation) != Some(generation) {
                return;
            }
            lane.pending.remove(&actuator);

            // No rate limit and no status check: the actuator must stop.
            let result = inner.deliver(&device_id, off).await;
            match &result {
                Ok(()) => {
                    lane.last_accepted = Some(Instant::now());
                    info!(device = %device_id, action = %off, "scheduled shutoff delivered");
                }
                Err(e) => warn!(device = %device_id, action = %off, error = %e, "scheduled shutoff failed"),
            }

            let _ = inner.reports.send(ShutoffReport {
                device_id,
                action: off,
                origin,
                result: result.map_err(|e| e.to_string()),
            });
        })
    }
}

impl Inner {
    async fn lane(&self, device_id: &str) -> Arc<Mutex<Lane>> {
        self.lanes
            .lock()
            .await
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// One send plus one retry after `retry_delay`.
    async fn deliver(&self, device_id: &str, action: Action) -> Result<(), ControlError> {
        let first = match self.transport.send_command(device_id, action).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let reason = format!("{first:#}");
        warn!(device = %device_id, %action, error = %reason, "send failed, retrying once");

        tokio::time::sleep(self.config.retry_delay).await;
        self.transport
            .send_command(device_id, action)
            .await
            .map_err(|e| ControlError::Transport {
                device_id: device_id.to_string(),
                reason: format!("{e:#}"),
            })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SensorSample;
    use crate::registry::TelemetryRegistry;
    use crate::transport::testing::RecordingTransport;

    const WINDOW: Duration = Duration::from_secs(5);
    const RETRY: Duration = Duration::from_millis(500);

    struct Harness {
        dispatcher: Dispatcher,
        reports: mpsc::UnboundedReceiver<ShutoffReport>,
        registry: TelemetryRegistry,
        transport: RecordingTransport,
    }

    async fn harness_with_window(window: Duration) -> Harness {
        let registry = TelemetryRegistry::new();
        registry.register("d1", "Node 1", Some("z1")).await;
        registry.register("d2", "Node 2", Some("z2")).await;
        bring_online(&registry, "d1").await;
        bring_online(&registry, "d2").await;

        let transport = RecordingTransport::new();
        let (dispatcher, reports) = Dispatcher::new(
            Arc::new(registry.clone()),
            Arc::new(transport.clone()),
            DispatchConfig {
                rate_window: window,
                retry_delay: RETRY,
            },
        );
        Harness {
            dispatcher,
            reports,
            registry,
            transport,
        }
    }

    async fn harness() -> Harness {
        harness_with_window(WINDOW).await
    }

    async fn bring_online(registry: &TelemetryRegistry, id: &str) {
        let sample = SensorSample {
            temp: Some(22.0),
            hum_soil: Some(50.0),
            hum_air: None,
            light: None,
            timestamp: OffsetDateTime::now_utc(),
        };
        registry.record_sample(id, sample).await;
    }

    fn req(device: &str, action: Action) -> CommandRequest {
        CommandRequest::new(device, action, Origin::Manual)
    }

    fn timed(device: &str, action: Action, secs: u64) -> CommandRequest {
        req(device, action).run_for(Some(Duration::from_secs(secs)))
    }

    // -- Acceptance + rate limit -------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn accepted_command_reaches_transport() {
        let h = harness().await;
        let receipt = h.dispatcher.dispatch(req("d1", Action::LightOn)).await.unwrap();
        assert_eq!(receipt.action, Action::LightOn);
        assert_eq!(receipt.shutoff_in, None);
        assert_eq!(h.transport.sent(), vec![("d1".to_string(), Action::LightOn)]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_command_inside_window_is_rate_limited() {
        let h = harness().await;
        h.dispatcher.dispatch(req("d1", Action::LightOn)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        match h.dispatcher.dispatch(req("d1", Action::LightOff)).await {
            Err(ControlError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(3));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(h.transport.attempts(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.dispatcher.dispatch(req("d1", Action::LightOff)).await.unwrap();
        assert_eq!(h.transport.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_per_device() {
        let h = harness().await;
        h.dispatcher.dispatch(req("d1", Action::LightOn)).await.unwrap();
        h.dispatcher.dispatch(req("d2", Action::LightOn)).await.unwrap();
        assert_eq!(h.transport.sent().len(), 2);
    }

    // -- Device checks -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn offline_device_never_reaches_transport() {
        let h = harness().await;
        h.registry.set_status("d1", DeviceStatus::Offline).await;
        let err = h.dispatcher.dispatch(req("d1", Action::PumpOn)).await.unwrap_err();
        assert!(matches!(err, ControlError::DeviceOffline { .. }));
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_counts_as_not_online() {
        let h = harness().await;
        h.registry.set_status("d1", DeviceStatus::Error).await;
        let err = h.dispatcher.dispatch(req("d1", Action::PumpOn)).await.unwrap_err();
        assert_eq!(err.code(), "device_offline");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_is_reported() {
        let h = harness().await;
        let err = h.dispatcher.dispatch(req("ghost", Action::PumpOn)).await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownDevice(ref id) if id == "ghost"));
    }

    // -- Transport retry -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn single_failure_is_retried_once() {
        let h = harness().await;
        h.transport.fail_next(1);
        let start = Instant::now();
        h.dispatcher.dispatch(req("d1", Action::MistOn)).await.unwrap();
        assert_eq!(h.transport.attempts(), 2);
        assert_eq!(h.transport.sent().len(), 1);
        assert!(start.elapsed() >= RETRY);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_surface_and_arm_nothing() {
        let mut h = harness().await;
        h.transport.fail_next(2);
        let err = h
            .dispatcher
            .dispatch(timed("d1", Action::PumpOn, 30))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Transport { .. }));
        assert_eq!(h.transport.attempts(), 2);
        assert!(!h.dispatcher.is_running("d1", Actuator::Pump).await);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.transport.sent().is_empty());
        assert!(h.reports.try_recv().is_err());

        // A failed delivery does not start the rate window.
        h.dispatcher.dispatch(req("d1", Action::PumpOn)).await.unwrap();
    }

    // -- Scheduled shutoff -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn shutoff_fires_after_run_time() {
        let mut h = harness().await;
        let receipt = h.dispatcher.dispatch(timed("d1", Action::PumpOn, 30)).await.unwrap();
        assert_eq!(receipt.shutoff_in, Some(Duration::from_secs(30)));
        assert!(h.dispatcher.is_running("d1", Actuator::Pump).await);

        tokio::time::sleep(Duration::from_secs(31)).await;

        let sent = h.transport.sent_at();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, Action::PumpOn);
        assert_eq!(sent[1].0, Action::PumpOff);
        assert_eq!(sent[1].1 - sent[0].1, Duration::from_secs(30));
        assert!(!h.dispatcher.is_running("d1", Actuator::Pump).await);

        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.action, Action::PumpOff);
        assert_eq!(report.origin, Origin::Manual);
        assert_eq!(report.result, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_off_cancels_pending_shutoff() {
        let mut h = harness().await;
        h.dispatcher.dispatch(timed("d1", Action::PumpOn, 30)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        h.dispatcher.dispatch(req("d1", Action::PumpOff)).await.unwrap();
        assert!(!h.dispatcher.is_running("d1", Actuator::Pump).await);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let actions: Vec<Action> = h.transport.sent().into_iter().map(|(_, a)| a).collect();
        assert_eq!(actions, vec![Action::PumpOn, Action::PumpOff]);
        assert!(h.reports.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_on_restarts_the_timer() {
        let h = harness().await;
        h.dispatcher.dispatch(timed("d1", Action::PumpOn, 30)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        h.dispatcher.dispatch(timed("d1", Action::PumpOn, 30)).await.unwrap();

        // The first timer would have fired at t=30.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(h.transport.sent().len(), 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        let sent = h.transport.sent_at();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].0, Action::PumpOff);
        assert_eq!(sent[2].1 - sent[1].1, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn other_actuator_does_not_cancel_shutoff() {
        let h = harness().await;
        h.dispatcher.dispatch(timed("d1", Action::PumpOn, 30)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        h.dispatcher.dispatch(req("d1", Action::LightOn)).await.unwrap();
        assert!(h.dispatcher.is_running("d1", Actuator::Pump).await);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let actions: Vec<Action> = h.transport.sent().into_iter().map(|(_, a)| a).collect();
        assert_eq!(actions, vec![Action::PumpOn, Action::LightOn, Action::PumpOff]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutoff_ignores_status_and_counts_for_rate_limit() {
        let h = harness().await;
        h.dispatcher.dispatch(timed("d1", Action::MistOn, 20)).await.unwrap();
        h.registry.set_status("d1", DeviceStatus::Offline).await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(h.transport.sent().last().map(|(_, a)| *a), Some(Action::MistOff));

        bring_online(&h.registry, "d1").await;
        let err = h.dispatcher.dispatch(req("d1", Action::MistOn)).await.unwrap_err();
        assert!(err.is_backpressure());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_shutoff_is_retried_and_reported() {
        let mut h = harness().await;
        h.dispatcher.dispatch(timed("d1", Action::PumpOn, 10)).await.unwrap();
        h.transport.fail_next(2);

        tokio::time::sleep(Duration::from_secs(12)).await;
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.action, Action::PumpOff);
        assert!(report.result.is_err());
        assert_eq!(h.transport.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn off_command_ignores_run_time() {
        let h = harness().await;
        let receipt = h.dispatcher.dispatch(timed("d1", Action::PumpOff, 30)).await.unwrap();
        assert_eq!(receipt.shutoff_in, None);
        assert!(!h.dispatcher.is_running("d1", Actuator::Pump).await);
    }

    // -- Ordering -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn commands_for_one_device_leave_in_call_order() {
        let h = harness_with_window(Duration::ZERO).await;
        // The first send fails and holds the lane through the retry delay.
        h.transport.fail_next(1);

        let (a, b) = tokio::join!(
            h.dispatcher.dispatch(req("d1", Action::PumpOn)),
            async {
                tokio::task::yield_now().await;
                h.dispatcher.dispatch(req("d1", Action::PumpOff)).await
            }
        );
        a.unwrap();
        b.unwrap();

        let actions: Vec<Action> = h.transport.sent().into_iter().map(|(_, a)| a).collect();
        assert_eq!(actions, vec![Action::PumpOn, Action::PumpOff]);
    }
}
