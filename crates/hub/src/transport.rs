//! Outbound command transport. The dispatcher only knows [`Transport`];
//! [`MqttTransport`] is the production adapter.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::model::Action;
use crate::mqtt::{command_payload, control_topic};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one command to the device link. `Ok` means the link accepted it,
    /// not that the actuator moved.
    async fn send_command(&self, device_id: &str, action: Action) -> Result<()>;
}

/// Publishes `{"device","status"}` to `farm/<device_id>/control`.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    /// Maintained by the event loop in `main`.
    connected: Arc<AtomicBool>,
}

impl MqttTransport {
    pub fn new(client: AsyncClient, connected: Arc<AtomicBool>) -> Self {
        Self { client, connected }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn send_command(&self, device_id: &str, action: Action) -> Result<()> {
        // rumqttc would queue silently while disconnected.
        if !self.connected.load(Ordering::Acquire) {
            bail!("mqtt broker disconnected");
        }

        let topic = control_topic(device_id);
        debug!(device = %device_id, %topic, %action, "publishing command");
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, command_payload(action))
            .await
            .with_context(|| format!("publish to {topic} failed"))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Records every delivered command; fails the next N sends on request.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        sent: Arc<Mutex<Vec<(String, Action, Instant)>>>,
        attempts: Arc<Mutex<usize>>,
        failures: Arc<Mutex<VecDeque<String>>>,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn fail_next(&self, times: usize) {
            let mut f = self.failures.lock().unwrap();
            for _ in 0..times {
                f.push_back("link down".to_string());
            }
        }

        pub(crate) fn sent(&self) -> Vec<(String, Action)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(d, a, _)| (d.clone(), *a))
                .collect()
        }

        pub(crate) fn sent_at(&self) -> Vec<(Action, Instant)> {
            self.sent.lock().unwrap().iter().map(|(_, a, t)| (*a, *t)).collect()
        }

        pub(crate) fn attempts(&self) -> usize {
            *self.attempts.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_command(&self, device_id: &str, action: Action) -> Result<()> {
            *self.attempts.lock().unwrap() += 1;
            if let Some(reason) = self.failures.lock().unwrap().pop_front() {
                bail!(reason);
            }
            self.sent
                .lock()
                .unwrap()
                .push((device_id.to_string(), action, Instant::now()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;

    fn test_client() -> (AsyncClient, rumqttc::EventLoop) {
        let opts = MqttOptions::new("test-transport", "localhost", 1883);
        AsyncClient::new(opts, 10)
    }

    #[tokio::test]
    async fn disconnected_broker_is_a_send_error() {
        let (client, _eventloop) = test_client();
        let transport = MqttTransport::new(client, Arc::new(AtomicBool::new(false)));
        let err = transport.send_command("d1", Action::PumpOn).await.unwrap_err();
        assert!(err.to_string().contains("disconnected"));
    }

    #[tokio::test]
    async fn connected_publish_is_queued() {
        // The request channel has capacity, so publish succeeds without a
        // live broker as long as the event loop handle is alive.
        let (client, _eventloop) = test_client();
        let transport = MqttTransport::new(client, Arc::new(AtomicBool::new(true)));
        transport.send_command("d1", Action::MistOff).await.unwrap();
    }
}
