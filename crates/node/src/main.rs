mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Actuator, EnvironmentSim, Reading, Scenario};

#[derive(Debug, Serialize)]
struct TelemetryMsg {
    ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hum_air: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hum_soil: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    light: Option<f64>,
}

impl TelemetryMsg {
    fn new(ts: i64, r: Reading) -> Self {
        Self {
            ts,
            temp: r.temp,
            hum_air: r.hum_air,
            hum_soil: r.hum_soil,
            light: r.light,
        }
    }
}

/// Wire format of `farm/<id>/control`.
#[derive(Debug, Deserialize)]
struct ControlMsg {
    device: String,
    status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Command {
    actuator: Actuator,
    on: bool,
}

fn parse_command(payload: &[u8]) -> Result<Command, String> {
    let msg: ControlMsg =
        serde_json::from_slice(payload).map_err(|e| format!("bad control json: {e}"))?;
    let actuator = Actuator::from_wire(&msg.device)
        .ok_or_else(|| format!("unknown actuator: {}", msg.device))?;
    let on = match msg.status.as_str() {
        "ON" => true,
        "OFF" => false,
        other => return Err(format!("unknown status: {other}")),
    };
    Ok(Command { actuator, on })
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "node-a".to_string());
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 5);
    let ticks_per_day: u64 = env_or("SIM_TICKS_PER_DAY", 720);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let status_topic = format!("farm/{device_id}/status");
    let telemetry_topic = format!("farm/{device_id}/telemetry");
    let control_topic = format!("farm/{device_id}/control");

    let mut mqttoptions = MqttOptions::new(format!("farm-node-{device_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    // The broker announces us OFFLINE if the link drops without a goodbye.
    mqttoptions.set_last_will(LastWill::new(
        &status_topic,
        "OFFLINE",
        QoS::AtLeastOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(16);

    // Event loop task: (re)announce on every connect, forward control messages.
    let loop_client = client.clone();
    let (loop_status, loop_control) = (status_topic.clone(), control_topic.clone());
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    // try_* never waits on the request queue this loop drains.
                    if let Err(e) = loop_client.try_subscribe(&loop_control, QoS::AtLeastOnce) {
                        warn!(error = %e, "subscribe failed");
                    }
                    if let Err(e) =
                        loop_client.try_publish(&loop_status, QoS::AtLeastOnce, true, "ONLINE")
                    {
                        warn!(error = %e, "status publish failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == loop_control => {
                    match parse_command(&p.payload) {
                        Ok(cmd) => {
                            if cmd_tx.send(cmd).await.is_err() {
                                return;
                            }
                        }
                        Err(msg) => warn!("{msg}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(%device_id, %scenario, topic = %telemetry_topic, "publishing telemetry");

    let mut sim = EnvironmentSim::new(scenario, ticks_per_day);
    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let msg = TelemetryMsg::new(now_unix(), sim.step());
                let payload = serde_json::to_vec(&msg)?;
                match client
                    .publish(&telemetry_topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    Ok(()) => debug!(ts = msg.ts, temp = ?msg.temp, hum_soil = ?msg.hum_soil, "published telemetry"),
                    Err(e) => warn!(error = %e, "publish error"),
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                let was_on = sim.actuator(cmd.actuator);
                sim.set_actuator(cmd.actuator, cmd.on);
                info!(actuator = ?cmd.actuator, was_on, on = cmd.on, "actuator command");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_is_recent() {
        let ts = now_unix();
        // After 2024-01-01 and before 2040-01-01.
        assert!(ts > 1_704_067_200, "timestamp too old: {ts}");
        assert!(ts < 2_208_988_800, "timestamp too far in future: {ts}");
    }

    #[test]
    fn parses_control_message() {
        let cmd = parse_command(br#"{"device":"PUMP","status":"ON"}"#).unwrap();
        assert_eq!(
            cmd,
            Command {
                actuator: Actuator::Pump,
                on: true
            }
        );
        let cmd = parse_command(br#"{"device":"LIGHT","status":"OFF"}"#).unwrap();
        assert_eq!(cmd.actuator, Actuator::Light);
        assert!(!cmd.on);
    }

    #[test]
    fn rejects_bad_control_messages() {
        assert!(parse_command(b"not json").is_err());
        assert!(parse_command(br#"{"device":"FAN","status":"ON"}"#)
            .unwrap_err()
            .contains("FAN"));
        assert!(parse_command(br#"{"device":"MIST","status":"MAYBE"}"#)
            .unwrap_err()
            .contains("MAYBE"));
        assert!(parse_command(br#"{"device":"MIST"}"#).is_err());
    }

    #[test]
    fn telemetry_omits_dropped_channels() {
        let msg = TelemetryMsg::new(
            1_700_000_000,
            Reading {
                temp: Some(24.5),
                hum_air: None,
                hum_soil: Some(38.2),
                light: None,
            },
        );
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["ts"], 1_700_000_000);
        assert_eq!(json["temp"], 24.5);
        assert_eq!(json["hum_soil"], 38.2);
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("hum_air"));
        assert!(!obj.contains_key("light"));
    }
}
