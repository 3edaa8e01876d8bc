mod config;
mod controller;
mod db;
mod dispatch;
mod error;
mod failsafe;
mod guard;
mod model;
mod mqtt;
mod registry;
mod state;
mod store;
mod transport;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use controller::Controller;
use db::Db;
use dispatch::Dispatcher;
use mqtt::{
    extract_status_device, extract_telemetry_device, parse_status_payload, TelemetryMsg,
    STATUS_FILTER, TELEMETRY_FILTER,
};
use registry::TelemetryRegistry;
use state::{SharedState, SystemState};
use transport::MqttTransport;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:farm.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (tunables + seed zones/devices) ─────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // The database is the source of truth from here on.
    let zones = db.load_zones().await?;
    if zones.is_empty() {
        warn!("no zones configured in the database");
    }

    // ── Device registry ─────────────────────────────────────────────
    let registry = TelemetryRegistry::new();
    let devices = db.load_devices().await?;
    for d in &devices {
        registry
            .register(&d.device_id, &d.name, d.zone_id.as_deref())
            .await;
        if let Some(sample) = db.latest_sample(&d.device_id).await? {
            registry.restore_sample(&d.device_id, sample).await;
        }
    }
    info!(zones = zones.len(), devices = devices.len(), "db ready");

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── MQTT + controller ───────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("farm-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    let connected = Arc::new(AtomicBool::new(false));

    let transport = MqttTransport::new(client.clone(), connected.clone());
    let (dispatcher, shutoffs) = Dispatcher::new(
        Arc::new(registry.clone()),
        Arc::new(transport),
        cfg.controller.dispatch(),
    );
    let controller = Controller::new(
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(registry.clone()),
        dispatcher,
        shared.clone(),
        cfg.controller.controller(),
    );
    controller.spawn_shutoff_recorder(shutoffs);
    controller.spawn_workers().await?;

    spawn_liveness_sweep(registry.clone(), shared.clone(), cfg.controller.offline_after());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        controller,
        shared: shared.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            let reason = format!("{e:#}");
            error!(error = %reason, "web server stopped");
        }
    });

    // ── MQTT event loop ─────────────────────────────────────────────
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                handle_publish(&p.topic, &p.payload, &registry, &db, &shared).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                connected.store(true, Ordering::Release);
                // Clean session: subscriptions do not survive a reconnect.
                for filter in [TELEMETRY_FILTER, STATUS_FILTER] {
                    if let Err(e) = client.subscribe(filter, QoS::AtLeastOnce).await {
                        error!(%filter, error = %e, "subscribe failed");
                    }
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                connected.store(false, Ordering::Release);
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "mqtt error, reconnecting");
                connected.store(false, Ordering::Release);

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx::query=warn"));

    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .compact()
        .init();
}

/// Node clocks further off than this get a warning on every sample.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Route one inbound publish to the registry, the database and the event
/// ring. Bad payloads are logged and dropped.
async fn handle_publish(
    topic: &str,
    payload: &[u8],
    registry: &TelemetryRegistry,
    db: &Db,
    shared: &SharedState,
) {
    if let Some(device_id) = extract_telemetry_device(topic) {
        let msg = match serde_json::from_slice::<TelemetryMsg>(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(%topic, error = %e, "bad telemetry json");
                shared
                    .write()
                    .await
                    .record_error(format!("bad telemetry json from {device_id}: {e}"));
                return;
            }
        };

        let received_at = OffsetDateTime::now_utc();
        if let Some(skew) = msg.clock_skew(received_at) {
            if skew.abs() > MAX_CLOCK_SKEW_SECS {
                warn!(device = %device_id, skew_secs = skew, "node clock is off, stamping on receipt");
            }
        }
        let sample = msg.into_sample(received_at);
        if !registry.record_sample(device_id, sample).await {
            warn!(device = %device_id, "telemetry from unregistered device, skipping");
            return;
        }
        debug!(device = %device_id, temp = ?sample.temp, hum_soil = ?sample.hum_soil, "telemetry");

        // Persist best-effort; the registry already has the sample.
        if let Err(e) = db.insert_sample(device_id, &sample).await {
            let reason = format!("{e:#}");
            warn!(device = %device_id, error = %reason, "insert_sample failed");
        }
        shared.write().await.record_telemetry(device_id, &sample);
    } else if let Some(device_id) = extract_status_device(topic) {
        match parse_status_payload(payload) {
            Ok(status) => {
                if registry.set_status(device_id, status).await {
                    info!(device = %device_id, status = status.as_str(), "device status");
                    shared.write().await.record_device_status(device_id, status);
                } else {
                    debug!(device = %device_id, "status from unregistered device");
                }
            }
            Err(msg) => {
                warn!(%topic, "{msg}");
                shared.write().await.record_error(msg);
            }
        }
    } else {
        debug!(%topic, "unhandled topic");
    }
}

/// Periodically mark devices that stopped talking as OFFLINE.
fn spawn_liveness_sweep(registry: TelemetryRegistry, shared: SharedState, offline_after: Duration) {
    let period = (offline_after / 3).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let gone = registry
                .sweep_offline(OffsetDateTime::now_utc(), offline_after)
                .await;
            if gone.is_empty() {
                continue;
            }
            let mut st = shared.write().await;
            for device_id in gone {
                warn!(device = %device_id, silent_secs = offline_after.as_secs(), "device went silent");
                st.record_device_status(&device_id, model::DeviceStatus::Offline);
            }
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================
