use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sprinkler_master::config::{self, DriverKind};
use sprinkler_master::db::Db;
use sprinkler_master::device::{ControllerDriver, DeviceDirectory};
use sprinkler_master::driver::{RelayDriver, SimulatedDriver};
use sprinkler_master::mqtt::{parse_command, Command, SUBSCRIPTIONS};
use sprinkler_master::service::MasterService;
use sprinkler_master::state::{SharedState, SystemState};
use sprinkler_master::{poller, web};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let web_port: u16 = env_or("WEB_PORT", 8080);
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:sprinkler-master.db?mode=rwc".to_string());
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed slaves + masters) ─────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // The database is the source of truth from here on.
    let slaves = db.load_slaves().await?;
    let masters = db.load_masters().await?;
    if masters.is_empty() {
        warn!("no master devices configured");
    }
    info!(slaves = slaves.len(), masters = masters.len(), "db ready");

    // ── Driver ──────────────────────────────────────────────────────
    let driver: Arc<dyn ControllerDriver> = match cfg.driver {
        DriverKind::Simulated => Arc::new(SimulatedDriver::new(db.clone())),
        DriverKind::Relay => Arc::new(RelayDriver::new(&slaves, active_low, db.clone()).await?),
    };
    info!(driver = ?cfg.driver, "controller driver ready");

    // ── Shared state (ephemeral, for the status api) ────────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("master host started".to_string());

    // ── Masters ─────────────────────────────────────────────────────
    let directory: Arc<dyn DeviceDirectory> = Arc::new(db.clone());
    let service = Arc::new(MasterService::new(directory, driver, shared.clone()));

    for m in &masters {
        if let Err(e) = service.on_master_start(m.id, &m.controllers).await {
            error!(master = m.id, "failed to start master: {e}");
            continue;
        }
        if let Err(e) = service.reconcile(m.id).await {
            warn!(master = m.id, "initial reconcile failed: {e}");
        }
    }

    // ── Web server + poller ─────────────────────────────────────────
    let web_state = shared.clone();
    let web_db = db.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_db, web_port).await {
            error!("{e:#}");
        }
    });

    tokio::spawn(poller::run(
        Arc::clone(&service),
        Duration::from_secs(cfg.poll_interval_sec),
    ));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("sprinkler-master", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    for topic in SUBSCRIPTIONS {
        client.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    info!(topics = ?SUBSCRIPTIONS, "subscribed");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                for id in service.master_ids().await {
                    service.on_master_stop(id).await;
                }
                return Ok(());
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match parse_command(&p.topic, &p.payload) {
                    Ok(cmd) => handle_command(&service, cmd).await,
                    Err(msg) => {
                        warn!(topic = %p.topic, "{msg}");
                        shared.write().await.record_error(msg);
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let was_connected = mark_disconnected(&shared, format!("mqtt error: {e}")).await;

                // Best-effort fail-safe: nothing keeps running unattended
                if was_connected {
                    for id in service.master_ids().await {
                        if let Err(e) = service.deactivate_all(id).await {
                            warn!(master = id, "fail-safe all-off failed: {e}");
                        }
                    }
                }

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn mark_disconnected(shared: &SharedState, detail: String) -> bool {
    let mut st = shared.write().await;
    let was_connected = st.mqtt_connected;
    st.mqtt_connected = false;
    st.record_error(detail);
    was_connected
}

async fn handle_command(service: &MasterService, cmd: Command) {
    // Failures are already logged and recorded by the service.
    match cmd {
        Command::SetZone { master, zone } => {
            if let Ok(st) = service.activate_zone(master, zone).await {
                info!(master, zone = st.active_zone, slave = st.active_slave_id, "zone set");
            }
        }
        Command::RequestStatus { master } => {
            let _ = service.reconcile(master).await;
        }
        Command::ControllerChanged { controller } => {
            service.on_controller_changed(controller).await;
        }
    }
}
