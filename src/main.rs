//! cgateweb - C-Gate to MQTT bridge for Clipsal C-Bus
//!
//! Bridges a Clipsal C-Gate server to an MQTT broker: C-Bus events become
//! retained-or-live state topics, MQTT write topics become C-Gate commands,
//! and discovered groups are announced to Home Assistant.
//!
//! Module structure:
//! - `domain/` - Addressing, event and command grammars, level scaling
//! - `io/` - External interfaces (C-Gate sockets, pool, MQTT)
//! - `services/` - Bridge logic (queues, routing, tracking, discovery)
//! - `infra/` - Infrastructure (config, metrics)

use cgateweb::infra::{Metrics, Settings};
use cgateweb::io::cgate::{Backoff, CgateConnection, ChannelKind};
use cgateweb::io::mqtt::{start_mqtt, MqttMessage};
use cgateweb::io::pool::CgatePool;
use cgateweb::services::bridge::{Bridge, BridgeInputs, MqttDispatcher, PoolDispatcher};
use cgateweb::services::throttle::ThrottledQueue;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// cgateweb - C-Gate to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "cgateweb", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = option_env!("GIT_HASH").unwrap_or("unknown"),
        "cgateweb_starting"
    );

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Settings::resolve_config_path(&[]));

    let settings = if Path::new(&config_path).exists() {
        match Settings::from_file(&config_path) {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "config_invalid");
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("Warning: config file {} not found. Using defaults.", config_path);
        Settings::default()
    };

    info!(
        config_file = %settings.config_file(),
        cgate_host = %settings.cgate_host(),
        cgate_command_port = %settings.cgate_command_port(),
        cgate_event_port = %settings.cgate_event_port(),
        cgate_project = %settings.cgate_project(),
        mqtt_host = %settings.mqtt_host(),
        mqtt_port = %settings.mqtt_port(),
        message_interval_ms = %settings.message_interval_ms(),
        pool_size = %settings.pool_size(),
        ha_discovery = %settings.ha_discovery_enabled(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());

    // Start MQTT client
    let (mqtt_in_tx, mqtt_in_rx) = mpsc::channel(1024);
    let (mqtt_status_tx, mqtt_status_rx) = watch::channel(false);
    let mqtt = start_mqtt(&settings, mqtt_in_tx, mqtt_status_tx, metrics.clone(), shutdown_rx.clone());

    // Start the C-Gate command pool; zero healthy connections is fatal.
    let (pool_line_tx, pool_line_rx) = mpsc::channel(1024);
    let pool =
        match CgatePool::start(&settings, pool_line_tx, metrics.clone(), shutdown_rx.clone()).await {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "cgate_pool_start_failed");
                std::process::exit(1);
            }
        };
    let pool_healthy_rx = pool.subscribe_healthy();

    // Start the C-Gate event channel connection
    let (event_line_tx, event_line_rx) = mpsc::channel(1024);
    let (event_status_tx, event_status_rx) = mpsc::channel(8);
    let (event_conn, _event_link) = CgateConnection::new(
        0,
        ChannelKind::Event,
        settings.cgate_host(),
        settings.cgate_event_port(),
        None,
        Duration::from_millis(settings.connection_timeout_ms()),
        Backoff {
            initial: Duration::from_millis(settings.reconnect_initial_delay_ms()),
            max: Duration::from_millis(settings.reconnect_max_delay_ms()),
            max_attempts: Some(settings.reconnect_max_attempts()),
        },
        event_line_tx,
        event_status_tx,
        metrics.clone(),
    );
    tokio::spawn(event_conn.run(shutdown_rx.clone()));

    // Paced outbound queues: C-Gate commands and MQTT publications
    let interval = Duration::from_millis(settings.message_interval_ms() as u64);
    let cgate_queue = ThrottledQueue::<String>::new(interval);
    let cgate_queue_handle = cgate_queue.handle();
    tokio::spawn(cgate_queue.run(PoolDispatcher::new(pool.clone()), shutdown_rx.clone()));

    let mqtt_queue = ThrottledQueue::<MqttMessage>::new(interval);
    let mqtt_queue_handle = mqtt_queue.handle();
    tokio::spawn(
        mqtt_queue.run(MqttDispatcher::new(mqtt.clone(), metrics.clone()), shutdown_rx.clone()),
    );

    // Periodic metrics summary (0 disables)
    let report_interval = settings.metrics_interval_secs();
    if report_interval > 0 {
        let report_metrics = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(report_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                report_metrics.report().log();
            }
        });
    }

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run the bridge orchestrator - the single serialization domain
    let bridge = Bridge::new(settings, metrics.clone(), cgate_queue_handle, mqtt_queue_handle);
    let inputs = BridgeInputs {
        event_rx: event_line_rx,
        event_status_rx,
        response_rx: pool_line_rx,
        pool_healthy_rx,
        mqtt_rx: mqtt_in_rx,
        mqtt_status_rx,
    };
    bridge.run(inputs, shutdown_rx).await;

    pool.stop().await;
    mqtt.disconnect().await;
    metrics.report().log();

    info!("cgateweb shutdown complete");
    Ok(())
}

/// Structured logging: LOG_LEVEL wins, then RUST_LOG, then info.
fn init_logging() {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();
}
