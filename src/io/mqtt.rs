//! MQTT client wrapper
//!
//! Connects to the broker with a retained `hello/cgateweb` will/birth pair,
//! subscribes to the `cbus/write/#` command space, forwards inbound messages
//! to the bridge and exposes a publish handle used by the throttled
//! publication queue. Reconnection is driven by polling the rumqttc event
//! loop again after a 5 second pause; a credential rejection is the one
//! unrecoverable failure and terminates the process.

use crate::infra::config::Settings;
use crate::infra::metrics::Metrics;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, LastWill, MqttOptions, Packet, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Status topic carrying the retained birth (`Online`) and will (`Offline`).
pub const STATUS_TOPIC: &str = "hello/cgateweb";
/// Subscription covering every bridge command topic.
pub const WRITE_SUBSCRIPTION: &str = "cbus/write/#";

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// One outbound publication, queued through the throttled MQTT queue.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl MqttMessage {
    pub fn new(topic: String, payload: String, retain: bool) -> Self {
        Self { topic, payload, qos: QoS::AtMostOnce, retain }
    }
}

/// One inbound message from the command topic space.
#[derive(Debug, Clone)]
pub struct MqttIncoming {
    pub topic: String,
    pub payload: String,
}

/// Clonable publish handle backed by the shared rumqttc client.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Publish one message. Returns false (with a warning) when the broker
    /// is not connected or the client rejects the publication.
    pub async fn publish(&self, msg: &MqttMessage) -> bool {
        if !self.is_connected() {
            warn!(topic = %msg.topic, "mqtt_publish_skipped_not_connected");
            return false;
        }

        match self
            .client
            .publish(&msg.topic, msg.qos, msg.retain, msg.payload.as_bytes())
            .await
        {
            Ok(()) => {
                debug!(topic = %msg.topic, payload = %msg.payload, "mqtt_published");
                true
            }
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "mqtt_publish_failed");
                false
            }
        }
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

/// Start the MQTT client task. Returns the publish handle; connectivity is
/// reported on `status_tx` and inbound messages on `incoming_tx`.
pub fn start_mqtt(
    settings: &Settings,
    incoming_tx: mpsc::Sender<MqttIncoming>,
    status_tx: watch::Sender<bool>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> MqttHandle {
    let mut options = MqttOptions::new("cgateweb", settings.mqtt_host(), settings.mqtt_port());
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(STATUS_TOPIC, "Offline", QoS::AtLeastOnce, true));

    if let Some((user, pass)) = settings.mqtt_credentials() {
        options.set_credentials(user, pass);
    }

    let (client, eventloop) = AsyncClient::new(options, 100);
    let connected = Arc::new(AtomicBool::new(false));
    let handle = MqttHandle { client: client.clone(), connected: connected.clone() };

    info!(host = %settings.mqtt_host(), port = settings.mqtt_port(), "mqtt_client_starting");

    tokio::spawn(run_event_loop(
        client,
        eventloop,
        connected,
        incoming_tx,
        status_tx,
        metrics,
        shutdown,
    ));

    handle
}

async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    connected: Arc<AtomicBool>,
    incoming_tx: mpsc::Sender<MqttIncoming>,
    status_tx: watch::Sender<bool>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    let _ = client.disconnect().await;
                    return;
                }
            }
            result = eventloop.poll() => match result {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        fatal_on_auth_refusal(ack.code);
                        warn!(code = ?ack.code, "mqtt_connection_rejected");
                        continue;
                    }

                    connected.store(true, Ordering::Relaxed);
                    let _ = status_tx.send(true);
                    info!("mqtt_connected");

                    if let Err(e) = client
                        .publish(STATUS_TOPIC, QoS::AtLeastOnce, true, "Online")
                        .await
                    {
                        warn!(error = %e, "mqtt_birth_publish_failed");
                    }
                    if let Err(e) = client.subscribe(WRITE_SUBSCRIPTION, QoS::AtMostOnce).await {
                        warn!(error = %e, "mqtt_subscribe_failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let incoming = MqttIncoming {
                        topic: publish.topic.clone(),
                        payload: String::from_utf8_lossy(&publish.payload).to_string(),
                    };
                    if incoming_tx.send(incoming).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if let ConnectionError::ConnectionRefused(code) = &e {
                        fatal_on_auth_refusal(*code);
                    }
                    if connected.swap(false, Ordering::Relaxed) {
                        metrics.record_reconnect();
                    }
                    let _ = status_tx.send(false);
                    warn!(error = %e, "mqtt_connection_error");
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }
}

/// Bad credentials cannot heal by retrying; per the bridge contract this is
/// the one failure that takes the process down.
fn fatal_on_auth_refusal(code: ConnectReturnCode) {
    if matches!(code, ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized) {
        error!(code = ?code, "mqtt_authentication_failed_fatal");
        std::process::exit(1);
    }
}
