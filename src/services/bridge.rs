//! Bridge orchestrator
//!
//! One task owns all mutable bridge state (tracker, response processor,
//! discovery bookkeeping) and consumes every input stream - event-channel
//! lines, pooled command responses, MQTT messages and connectivity changes -
//! so components never race each other. Readiness is the conjunction of the
//! three endpoints; entering it triggers the optional full-state refresh,
//! the periodic refresh timer and discovery.

use crate::domain::commands::{parse_write, WriteCommand};
use crate::domain::events::parse_event_line;
use crate::domain::types::CbusEvent;
use crate::infra::config::Settings;
use crate::infra::metrics::Metrics;
use crate::io::cgate::{LinkEvent, LinkStatus};
use crate::io::mqtt::{MqttHandle, MqttIncoming, MqttMessage};
use crate::io::pool::CgatePool;
use crate::services::discovery::Discovery;
use crate::services::publisher::EventPublisher;
use crate::services::responses::{ResponseAction, ResponseProcessor};
use crate::services::router::CommandRouter;
use crate::services::throttle::{QueueConsumer, QueueHandle};
use crate::services::tracker::LevelTracker;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Cadence of the relative-ramp deadline sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Queue consumer dispatching command lines to the C-Gate pool.
pub struct PoolDispatcher {
    pool: Arc<CgatePool>,
}

impl PoolDispatcher {
    pub fn new(pool: Arc<CgatePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueConsumer<String> for PoolDispatcher {
    async fn dispatch(&mut self, line: String) -> Result<(), String> {
        self.pool.execute(&line).await.map_err(|e| e.to_string())
    }
}

/// Queue consumer publishing to the MQTT broker.
pub struct MqttDispatcher {
    mqtt: MqttHandle,
    metrics: Arc<Metrics>,
}

impl MqttDispatcher {
    pub fn new(mqtt: MqttHandle, metrics: Arc<Metrics>) -> Self {
        Self { mqtt, metrics }
    }
}

#[async_trait]
impl QueueConsumer<MqttMessage> for MqttDispatcher {
    async fn dispatch(&mut self, msg: MqttMessage) -> Result<(), String> {
        if self.mqtt.publish(&msg).await {
            self.metrics.record_publication();
            Ok(())
        } else {
            Err(format!("publish to {} failed", msg.topic))
        }
    }
}

/// All input channels the bridge loop consumes.
pub struct BridgeInputs {
    /// Lines from the event-channel connection.
    pub event_rx: mpsc::Receiver<String>,
    /// Connectivity transitions of the event-channel connection.
    pub event_status_rx: mpsc::Receiver<LinkStatus>,
    /// Fanned-in lines from every pool connection.
    pub response_rx: mpsc::Receiver<String>,
    /// Healthy-connection count of the pool.
    pub pool_healthy_rx: watch::Receiver<usize>,
    /// Messages from the `cbus/write/#` subscription.
    pub mqtt_rx: mpsc::Receiver<MqttIncoming>,
    /// Broker connectivity.
    pub mqtt_status_rx: watch::Receiver<bool>,
}

pub struct Bridge {
    settings: Settings,
    metrics: Arc<Metrics>,
    tracker: LevelTracker,
    responses: ResponseProcessor,
    router: CommandRouter,
    publisher: EventPublisher,
    discovery: Discovery,
    cgate_queue: QueueHandle<String>,
    mqtt_queue: QueueHandle<MqttMessage>,
    mqtt_ok: bool,
    pool_ok: bool,
    event_ok: bool,
    ready: bool,
}

impl Bridge {
    pub fn new(
        settings: Settings,
        metrics: Arc<Metrics>,
        cgate_queue: QueueHandle<String>,
        mqtt_queue: QueueHandle<MqttMessage>,
    ) -> Self {
        Self {
            tracker: LevelTracker::new(),
            responses: ResponseProcessor::new(metrics.clone()),
            router: CommandRouter::new(settings.clone()),
            publisher: EventPublisher::new(settings.clone()),
            discovery: Discovery::new(settings.clone()),
            settings,
            metrics,
            cgate_queue,
            mqtt_queue,
            mqtt_ok: false,
            pool_ok: false,
            event_ok: false,
            ready: false,
        }
    }

    /// Main loop. Runs until shutdown; this task is the single
    /// serialization domain for all bridge state.
    pub async fn run(mut self, mut inputs: BridgeInputs, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut refresh: Option<tokio::time::Interval> = None;

        info!("bridge_started");

        // The pool and broker may have connected before this loop began
        // watching; seed readiness from the current values.
        self.mqtt_ok = *inputs.mqtt_status_rx.borrow();
        self.pool_ok = *inputs.pool_healthy_rx.borrow() > 0;
        self.evaluate_ready(&mut refresh);

        loop {
            tokio::select! {
                Some(line) = inputs.event_rx.recv() => {
                    self.handle_event_line(&line);
                }
                Some(status) = inputs.event_status_rx.recv() => {
                    self.event_ok = matches!(status.event, LinkEvent::Up);
                    if status.event == LinkEvent::Failed {
                        error!("bridge_event_channel_gave_up");
                    }
                    self.evaluate_ready(&mut refresh);
                }
                Some(line) = inputs.response_rx.recv() => {
                    self.handle_response_line(&line);
                }
                Ok(()) = inputs.pool_healthy_rx.changed() => {
                    self.pool_ok = *inputs.pool_healthy_rx.borrow() > 0;
                    self.evaluate_ready(&mut refresh);
                }
                Some(msg) = inputs.mqtt_rx.recv() => {
                    self.handle_mqtt_message(&msg);
                }
                Ok(()) = inputs.mqtt_status_rx.changed() => {
                    self.mqtt_ok = *inputs.mqtt_status_rx.borrow();
                    self.evaluate_ready(&mut refresh);
                }
                _ = sweep.tick() => {
                    for address in self.tracker.sweep_expired() {
                        warn!(address = %address, "relative_ramp_timed_out");
                    }
                }
                _ = tick_opt(&mut refresh) => {
                    self.enqueue_getall();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drop pending work so nothing fires into closing sockets.
        self.cgate_queue.clear();
        self.mqtt_queue.clear();
        info!("bridge_stopped");
    }

    fn handle_event_line(&mut self, line: &str) {
        let Some(event) = parse_event_line(line) else {
            // The event channel greets with a banner; unparseable lines
            // there are expected noise, not errors.
            debug!(line = line, "event_line_unparseable");
            self.metrics.record_parse_error();
            return;
        };
        self.metrics.record_event_received();
        self.apply_event(&event);
    }

    fn handle_response_line(&mut self, line: &str) {
        match self.responses.process(line) {
            ResponseAction::Event(event) => {
                self.metrics.record_event_received();
                self.apply_event(&event);
            }
            ResponseAction::Tree { network, xml } => match self.discovery.handle_tree(&network, &xml) {
                Ok(messages) => {
                    for msg in messages {
                        self.mqtt_queue.push(msg);
                    }
                }
                Err(e) => {
                    error!(network = %network, error = %e, "discovery_tree_parse_failed");
                }
            },
            ResponseAction::None => {}
        }
    }

    /// Feed one event into the tracker and publish its state. A level
    /// delivery may resolve a pending relative ramp into a RAMP command.
    fn apply_event(&mut self, event: &CbusEvent) {
        let level = event.level.unwrap_or(if event.is_on() { 255 } else { 0 });
        if let Some(due) = self.tracker.record(&event.address, level) {
            debug!(address = %due.address, level = due.level, "relative_ramp_resolved");
            self.cgate_queue.push(self.router.ramp_line(&due.address, due.level, None));
        }

        for msg in self.publisher.messages_for(event) {
            self.mqtt_queue.push(msg);
        }
    }

    fn handle_mqtt_message(&mut self, msg: &MqttIncoming) {
        let command = match parse_write(&msg.topic, &msg.payload) {
            Ok(command) => command,
            Err(e) => {
                self.metrics.record_parse_error();
                warn!(topic = %msg.topic, payload = %msg.payload, error = %e, "mqtt_command_rejected");
                return;
            }
        };

        if command == WriteCommand::Announce {
            if self.settings.ha_discovery_enabled() {
                info!("discovery_reannounce_requested");
                self.trigger_discovery();
            } else {
                debug!("discovery_announce_ignored_disabled");
            }
            return;
        }

        let result = self.router.route(&command, &mut self.tracker);
        if let Some(network) = result.tree_request {
            self.responses.note_tree_request(network);
        }
        for line in result.commands {
            self.cgate_queue.push(line);
        }
    }

    fn evaluate_ready(&mut self, refresh: &mut Option<tokio::time::Interval>) {
        let ready = self.mqtt_ok && self.pool_ok && self.event_ok;
        if ready == self.ready {
            return;
        }
        self.ready = ready;

        if ready {
            info!("bridge_ready");
            self.on_ready(refresh);
        } else {
            warn!(
                mqtt = self.mqtt_ok,
                pool = self.pool_ok,
                event_channel = self.event_ok,
                "bridge_not_ready"
            );
            *refresh = None;
            if !self.pool_ok {
                self.cgate_queue.clear();
            }
            if !self.mqtt_ok {
                self.mqtt_queue.clear();
            }
        }
    }

    /// Ready entry actions; re-run on every re-achievement. The periodic
    /// refresh timer is replaced, never duplicated.
    fn on_ready(&mut self, refresh: &mut Option<tokio::time::Interval>) {
        if self.settings.getall_on_start() {
            self.enqueue_getall();
        }

        *refresh = self.settings.getall_period_seconds().map(|secs| {
            let period = Duration::from_secs(secs as u64);
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        if self.settings.ha_discovery_enabled() {
            self.trigger_discovery();
        }
    }

    fn enqueue_getall(&mut self) {
        if let Some((network, application)) = self.settings.getall_net_app() {
            debug!(network = network, application = application, "getall_refresh");
            self.cgate_queue.push(self.router.getall_line(network, application));
        }
    }

    fn trigger_discovery(&mut self) {
        for network in self.discovery.networks() {
            self.responses.note_tree_request(network.clone());
            self.cgate_queue.push(format!("TREEXML {}\n", network));
        }
    }
}

/// Select-arm helper for the optional periodic refresh timer.
async fn tick_opt(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
