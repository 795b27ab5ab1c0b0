use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rumqttc::QoS;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::device::client::DeviceApi;
use crate::device::{DeviceStatus, relay_text};
use crate::error::{BrokerError, DeviceError};
use crate::mqtt::client::{ConnectionState, MqttMessage};
use crate::mqtt::{Command, Topics, power_payload, temperature_payload};

const COMMAND_QUEUE: usize = 32;

/// Broker operations the bridge relies on.
pub trait Broker: Send + Sync {
    /// Fire-and-forget; dropped with a log line when the session is down.
    fn publish(&self, topic: &str, payload: String, qos: QoS);
    fn subscribe(
        &self,
        filter: &str,
        handler: mpsc::Sender<MqttMessage>,
    ) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Connected,
    Degraded,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Starting => write!(f, "starting"),
            Phase::Connected => write!(f, "connected"),
            Phase::Degraded => write!(f, "degraded"),
            Phase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Everything the bridge knows. Only ever replaced through the watch
/// channel, so readers see either the old or the new value.
#[derive(Debug, Clone)]
pub struct BridgeState {
    pub phase: Phase,
    pub status: Option<Arc<DeviceStatus>>,
    /// Incremented after every successful poll.
    pub sequence: u64,
    pub subscriptions: BTreeSet<String>,
    /// Bumped whenever a command is sent to the device.
    commands: u64,
    device_reachable: Option<bool>,
    broker_connected: bool,
}

impl BridgeState {
    fn new() -> Self {
        Self {
            phase: Phase::Starting,
            status: None,
            sequence: 0,
            subscriptions: BTreeSet::new(),
            commands: 0,
            device_reachable: None,
            broker_connected: false,
        }
    }

    /// Last relay state read from or confirmed by the device. `None` until
    /// then, or while the relay is only known from a fallback.
    pub fn relay_state(&self) -> Option<bool> {
        self.status
            .as_ref()
            .filter(|s| !s.fallbacks.relay)
            .map(|s| s.relay_state)
    }

    fn derived_phase(&self) -> Phase {
        match (self.phase, self.device_reachable) {
            (Phase::Stopped, _) => Phase::Stopped,
            (_, None) => Phase::Starting,
            (_, Some(true)) if self.broker_connected => Phase::Connected,
            _ => Phase::Degraded,
        }
    }
}

pub struct Bridge<D, B> {
    device: D,
    broker: B,
    topics: Topics,
    config: BridgeConfig,
    state: watch::Sender<BridgeState>,
}

impl<D, B> Bridge<D, B>
where
    D: DeviceApi + 'static,
    B: Broker + 'static,
{
    pub fn new(device: D, broker: B, topics: Topics, config: BridgeConfig) -> Arc<Self> {
        let (state, _) = watch::channel(BridgeState::new());
        Arc::new(Self {
            device,
            broker,
            topics,
            config,
            state,
        })
    }

    pub fn snapshot(&self) -> BridgeState {
        self.state.borrow().clone()
    }

    /// Runs the poll loop, the command dispatcher and the broker watcher
    /// until `shutdown` becomes true. In-flight device calls are allowed to
    /// finish first.
    pub async fn run(
        self: Arc<Self>,
        broker_state: watch::Receiver<ConnectionState>,
        shutdown: watch::Receiver<bool>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        for topic in self.topics.command_topics() {
            if let Err(e) = self.broker.subscribe(&topic, command_tx.clone()) {
                warn!("Subscribing to {} failed, will retry on reconnect: {}", topic, e);
            }
            self.state.send_modify(|state| {
                state.subscriptions.insert(topic);
            });
        }
        drop(command_tx);

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().watch_broker(broker_state, shutdown.clone()));
        tasks.spawn(self.clone().poll_loop(shutdown.clone()));
        tasks.spawn(self.clone().dispatch_loop(command_rx, shutdown));

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Bridge task failed: {}", e);
            }
        }

        self.state.send_modify(|state| state.phase = Phase::Stopped);
        info!("Bridge stopped");
    }

    async fn watch_broker(
        self: Arc<Self>,
        mut broker_state: watch::Receiver<ConnectionState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let connection = *broker_state.borrow_and_update();
            self.on_broker_state(connection);

            tokio::select! {
                changed = broker_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("Poll loop stopped");
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<MqttMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let workers = Arc::new(Semaphore::new(self.config.command_workers.max(1)));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                message = commands.recv() => {
                    let Some(message) = message else { break };
                    let Ok(permit) = workers.clone().acquire_owned().await else { break };
                    let bridge = self.clone();
                    in_flight.spawn(async move {
                        bridge.handle_message(message).await;
                        drop(permit);
                    });
                }
            }

            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    error!("Command task failed: {}", e);
                }
            }
        }

        commands.close();
        let mut dropped = 0;
        while commands.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Dropping {} queued commands on shutdown", dropped);
        }

        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!("Command task failed: {}", e);
            }
        }
        debug!("Command dispatcher stopped");
    }

    /// One poll-publish cycle.
    pub async fn poll_once(&self) {
        let previous_relay = self.fresh_relay();
        let commands = self.state.borrow().commands;

        let report = match self.device.read_status(previous_relay).await {
            Ok(report) => Some(report),
            Err(DeviceError::Unreachable(e)) => {
                self.device_unreachable(&e);
                return;
            }
            Err(DeviceError::Protocol(e)) => {
                warn!("Dropping malformed status report: {}", e);
                None
            }
        };

        let temperature = match self.device.read_temperature().await {
            Ok(temperature) => Some(temperature),
            Err(DeviceError::Unreachable(e)) => {
                self.device_unreachable(&e);
                return;
            }
            Err(DeviceError::Protocol(e)) => {
                warn!("Dropping malformed temperature: {}", e);
                None
            }
        };

        if let Some(report) = &report {
            if report.fallbacks.any() {
                warn!(
                    "Degraded status read (relay fallback: {}, power fallback: {})",
                    report.fallbacks.relay, report.fallbacks.power
                );
            }
        }

        // A command that ran while this cycle was reading owns the relay state.
        let mut superseded = false;
        let mut status = Arc::new(DeviceStatus::new(report, temperature, previous_relay));
        self.state.send_modify(|state| {
            superseded = state.commands != commands;
            if let (true, Some(cached)) = (superseded, &state.status) {
                status = Arc::new(status.with_relay_of(cached));
            }
            state.status = Some(status.clone());
            state.sequence += 1;
        });
        if superseded {
            debug!("Relay changed by a command during this poll, not republishing it");
        }
        self.device_reachable();
        self.publish_status(&status, !superseded);
    }

    /// Decodes and applies one inbound message.
    pub async fn handle_message(&self, message: MqttMessage) {
        match self.topics.decode(&message.topic, &message.payload) {
            Some(Ok(command)) => self.apply(command).await,
            Some(Err(e)) => warn!("Dropping command on {}: {}", message.topic, e),
            None => debug!("Ignoring message on {}", message.topic),
        }
    }

    pub async fn apply(&self, command: Command) {
        info!("Applying command {:?}", command);
        self.state.send_modify(|state| state.commands += 1);

        let result = match command {
            Command::Open => self.device.set_relay(true).await,
            Command::Close => self.device.set_relay(false).await,
            Command::Toggle => self.device.toggle_relay().await,
        };

        match result {
            Ok(relay_state) => {
                self.state.send_modify(|state| {
                    let status = match &state.status {
                        Some(status) => status.with_relay(relay_state),
                        None => DeviceStatus::new(None, None, None).with_relay(relay_state),
                    };
                    state.status = Some(Arc::new(status));
                });
                self.device_reachable();
                info!("Relay is now {}", relay_text(relay_state));
                self.publish(self.topics.relay_status(), relay_text(relay_state).to_string());
            }
            Err(DeviceError::Unreachable(e)) => {
                warn!("Dropping command {:?}, device unreachable: {}", command, e);
                self.device_unreachable(&e);
            }
            Err(DeviceError::Protocol(e)) => {
                warn!("Command {:?} got an unusable answer: {}", command, e);
            }
        }
    }

    /// Cached relay state, if it is recent enough to stand in for a missing reading.
    fn fresh_relay(&self) -> Option<bool> {
        let state = self.state.borrow();
        state
            .status
            .as_ref()
            .filter(|s| !s.fallbacks.relay && !s.is_stale(self.config.stale_after()))
            .map(|s| s.relay_state)
    }

    fn publish_status(&self, status: &DeviceStatus, with_relay: bool) {
        if let Some(power) = status.publishable_power() {
            self.publish(self.topics.power(), power_payload(power));
        }
        if let Some(temperature) = status.temperature_celsius {
            self.publish(self.topics.temperature(), temperature_payload(temperature));
        }
        if let Some(relay_state) = status.publishable_relay().filter(|_| with_relay) {
            self.publish(self.topics.relay_status(), relay_text(relay_state).to_string());
        }
    }

    fn publish(&self, topic: String, payload: String) {
        if !self.state.borrow().broker_connected {
            debug!("Broker down, not publishing {}", topic);
            return;
        }
        self.broker.publish(&topic, payload, QoS::AtMostOnce);
    }

    fn device_unreachable(&self, reason: &str) {
        let changed = self
            .state
            .send_if_modified(|state| state.device_reachable.replace(false) != Some(false));
        if changed {
            warn!("Device unreachable: {}", reason);
        } else {
            debug!("Device still unreachable: {}", reason);
        }
        self.update_phase();
    }

    fn device_reachable(&self) {
        let changed = self
            .state
            .send_if_modified(|state| state.device_reachable.replace(true) != Some(true));
        if changed {
            info!("Device reachable");
        }
        self.update_phase();
    }

    fn on_broker_state(&self, connection: ConnectionState) {
        let connected = connection == ConnectionState::Connected;
        let changed = self.state.send_if_modified(|state| {
            let changed = state.broker_connected != connected;
            state.broker_connected = connected;
            changed
        });
        if changed {
            if connected {
                info!("Broker connected, command delivery is live");
            } else {
                warn!("Broker disconnected, suspending telemetry");
            }
        }
        self.update_phase();
    }

    fn update_phase(&self) {
        let mut transition = None;
        self.state.send_if_modified(|state| {
            let phase = state.derived_phase();
            if phase == state.phase {
                return false;
            }
            transition = Some((state.phase, phase));
            state.phase = phase;
            true
        });

        match transition {
            Some((from, Phase::Degraded)) => warn!("Bridge {} -> {}", from, Phase::Degraded),
            Some((from, to)) => info!("Bridge {} -> {}", from, to),
            None => {}
        }
    }
}
