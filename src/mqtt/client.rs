use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::Broker;
use crate::config::MqttConfig;
use crate::error::BrokerError;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

struct Subscription {
    filter: String,
    handler: mpsc::Sender<MqttMessage>,
}

struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Mutex<Vec<Subscription>>,
    dropped: AtomicU64,
    warned_dropping: AtomicBool,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    fn filters(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.filter.clone())
            .collect()
    }

    fn handlers_for(&self, topic: &str) -> Vec<mpsc::Sender<MqttMessage>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| topic_matches(&s.filter, topic))
            .map(|s| s.handler.clone())
            .collect()
    }
}

/// Handle to a live broker session. Cloning shares the session.
#[derive(Clone)]
pub struct BrokerSession {
    client: AsyncClient,
    shared: Arc<Shared>,
}

impl BrokerSession {
    /// Connects to the broker and waits for the first CONNACK. From then on
    /// the returned driver task keeps the session alive, reconnecting and
    /// restoring subscriptions on its own until `shutdown` flips to true.
    pub async fn connect(
        config: &MqttConfig,
        availability_topic: String,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>), BrokerError> {
        let (session, mut driver) = Self::new(config, availability_topic);

        loop {
            match driver.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    driver.on_connack();
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(BrokerError::Unreachable(e.to_string()));
                }
            }
        }

        let handle = tokio::spawn(driver.run(shutdown));
        Ok((session, handle))
    }

    fn new(config: &MqttConfig, availability_topic: String) -> (Self, SessionDriver) {
        let mut options = MqttOptions::new(
            &config.client_id,
            &config.broker_host,
            config.broker_port,
        );
        options.set_keep_alive(config.keepalive);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        options.set_last_will(LastWill::new(
            &availability_topic,
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, 100);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state_tx,
            subscriptions: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            warned_dropping: AtomicBool::new(false),
        });

        let driver = SessionDriver {
            client: client.clone(),
            eventloop,
            shared: shared.clone(),
            availability_topic,
            restoring: None,
        };

        (Self { client, shared }, driver)
    }

    /// Registers `handler` for every inbound message matching `filter`. The
    /// subscription survives reconnects.
    pub fn subscribe(
        &self,
        filter: &str,
        handler: mpsc::Sender<MqttMessage>,
    ) -> Result<(), BrokerError> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                filter: filter.to_string(),
                handler,
            });

        if self.shared.is_connected() {
            self.client.try_subscribe(filter, QoS::AtLeastOnce)?;
        }
        info!("Subscribed to {}", filter);
        Ok(())
    }

    /// Watch for `Connected`/`Disconnected` transitions.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Messages dropped because the session was disconnected or the client
    /// queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn drop_message(&self, topic: &str, reason: &str) {
        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        if !self.shared.warned_dropping.swap(true, Ordering::Relaxed) {
            warn!("Dropping outbound messages: {}", reason);
        }
        debug!("Dropped publish to {}", topic);
    }
}

impl Broker for BrokerSession {
    /// Never blocks: the message goes into the client queue or is dropped.
    fn publish(&self, topic: &str, payload: String, qos: QoS) {
        if !self.shared.is_connected() {
            self.drop_message(topic, "broker disconnected");
            return;
        }

        match self.client.try_publish(topic, qos, false, payload) {
            Ok(()) => {
                self.shared.warned_dropping.store(false, Ordering::Relaxed);
            }
            Err(e) => self.drop_message(topic, &e.to_string()),
        }
    }

    fn subscribe(
        &self,
        filter: &str,
        handler: mpsc::Sender<MqttMessage>,
    ) -> Result<(), BrokerError> {
        BrokerSession::subscribe(self, filter, handler)
    }
}

/// Owns the rumqttc event loop: reconnects, restores subscriptions and fans
/// inbound publishes out to their handlers.
struct SessionDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    shared: Arc<Shared>,
    availability_topic: String,
    /// SUBACKs still expected before the session counts as ready again.
    restoring: Option<usize>,
}

impl SessionDriver {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(incoming)) => self.on_incoming(incoming),
                        Ok(Event::Outgoing(_)) => {}
                        Err(e) => {
                            if self.set_state(ConnectionState::Disconnected) {
                                error!("MQTT connection lost: {}. Reconnecting...", e);
                            } else {
                                debug!("MQTT reconnect failed: {}", e);
                            }
                            self.restoring = None;

                            tokio::select! {
                                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                                changed = shutdown.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }

        self.disconnect().await;
    }

    fn on_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::ConnAck(_) => self.on_connack(),
            Incoming::SubAck(_) => {
                if let Some(pending) = self.restoring.as_mut() {
                    *pending = pending.saturating_sub(1);
                    if *pending == 0 {
                        self.restoring = None;
                        self.ready();
                    }
                }
            }
            Incoming::Publish(publish) => {
                let message = MqttMessage {
                    topic: publish.topic.clone(),
                    payload: String::from_utf8_lossy(&publish.payload).to_string(),
                };
                self.deliver(message);
            }
            _ => {}
        }
    }

    fn on_connack(&mut self) {
        info!("Connected to MQTT broker");

        if let Err(e) = self.client.try_publish(
            &self.availability_topic,
            QoS::AtLeastOnce,
            true,
            "online",
        ) {
            error!("Failed to publish online status: {}", e);
        }

        let filters = self.shared.filters();
        let mut pending = 0;
        for filter in &filters {
            match self.client.try_subscribe(filter, QoS::AtLeastOnce) {
                Ok(()) => pending += 1,
                Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
            }
        }

        if pending == 0 {
            self.ready();
        } else {
            debug!("Restoring {} subscriptions", pending);
            self.restoring = Some(pending);
        }
    }

    fn ready(&self) {
        if self.set_state(ConnectionState::Connected) {
            info!("MQTT session ready");
        }
    }

    /// Returns true when the state actually changed.
    fn set_state(&self, state: ConnectionState) -> bool {
        self.shared.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    fn deliver(&self, message: MqttMessage) {
        let handlers = self.shared.handlers_for(&message.topic);
        if handlers.is_empty() {
            debug!("No handler for {}", message.topic);
            return;
        }

        for handler in handlers {
            if let Err(e) = handler.try_send(message.clone()) {
                warn!("Inbound message on {} dropped: {}", message.topic, e);
            }
        }
    }

    async fn disconnect(mut self) {
        info!("Disconnecting from MQTT broker");

        if self.shared.is_connected() {
            let _ = self.client.try_publish(
                &self.availability_topic,
                QoS::AtLeastOnce,
                true,
                "offline",
            );
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to request disconnect: {}", e);
            }

            let flush = async {
                loop {
                    match self.eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
                warn!("MQTT disconnect did not complete in time");
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig {
            broker_host: "127.0.0.1".into(),
            broker_port: 1883,
            username: None,
            password: None,
            client_id: "test".into(),
            keepalive: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("plug/a/relay/set", "plug/a/relay/set"));
        assert!(topic_matches("plug/+/relay/set", "plug/a/relay/set"));
        assert!(topic_matches("plug/a/#", "plug/a/relay/set"));
        assert!(topic_matches("#", "plug"));
        assert!(!topic_matches("plug/a/relay/set", "plug/a/relay/status"));
        assert!(!topic_matches("plug/+", "plug/a/relay"));
        assert!(!topic_matches("plug/a/relay", "plug/a"));
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_dropped() {
        let (session, _driver) = BrokerSession::new(&config(), "plug/a/bridge_status".into());
        assert_eq!(*session.connection_state().borrow(), ConnectionState::Disconnected);

        session.publish("plug/a/power", "{\"power\":1.0}".into(), QoS::AtMostOnce);
        session.publish("plug/a/power", "{\"power\":2.0}".into(), QoS::AtMostOnce);
        assert_eq!(session.dropped_count(), 2);
    }

    #[tokio::test]
    async fn test_subscriptions_are_remembered() {
        let (session, _driver) = BrokerSession::new(&config(), "plug/a/bridge_status".into());
        let (tx, _rx) = mpsc::channel(1);

        session.subscribe("plug/a/relay/set", tx.clone()).unwrap();
        session.subscribe("plug/a/relay/toggle", tx).unwrap();

        assert_eq!(
            session.shared.filters(),
            vec!["plug/a/relay/set", "plug/a/relay/toggle"]
        );
    }

    #[tokio::test]
    async fn test_connack_restores_subscriptions_before_ready() {
        let (session, mut driver) = BrokerSession::new(&config(), "plug/a/bridge_status".into());
        let (tx, _rx) = mpsc::channel(1);
        session.subscribe("plug/a/relay/set", tx.clone()).unwrap();
        session.subscribe("plug/a/relay/toggle", tx).unwrap();
        let state = session.connection_state();

        driver.on_connack();
        assert_eq!(driver.restoring, Some(2));
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        driver.on_incoming(Incoming::SubAck(rumqttc::SubAck::new(1, vec![])));
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        driver.on_incoming(Incoming::SubAck(rumqttc::SubAck::new(2, vec![])));
        assert_eq!(*state.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_inbound_publish_reaches_matching_handler() {
        let (session, driver) = BrokerSession::new(&config(), "plug/a/bridge_status".into());
        let (set_tx, mut set_rx) = mpsc::channel(4);
        let (other_tx, mut other_rx) = mpsc::channel(4);
        session.subscribe("plug/a/relay/set", set_tx).unwrap();
        session.subscribe("plug/b/#", other_tx).unwrap();

        driver.deliver(MqttMessage {
            topic: "plug/a/relay/set".into(),
            payload: "open".into(),
        });

        let message = set_rx.try_recv().unwrap();
        assert_eq!(message.payload, "open");
        assert!(other_rx.try_recv().is_err());
    }
}
