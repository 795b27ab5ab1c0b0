mod bridge;
mod config;
mod device;
mod error;
mod mqtt;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bridge::Bridge;
use crate::device::client::HttpDeviceClient;
use crate::mqtt::Topics;
use crate::mqtt::client::BrokerSession;

const BROKER_RETRY_DELAY: Duration = Duration::from_secs(5);
const DEVICE_QUEUE: usize = 16;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting mystrom-mqtt-bridge (plug={} as {}, mqtt={}:{}, poll every {:?})",
        config.device.ip,
        config.device.id,
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.bridge.poll_interval,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let client = match HttpDeviceClient::new(config.device.ip, config.device.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let (device, device_worker) = device::worker::spawn(client, DEVICE_QUEUE);

    let topics = Topics::new(&config.device.id);
    let Some((session, session_driver)) =
        connect_broker(&config.mqtt, &topics, shutdown_rx.clone()).await
    else {
        info!("Shut down before the broker became reachable");
        return;
    };

    let bridge = Bridge::new(device, session.clone(), topics, config.bridge.clone());
    bridge
        .clone()
        .run(session.connection_state(), shutdown_rx)
        .await;

    let last = bridge.snapshot();
    // Dropping the bridge releases the last device handle; the worker then
    // finishes its current request and exits.
    drop(bridge);
    if let Err(e) = device_worker.await {
        error!("Device worker failed: {}", e);
    }
    if let Err(e) = session_driver.await {
        error!("MQTT session failed: {}", e);
    }

    info!(
        "mystrom-mqtt-bridge stopped after {} polls (relay {:?}, {} outbound messages dropped)",
        last.sequence,
        last.relay_state().map(device::relay_text),
        session.dropped_count()
    );
}

/// Retries the initial broker connection until it succeeds or shutdown is
/// requested. Later reconnects are handled by the session itself.
async fn connect_broker(
    config: &config::MqttConfig,
    topics: &Topics,
    mut shutdown: watch::Receiver<bool>,
) -> Option<(BrokerSession, JoinHandle<()>)> {
    loop {
        tokio::select! {
            result = BrokerSession::connect(config, topics.bridge_status(), shutdown.clone()) => {
                match result {
                    Ok(session) => return Some(session),
                    Err(e) => error!("{}. Retrying in {:?}", e, BROKER_RETRY_DELAY),
                }
            }
            _ = shutdown.changed() => return None,
        }

        tokio::select! {
            _ = tokio::time::sleep(BROKER_RETRY_DELAY) => {}
            _ = shutdown.changed() => return None,
        }
    }
}

async fn wait_for_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = async {
            let mut sigterm = tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate()
            ).expect("Failed to register SIGTERM handler");
            sigterm.recv().await;
        } => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
