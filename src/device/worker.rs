use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{DeviceError, DeviceResult};

use super::StatusReport;
use super::client::DeviceApi;

/// A request queued for the device worker, with the channel its answer goes back on.
enum DeviceRequest {
    ReadStatus {
        previous_relay: Option<bool>,
        reply: oneshot::Sender<DeviceResult<StatusReport>>,
    },
    ReadTemperature {
        reply: oneshot::Sender<DeviceResult<f64>>,
    },
    SetRelay {
        state: bool,
        reply: oneshot::Sender<DeviceResult<bool>>,
    },
    ToggleRelay {
        reply: oneshot::Sender<DeviceResult<bool>>,
    },
}

/// Cloneable front of the device worker. All clones share one queue, so the
/// plug never sees two requests at once.
#[derive(Clone)]
pub struct DeviceHandle {
    tx: mpsc::Sender<DeviceRequest>,
}

/// Moves `device` onto its own task and returns the handle feeding it.
/// The worker stops once every handle has been dropped, after finishing the
/// request it is working on.
pub fn spawn<D>(device: D, capacity: usize) -> (DeviceHandle, JoinHandle<()>)
where
    D: DeviceApi + 'static,
{
    let (tx, mut rx) = mpsc::channel::<DeviceRequest>(capacity);

    let handle = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                DeviceRequest::ReadStatus {
                    previous_relay,
                    reply,
                } => {
                    let _ = reply.send(device.read_status(previous_relay).await);
                }
                DeviceRequest::ReadTemperature { reply } => {
                    let _ = reply.send(device.read_temperature().await);
                }
                DeviceRequest::SetRelay { state, reply } => {
                    let _ = reply.send(device.set_relay(state).await);
                }
                DeviceRequest::ToggleRelay { reply } => {
                    let _ = reply.send(device.toggle_relay().await);
                }
            }
        }
        info!("Device worker stopped");
    });

    (DeviceHandle { tx }, handle)
}

impl DeviceHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<DeviceResult<T>>) -> DeviceRequest,
    ) -> DeviceResult<T> {
        let (reply, response) = oneshot::channel();
        if self.tx.send(request(reply)).await.is_err() {
            debug!("Device worker queue closed");
            return Err(DeviceError::Unreachable("device worker stopped".into()));
        }
        response
            .await
            .map_err(|_| DeviceError::Unreachable("device worker dropped request".into()))?
    }
}

#[async_trait]
impl DeviceApi for DeviceHandle {
    async fn read_status(&self, previous_relay: Option<bool>) -> DeviceResult<StatusReport> {
        self.call(|reply| DeviceRequest::ReadStatus {
            previous_relay,
            reply,
        })
        .await
    }

    async fn read_temperature(&self) -> DeviceResult<f64> {
        self.call(|reply| DeviceRequest::ReadTemperature { reply })
            .await
    }

    async fn set_relay(&self, state: bool) -> DeviceResult<bool> {
        self.call(|reply| DeviceRequest::SetRelay { state, reply })
            .await
    }

    async fn toggle_relay(&self) -> DeviceResult<bool> {
        self.call(|reply| DeviceRequest::ToggleRelay { reply })
            .await
    }
}
