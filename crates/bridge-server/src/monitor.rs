//! Background reader of unsolicited device output.
//!
//! The monitor is the only consumer of edge lines. It idles cheaply while
//! the device is down or nobody listens for edges, otherwise drains the link
//! every `drain_interval` and pushes each classified [`ButtonEvent`] into the
//! fan-out channel in drain order.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::ButtonEvent;
use bridge_device::DeviceManager;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::subscriptions::{Capability, SubscriptionRegistry};

pub struct EventMonitor {
    device: Arc<DeviceManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    events: mpsc::Sender<ButtonEvent>,
    idle_poll: Duration,
    drain_interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventMonitor {
    pub fn new(
        device: Arc<DeviceManager>,
        subscriptions: Arc<SubscriptionRegistry>,
        events: mpsc::Sender<ButtonEvent>,
        idle_poll: Duration,
        drain_interval: Duration,
    ) -> Self {
        Self {
            device,
            subscriptions,
            events,
            idle_poll,
            drain_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the loop unless a run is already active. Returns whether a new
    /// run was spawned. After [`shutdown`](Self::shutdown) this is a no-op.
    pub fn ensure_running(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        tracing::info!("Starting Arduino event monitoring");
        *task = Some(tokio::spawn(run(
            Arc::clone(&self.device),
            Arc::clone(&self.subscriptions),
            self.events.clone(),
            self.idle_poll,
            self.drain_interval,
            self.cancel.clone(),
        )));
        true
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Event monitor ended abnormally");
            }
        }
    }
}

async fn run(
    device: Arc<DeviceManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    events: mpsc::Sender<ButtonEvent>,
    idle_poll: Duration,
    drain_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let active = device.is_connected() && subscriptions.has_subscribers(Capability::ButtonEdges);
        if !active {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle_poll) => continue,
            }
        }

        let lines = tokio::select! {
            _ = cancel.cancelled() => break,
            lines = async { device.lock().await.drain_lines().await } => lines,
        };

        for line in lines {
            match ButtonEvent::from_line(&line) {
                Some(event) => {
                    tracing::info!(event = %event.kind, "Button event");
                    if events.send(event).await.is_err() {
                        tracing::info!("Fan-out channel closed, stopping event monitoring");
                        return;
                    }
                }
                None => tracing::trace!(line = %line, "Discarding non-event line"),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(drain_interval) => {}
        }
    }
    tracing::info!("Arduino event monitoring cancelled");
}
