// src/sinks.rs
//
// Outbound collaborators of the watcher: where display updates and alerts
// go. Delivery runs on its own task behind a bounded queue so a slow or
// failing sink never delays the next poll.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{AlertEvent, Anchor, PositionSample};

/// Receives user-facing alerts. Delivery failures stay with the sink.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Receives state changes worth redrawing
pub trait DisplaySink: Send + Sync {
    fn on_position_updated(&self, sample: &PositionSample);
    fn on_anchor_loaded(&self, anchor: &Anchor);
}

/// Writes alerts to the log
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, title: &str, body: &str) {
        warn!("{}: {}", title, body);
    }
}

/// Writes display updates to the log
pub struct LogDisplaySink;

impl DisplaySink for LogDisplaySink {
    fn on_position_updated(&self, sample: &PositionSample) {
        info!(
            "Position {} altitude {} at {}",
            sample.display_coordinates(),
            sample.display_altitude(),
            sample.timestamp()
        );
    }

    fn on_anchor_loaded(&self, anchor: &Anchor) {
        info!(
            "Anchor {} altitude {} saved at {}",
            anchor.display_coordinates(),
            anchor.display_altitude(),
            anchor.timestamp()
        );
    }
}

#[derive(Debug, Clone)]
pub enum SinkEvent {
    PositionUpdated(PositionSample),
    AnchorLoaded(Anchor),
    Alert(AlertEvent),
}

impl SinkEvent {
    fn kind(&self) -> &'static str {
        match self {
            SinkEvent::PositionUpdated(_) => "position update",
            SinkEvent::AnchorLoaded(_) => "anchor load",
            SinkEvent::Alert(_) => "alert",
        }
    }
}

/// Sending half of the sink queue
#[derive(Clone)]
pub struct SinkQueue {
    tx: mpsc::Sender<SinkEvent>,
}

impl SinkQueue {
    /// Queue an event without waiting. Returns false when the event was
    /// dropped because the queue is full or the dispatcher is gone.
    pub fn push(&self, event: SinkEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Sink queue full, dropping {}", event.kind());
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!("Sink dispatcher stopped, dropping {}", event.kind());
                false
            }
        }
    }
}

/// Start the dispatcher task. It ends once every `SinkQueue` clone is
/// dropped and the queue has drained.
pub fn spawn_dispatcher(
    display: Arc<dyn DisplaySink>,
    notifier: Arc<dyn NotificationSink>,
    capacity: usize,
) -> (SinkQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<SinkEvent>(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let kind = event.kind();
            let delivered = catch_unwind(AssertUnwindSafe(|| match &event {
                SinkEvent::PositionUpdated(sample) => display.on_position_updated(sample),
                SinkEvent::AnchorLoaded(anchor) => display.on_anchor_loaded(anchor),
                SinkEvent::Alert(alert) => notifier.notify(&alert.title(), &alert.body()),
            }));
            if delivered.is_err() {
                error!("Sink panicked while handling {}", kind);
            }
        }
    });

    (SinkQueue { tx }, handle)
}
