use chrono::{DateTime, Utc};
use model::TrainId;
use serde::Serialize;
use tokio::sync::broadcast;
use track::Line;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WarningKind {
    Conflict,
    BlockFailure,
    TrainFailure,
    ClosureFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Events the core publishes for display collaborators. Replaces direct UI
/// signalling; subscribers hold a broadcast receiver and render as they like.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CtcEvent {
    TrainUpdated { train: TrainId },
    TrainRemoved { train: TrainId },
    MapUpdated { line: Line },
    WarningRaised { warning: Warning },
    EmergencyRaised { description: String },
    ThroughputUpdated { line: Line, total: u32 },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CtcEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CtcEvent> {
        self.tx.subscribe()
    }

    /// Publishing without subscribers is fine; the event is dropped.
    pub fn publish(&self, event: CtcEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("event published without subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
