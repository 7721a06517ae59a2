//! Host-facing tracker events.

use chrono::Utc;
use marker_protocol::{Corners, Detection, MarkerId, PoseMatrix, RawMarkerEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default capacity of the host event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A marker seen in a frame, as reported to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerSighting {
    pub id: MarkerId,
    pub pose_matrix: PoseMatrix,
    pub confidence: f64,
    pub corners: Corners,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl MarkerSighting {
    pub fn from_detection(detection: &Detection, timestamp: i64) -> Self {
        Self {
            id: detection.id,
            pose_matrix: detection.pose_matrix,
            confidence: detection.confidence,
            corners: detection.corners,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TrackerEvent {
    WorkerReady,
    MarkerFound(MarkerSighting),
    MarkerUpdated(MarkerSighting),
    MarkerLost { id: MarkerId, timestamp: i64 },
    WorkerError { message: String },
    /// Raw engine event that passed the filter
    GetMarker { event: RawMarkerEvent },
}

impl TrackerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerReady => "workerReady",
            Self::MarkerFound(_) => "markerFound",
            Self::MarkerUpdated(_) => "markerUpdated",
            Self::MarkerLost { .. } => "markerLost",
            Self::WorkerError { .. } => "workerError",
            Self::GetMarker { .. } => "getMarker",
        }
    }

    pub fn worker_error(message: impl Into<String>) -> Self {
        Self::WorkerError {
            message: message.into(),
        }
    }
}

/// Broadcasts tracker events to any number of host subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: TrackerEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!(kind, "No subscribers for tracker event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}
