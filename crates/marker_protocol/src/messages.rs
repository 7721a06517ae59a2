//! Messages exchanged between the control side and the worker.
//!
//! Both enums are internally tagged on `type` so the same values travel over
//! the in-process channel unchanged and over a framed byte stream as JSON.

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::detection::{Detection, MarkerId, RawMarkerEvent};

// ─────────────────────────────────────────────────────────────────────────────
// Worker options
// ─────────────────────────────────────────────────────────────────────────────

/// Bootstrap parameters for the detection engine.
///
/// Values are opaque to the tracker and passed to the engine unvalidated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineParams {
    #[serde(default, alias = "module_url", skip_serializing_if = "Option::is_none")]
    pub module_url: Option<String>,
    #[serde(default, alias = "camera_parameters_url", skip_serializing_if = "Option::is_none")]
    pub camera_parameters_url: Option<String>,
}

/// Options carried by the `init` handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    #[serde(default)]
    pub engine: EngineParams,
    /// Capacity of the queue holding raw engine events between frame ticks.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_event_queue_capacity() -> usize {
    64
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            engine: EngineParams::default(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control → Worker
// ─────────────────────────────────────────────────────────────────────────────

/// Messages sent from the control side to the worker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Configure the worker session. Answered with `ready`.
    Init { options: WorkerOptions },

    /// Load a marker pattern. Answered with `loadMarkerResult`.
    LoadMarker {
        pattern_key: String,
        size: f64,
        request_id: u64,
    },

    /// Process one frame. The bitmap is absent on metadata-only submissions.
    ProcessFrame {
        frame_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bitmap: Option<Bitmap>,
        width: u32,
        height: u32,
    },
}

impl ControlMessage {
    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Init { .. } => "init",
            ControlMessage::LoadMarker { .. } => "loadMarker",
            ControlMessage::ProcessFrame { .. } => "processFrame",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker → Control
// ─────────────────────────────────────────────────────────────────────────────

/// Messages sent from the worker to the control side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// The worker processed `init` and accepts requests.
    Ready,

    /// Reply to `loadMarker`.
    LoadMarkerResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        marker_id: Option<MarkerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        request_id: u64,
    },

    /// Markers detected in one frame. Only sent when non-empty.
    DetectionResult {
        frame_id: u64,
        detections: Vec<Detection>,
    },

    /// The worker is done with a frame, whatever the outcome.
    FrameComplete { frame_id: u64 },

    /// Worker-side failure worth surfacing to the host.
    Error { message: String },

    /// Raw engine event, passed through for host-side filtering.
    GetMarker { event: RawMarkerEvent },
}

impl WorkerMessage {
    pub fn load_ok(request_id: u64, marker_id: MarkerId) -> Self {
        WorkerMessage::LoadMarkerResult {
            ok: true,
            marker_id: Some(marker_id),
            error: None,
            request_id,
        }
    }

    pub fn load_failed(request_id: u64, error: impl Into<String>) -> Self {
        WorkerMessage::LoadMarkerResult {
            ok: false,
            marker_id: None,
            error: Some(error.into()),
            request_id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WorkerMessage::Error {
            message: message.into(),
        }
    }

    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Ready => "ready",
            WorkerMessage::LoadMarkerResult { .. } => "loadMarkerResult",
            WorkerMessage::DetectionResult { .. } => "detectionResult",
            WorkerMessage::FrameComplete { .. } => "frameComplete",
            WorkerMessage::Error { .. } => "error",
            WorkerMessage::GetMarker { .. } => "getMarker",
        }
    }
}
