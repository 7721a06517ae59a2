//! Detection engine contract.
//!
//! The recognition algorithm itself lives outside this crate. A worker talks
//! to it only through [`DetectionEngine`], a fixed and versioned interface:
//! bring-up, pattern loading, per-frame processing, a pull API for the
//! markers found in the last frame, and a push listener for raw events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use marker_protocol::{EngineParams, MarkerId, PoseMatrix, RawMarkerEvent, RawMarkerInfo};
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::raster::RasterBuffer;

/// Interface version a worker requires from its engine.
pub const ENGINE_API_VERSION: u32 = 1;

/// Engine shared between the adapter, the pattern registry and the pipeline.
pub type SharedEngine = Arc<tokio::sync::Mutex<Box<dyn DetectionEngine>>>;

/// Wrap an engine for sharing inside one worker session.
pub fn share(engine: Box<dyn DetectionEngine>) -> SharedEngine {
    Arc::new(tokio::sync::Mutex::new(engine))
}

/// Pixels handed to the engine for one frame.
#[derive(Debug, Clone, Copy)]
pub enum FrameInput<'a> {
    /// The worker's raster buffer (preferred path).
    Raster(&'a RasterBuffer),
    /// Plain RGBA8 pixels, used when the raster path fails.
    Pixels { data: &'a [u8], width: u32, height: u32 },
}

impl FrameInput<'_> {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            FrameInput::Raster(raster) => (raster.width(), raster.height()),
            FrameInput::Pixels { width, height, .. } => (*width, *height),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        match self {
            FrameInput::Raster(raster) => raster.pixels(),
            FrameInput::Pixels { data, .. } => data,
        }
    }
}

/// A marker detection engine.
///
/// Pose matrices are 4x4 column-major transforms, returned as the engine
/// computes them; workers forward them without reordering.
#[async_trait]
pub trait DetectionEngine: Send + 'static {
    /// Version of this interface the engine implements.
    fn api_version(&self) -> u32;

    /// Bring the engine up for frames of the given size.
    ///
    /// Called again with new dimensions when the frame size changes.
    async fn initialize(
        &mut self,
        params: &EngineParams,
        width: u32,
        height: u32,
    ) -> Result<(), EngineError>;

    /// Load a marker pattern and return the id the engine assigned to it.
    async fn load_pattern(&mut self, pattern_key: &str, size: f64) -> Result<MarkerId, EngineError>;

    /// Attach the raw event listener. Called at most once per engine.
    fn attach_listener(&mut self, sink: EventSink);

    /// Run detection on one frame.
    fn process(&mut self, input: FrameInput<'_>) -> Result<(), EngineError>;

    /// Number of markers found by the last `process` call.
    fn marker_count(&self) -> usize;

    /// Marker info for index `index` of the last frame.
    fn marker(&self, index: usize) -> Option<RawMarkerInfo>;

    /// Pose for index `index` of the last frame.
    fn pose(&self, index: usize) -> Option<PoseMatrix>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw event queue
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded queue between the engine's listener and the frame pipeline.
pub fn event_queue(capacity: usize) -> (EventSink, EventQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventSink {
            tx,
            dropped: Arc::clone(&dropped),
        },
        EventQueue { rx, dropped },
    )
}

/// Listener handle given to the engine.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RawMarkerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Queue an event. Returns `false` when the queue is full and the event
    /// was dropped.
    pub fn push(&self, event: RawMarkerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Receiving side of the raw event queue, drained once per frame.
pub struct EventQueue {
    rx: mpsc::Receiver<RawMarkerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventQueue {
    /// Take every queued event.
    pub fn drain(&mut self) -> Vec<RawMarkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: i32) -> RawMarkerEvent {
        RawMarkerEvent {
            marker_type: 0,
            matrix: vec![0.0; 16],
            marker: RawMarkerInfo::pattern(id, 1.0),
        }
    }

    #[test]
    fn test_queue_is_bounded() {
        let (sink, mut queue) = event_queue(2);
        assert!(sink.push(raw(1)));
        assert!(sink.push(raw(2)));
        assert!(!sink.push(raw(3)));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].marker_id(), MarkerId(1));
        assert_eq!(queue.dropped(), 1);
        assert!(queue.drain().is_empty());
    }
}
