//! Tracks a marker through a simulated engine on a worker thread.
//!
//! Run with: cargo run -p marker-tracker --example simulated

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use marker_protocol::{Bitmap, EngineParams, MarkerId, PoseMatrix, RawMarkerEvent, RawMarkerInfo};
use marker_tracker::{MarkerTracker, TrackerConfig, TrackerEvent};
use marker_worker::{DetectionEngine, ENGINE_API_VERSION, EngineError, EngineSpawner, EventSink, FrameInput};

/// Sees the "hiro" marker for the first 20 frames, then nothing.
struct SimulatedEngine {
    frames: Arc<AtomicU64>,
    sink: Option<EventSink>,
    in_view: bool,
}

#[async_trait]
impl DetectionEngine for SimulatedEngine {
    fn api_version(&self) -> u32 {
        ENGINE_API_VERSION
    }

    async fn initialize(&mut self, _: &EngineParams, width: u32, height: u32) -> Result<(), EngineError> {
        tracing::info!(width, height, "Simulated engine initialized");
        Ok(())
    }

    async fn load_pattern(&mut self, _: &str, _: f64) -> Result<MarkerId, EngineError> {
        Ok(MarkerId(0))
    }

    fn attach_listener(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn process(&mut self, _: FrameInput<'_>) -> Result<(), EngineError> {
        self.in_view = self.frames.fetch_add(1, Ordering::SeqCst) < 20;
        if let (true, Some(sink)) = (self.in_view, &self.sink) {
            sink.push(RawMarkerEvent {
                marker_type: 0,
                matrix: identity().to_vec(),
                marker: RawMarkerInfo::pattern(0, 0.95),
            });
        }
        Ok(())
    }

    fn marker_count(&self) -> usize {
        usize::from(self.in_view)
    }

    fn marker(&self, _: usize) -> Option<RawMarkerInfo> {
        self.in_view.then(|| RawMarkerInfo::pattern(0, 0.95))
    }

    fn pose(&self, _: usize) -> Option<PoseMatrix> {
        self.in_view.then(identity)
    }
}

fn identity() -> PoseMatrix {
    std::array::from_fn(|i| if i % 5 == 0 { 1.0 } else { 0.0 })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let frames = Arc::new(AtomicU64::new(0));
    let spawner = EngineSpawner::new(move || {
        Box::new(SimulatedEngine {
            frames: Arc::clone(&frames),
            sink: None,
            in_view: false,
        }) as Box<dyn DetectionEngine>
    });

    let tracker = MarkerTracker::new(TrackerConfig::default(), spawner);
    let mut events = tracker.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TrackerEvent::GetMarker { .. } => {}
                event => println!("{}", serde_json::to_string(&event).unwrap_or_default()),
            }
        }
    });

    tracker.enable().expect("worker should start");
    let id = tracker.load_marker("data/patt.hiro", 1.0).await.expect("pattern should load");
    println!("Loaded pattern as marker {id}");

    let mut ticker = tokio::time::interval(Duration::from_millis(33));
    for frame_id in 0..60 {
        ticker.tick().await;
        tracker.submit_frame(frame_id, Bitmap::filled(64, 48, [128, 128, 128, 255]), 64, 48);
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;
    tracker.disable();
}
