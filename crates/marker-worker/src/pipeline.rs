//! Per-frame processing inside the worker.

use std::sync::Arc;

use marker_protocol::{Bitmap, Detection, RawMarkerEvent};
use tracing::{debug, trace, warn};

use crate::adapter::EngineAdapter;
use crate::engine::{EventQueue, FrameInput, SharedEngine, event_queue};
use crate::raster::RasterBuffer;

/// What one frame produced.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Markers read back from the engine after processing
    pub detections: Vec<Detection>,
    /// Raw listener events queued since the previous frame
    pub raw_events: Vec<RawMarkerEvent>,
}

/// Turns transferred bitmaps into detections.
pub struct FramePipeline {
    adapter: Arc<EngineAdapter>,
    engine: SharedEngine,
    raster: RasterBuffer,
    events: EventQueue,
}

impl FramePipeline {
    pub fn new(adapter: Arc<EngineAdapter>, engine: SharedEngine) -> Self {
        // Replaced by the session once `init` supplies the real queue.
        let (_, events) = event_queue(1);
        Self {
            adapter,
            engine,
            raster: RasterBuffer::new(),
            events,
        }
    }

    pub fn set_event_queue(&mut self, events: EventQueue) {
        self.events = events;
    }

    pub fn raster(&self) -> &RasterBuffer {
        &self.raster
    }

    /// Process one frame.
    ///
    /// Returns `None` when the frame was skipped: oversized, engine not
    /// ready, composite failure, or both submission paths failed. The bitmap
    /// is released exactly once on every path.
    pub async fn process_frame(
        &mut self,
        frame_id: u64,
        bitmap: Bitmap,
        width: u32,
        height: u32,
    ) -> Option<FrameOutcome> {
        if let Err(e) = RasterBuffer::check_size(width, height) {
            warn!(frame_id, "Dropping frame: {}", e);
            bitmap.close();
            return None;
        }
        if !self.adapter.ensure_initialized(width, height).await {
            trace!(frame_id, "Engine not ready, skipping frame");
            bitmap.close();
            return None;
        }

        match self.raster.ensure_size(width, height) {
            Ok(true) => debug!(width, height, "Allocated raster buffer"),
            Ok(false) => {}
            Err(e) => {
                warn!(frame_id, "Dropping frame: {}", e);
                bitmap.close();
                return None;
            }
        }

        let composited = self.raster.composite(&bitmap);
        bitmap.close();
        if let Err(e) = composited {
            warn!(frame_id, "Dropping frame: {}", e);
            return None;
        }

        let mut engine = self.engine.lock().await;
        if let Err(e) = engine.process(FrameInput::Raster(&self.raster)) {
            debug!(frame_id, "Raster submission failed, retrying with raw pixels: {}", e);
            let fallback = FrameInput::Pixels {
                data: self.raster.pixels(),
                width,
                height,
            };
            if let Err(e) = engine.process(fallback) {
                warn!(frame_id, "Frame processing failed: {}", e);
                return None;
            }
        }

        let detections = (0..engine.marker_count())
            .filter_map(|index| {
                let info = engine.marker(index)?;
                let pose = engine.pose(index)?;
                Some(Detection::from_engine(&info, pose, frame_id))
            })
            .collect();
        drop(engine);

        let raw_events = self.events.drain();
        if self.events.dropped() > 0 {
            trace!(frame_id, dropped = self.events.dropped(), "Raw event queue overflowed");
        }

        Some(FrameOutcome {
            detections,
            raw_events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MessageReceiver, local_pair};
    use crate::engine::{DetectionEngine, ENGINE_API_VERSION, EventSink, share};
    use crate::error::EngineError;
    use async_trait::async_trait;
    use marker_protocol::{EngineParams, MarkerId, PoseMatrix, RawMarkerInfo, WorkerMessage};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Script {
        fail_init: bool,
        fail_raster: bool,
        fail_pixels: bool,
        inits: usize,
        inputs: Vec<&'static str>,
        sink: Option<EventSink>,
    }

    struct ScriptedEngine {
        script: Arc<Mutex<Script>>,
        found: Vec<(RawMarkerInfo, PoseMatrix)>,
    }

    #[async_trait]
    impl DetectionEngine for ScriptedEngine {
        fn api_version(&self) -> u32 {
            ENGINE_API_VERSION
        }

        async fn initialize(&mut self, _: &EngineParams, _: u32, _: u32) -> Result<(), EngineError> {
            let mut script = self.script.lock();
            script.inits += 1;
            if script.fail_init {
                return Err(EngineError::Initialization("no camera parameters".into()));
            }
            Ok(())
        }

        async fn load_pattern(&mut self, _: &str, _: f64) -> Result<MarkerId, EngineError> {
            Ok(MarkerId(0))
        }

        fn attach_listener(&mut self, sink: EventSink) {
            self.script.lock().sink = Some(sink);
        }

        fn process(&mut self, input: FrameInput<'_>) -> Result<(), EngineError> {
            let mut script = self.script.lock();
            match input {
                FrameInput::Raster(_) => {
                    script.inputs.push("raster");
                    if script.fail_raster {
                        return Err(EngineError::Processing("canvas unsupported".into()));
                    }
                }
                FrameInput::Pixels { .. } => {
                    script.inputs.push("pixels");
                    if script.fail_pixels {
                        return Err(EngineError::Processing("bad buffer".into()));
                    }
                }
            }
            if let Some(sink) = &script.sink {
                for (info, pose) in &self.found {
                    sink.push(RawMarkerEvent {
                        marker_type: 0,
                        matrix: pose.to_vec(),
                        marker: info.clone(),
                    });
                }
            }
            Ok(())
        }

        fn marker_count(&self) -> usize {
            self.found.len()
        }

        fn marker(&self, index: usize) -> Option<RawMarkerInfo> {
            self.found.get(index).map(|(info, _)| info.clone())
        }

        fn pose(&self, index: usize) -> Option<PoseMatrix> {
            self.found.get(index).map(|(_, pose)| *pose)
        }
    }

    fn pipeline(script: &Arc<Mutex<Script>>) -> FramePipeline {
        pipeline_with_outbound(script).0
    }

    fn pipeline_with_outbound(script: &Arc<Mutex<Script>>) -> (FramePipeline, MessageReceiver<WorkerMessage>) {
        let engine = ScriptedEngine {
            script: Arc::clone(script),
            found: vec![(RawMarkerInfo::pattern(4, 0.8), std::array::from_fn(|i| i as f64))],
        };
        let engine = share(Box::new(engine));
        let (tx, rx) = local_pair::<WorkerMessage>();
        let adapter = Arc::new(EngineAdapter::new(Arc::clone(&engine), tx));
        let (sink, queue) = event_queue(16);
        adapter.configure(EngineParams::default(), sink);

        let mut pipeline = FramePipeline::new(adapter, engine);
        pipeline.set_event_queue(queue);
        (pipeline, rx)
    }

    fn counted_bitmap(releases: &Arc<AtomicUsize>, width: u32, height: u32) -> Bitmap {
        let releases = Arc::clone(releases);
        Bitmap::filled(width, height, [255, 255, 255, 255]).with_release_hook(move || {
            releases.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_yields_detections_and_raw_events() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut pipeline = pipeline(&script);
        let releases = Arc::new(AtomicUsize::new(0));

        let outcome = pipeline
            .process_frame(11, counted_bitmap(&releases, 4, 4), 4, 4)
            .await
            .unwrap();

        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.detections.len(), 1);
        assert_eq!(outcome.detections[0].frame_id, 11);
        assert_eq!(outcome.detections[0].id, MarkerId(4));
        assert_eq!(outcome.detections[0].pose_matrix[15], 15.0);
        assert_eq!(outcome.raw_events.len(), 1);
        assert_eq!(script.lock().inputs, vec!["raster"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raster_reused_across_same_size_frames() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut pipeline = pipeline(&script);
        let releases = Arc::new(AtomicUsize::new(0));

        for frame_id in 0..3 {
            pipeline
                .process_frame(frame_id, counted_bitmap(&releases, 8, 6), 8, 6)
                .await
                .unwrap();
        }
        assert_eq!(pipeline.raster().allocations(), 1);

        pipeline
            .process_frame(3, counted_bitmap(&releases, 4, 4), 16, 12)
            .await
            .unwrap();
        assert_eq!(pipeline.raster().allocations(), 2);
        assert_eq!(releases.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_pixels_once() {
        let script = Arc::new(Mutex::new(Script {
            fail_raster: true,
            ..Default::default()
        }));
        let mut pipeline = pipeline(&script);
        let releases = Arc::new(AtomicUsize::new(0));

        let outcome = pipeline.process_frame(1, counted_bitmap(&releases, 2, 2), 2, 2).await;
        assert!(outcome.is_some());
        assert_eq!(script.lock().inputs, vec!["raster", "pixels"]);

        script.lock().fail_pixels = true;
        let outcome = pipeline.process_frame(2, counted_bitmap(&releases, 2, 2), 2, 2).await;
        assert!(outcome.is_none());
        assert_eq!(script.lock().inputs, vec!["raster", "pixels", "raster", "pixels"]);
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uninitialized_engine_skips_and_releases() {
        let script = Arc::new(Mutex::new(Script {
            fail_init: true,
            ..Default::default()
        }));
        let mut pipeline = pipeline(&script);
        let releases = Arc::new(AtomicUsize::new(0));

        assert!(pipeline.process_frame(1, counted_bitmap(&releases, 2, 2), 2, 2).await.is_none());
        assert!(pipeline.process_frame(2, counted_bitmap(&releases, 2, 2), 2, 2).await.is_none());
        assert_eq!(releases.load(Ordering::SeqCst), 2);
        assert!(script.lock().inputs.is_empty());
        assert_eq!(pipeline.raster().allocations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_inside_backoff_window_stay_quiet() {
        let script = Arc::new(Mutex::new(Script {
            fail_init: true,
            ..Default::default()
        }));
        let (mut pipeline, mut rx) = pipeline_with_outbound(&script);
        let releases = Arc::new(AtomicUsize::new(0));

        for frame_id in 0..5 {
            let outcome = pipeline.process_frame(frame_id, counted_bitmap(&releases, 2, 2), 2, 2).await;
            assert!(outcome.is_none());
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(script.lock().inits, 1);
        assert_eq!(releases.load(Ordering::SeqCst), 5);

        let mut errors = 0;
        while let Some(msg) = rx.try_recv() {
            assert!(matches!(msg, WorkerMessage::Error { .. }), "unexpected {msg:?}");
            errors += 1;
        }
        assert_eq!(errors, 1);

        // Once the window has passed the next frame retries.
        tokio::time::advance(Duration::from_millis(600)).await;
        pipeline.process_frame(5, counted_bitmap(&releases, 2, 2), 2, 2).await;
        assert_eq!(script.lock().inits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_frame_skips_engine() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut pipeline = pipeline(&script);
        let releases = Arc::new(AtomicUsize::new(0));

        let outcome = pipeline
            .process_frame(1, counted_bitmap(&releases, 2, 2), 100_000, 100_000)
            .await;
        assert!(outcome.is_none());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(script.lock().inits, 0);
        assert_eq!(pipeline.raster().allocations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sized_bitmap_is_dropped() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut pipeline = pipeline(&script);
        let releases = Arc::new(AtomicUsize::new(0));

        let outcome = pipeline.process_frame(1, counted_bitmap(&releases, 0, 0), 4, 4).await;
        assert!(outcome.is_none());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(script.lock().inputs.is_empty());
    }
}
