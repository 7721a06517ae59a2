//! Worker session and its message loop.
//!
//! All worker-side state (engine handle, pattern cache, backoff, raster)
//! lives in one [`WorkerSession`]. The loop feeds it control messages until
//! the channel closes or a shutdown is signalled.

use std::sync::Arc;

use marker_protocol::{Bitmap, ControlMessage, WorkerMessage, WorkerOptions};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::adapter::EngineAdapter;
use crate::backoff::BackoffPolicy;
use crate::channel::{self, MessageReceiver, MessageSender};
use crate::engine::{self, DetectionEngine, SharedEngine, event_queue};
use crate::patterns::PatternRegistry;
use crate::pipeline::FramePipeline;

/// State of one worker execution context.
pub struct WorkerSession {
    name: String,
    outbound: MessageSender<WorkerMessage>,
    adapter: Arc<EngineAdapter>,
    patterns: PatternRegistry,
    pipeline: FramePipeline,
}

impl WorkerSession {
    pub fn new(
        name: impl Into<String>,
        engine: Box<dyn DetectionEngine>,
        outbound: MessageSender<WorkerMessage>,
    ) -> Self {
        Self::with_policy(name, engine, outbound, BackoffPolicy::default())
    }

    pub fn with_policy(
        name: impl Into<String>,
        engine: Box<dyn DetectionEngine>,
        outbound: MessageSender<WorkerMessage>,
        policy: BackoffPolicy,
    ) -> Self {
        let engine: SharedEngine = engine::share(engine);
        let adapter = Arc::new(EngineAdapter::with_policy(
            Arc::clone(&engine),
            outbound.clone(),
            policy,
        ));
        Self {
            name: name.into(),
            outbound: outbound.clone(),
            patterns: PatternRegistry::new(Arc::clone(&engine)),
            pipeline: FramePipeline::new(Arc::clone(&adapter), engine),
            adapter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patterns(&self) -> &PatternRegistry {
        &self.patterns
    }

    pub fn adapter(&self) -> &EngineAdapter {
        &self.adapter
    }

    /// Handle one control message.
    pub async fn handle(&mut self, msg: ControlMessage) {
        trace!(worker = %self.name, kind = msg.kind(), "Handling control message");
        match msg {
            ControlMessage::Init { options } => self.init(options),
            ControlMessage::LoadMarker {
                pattern_key,
                size,
                request_id,
            } => self.load_marker(pattern_key, size, request_id),
            ControlMessage::ProcessFrame {
                frame_id,
                bitmap,
                width,
                height,
            } => self.process_frame(frame_id, bitmap, width, height).await,
        }
    }

    fn init(&mut self, options: WorkerOptions) {
        let (sink, queue) = event_queue(options.event_queue_capacity);
        if self.adapter.configure(options.engine, sink) {
            self.pipeline.set_event_queue(queue);
        } else {
            debug!(worker = %self.name, "Listener already attached, keeping existing event queue");
        }
        self.reply(WorkerMessage::Ready);
    }

    /// Each load runs on its own task and replies when it settles. The
    /// registry deduplicates concurrent requests for the same key.
    fn load_marker(&self, pattern_key: String, size: f64, request_id: u64) {
        let patterns = self.patterns.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let reply = match patterns.load_once(&pattern_key, size).await {
                Ok(marker_id) => WorkerMessage::load_ok(request_id, marker_id),
                Err(e) => WorkerMessage::load_failed(request_id, e.to_string()),
            };
            if outbound.send(reply).is_err() {
                debug!(request_id, "Control side gone, load result dropped");
            }
        });
    }

    async fn process_frame(&mut self, frame_id: u64, bitmap: Option<Bitmap>, width: u32, height: u32) {
        match bitmap {
            Some(bitmap) => {
                if let Some(outcome) = self.pipeline.process_frame(frame_id, bitmap, width, height).await {
                    for event in outcome.raw_events {
                        self.reply(WorkerMessage::GetMarker { event });
                    }
                    if !outcome.detections.is_empty() {
                        self.reply(WorkerMessage::DetectionResult {
                            frame_id,
                            detections: outcome.detections,
                        });
                    }
                }
            }
            None => debug!(frame_id, width, height, "Metadata-only frame, nothing to process"),
        }
        self.reply(WorkerMessage::FrameComplete { frame_id });
    }

    fn reply(&self, msg: WorkerMessage) {
        let kind = msg.kind();
        if self.outbound.send(msg).is_err() {
            trace!(worker = %self.name, kind, "Control side gone, message dropped");
        }
    }
}

/// Resolves once shutdown is requested or the signal's sender is gone.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// The main worker loop.
///
/// A shutdown interrupts the message currently being handled, so a worker
/// stuck in engine bring-up still stops promptly.
pub async fn run_worker(
    mut session: WorkerSession,
    mut inbound: MessageReceiver<ControlMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let name = session.name.clone();
    debug!(worker = %name, "Worker loop started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown_rx) => {
                debug!(worker = %name, "Shutdown signal received");
                break;
            }

            msg = inbound.recv() => {
                let Some(msg) = msg else {
                    debug!(worker = %name, "Control channel closed");
                    break;
                };
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown_rx) => {
                        debug!(worker = %name, "Shutdown signal received mid-message");
                        break;
                    }
                    _ = session.handle(msg) => {}
                }
            }
        }
    }
    debug!(worker = %name, "Worker finished");
}

/// Serve a worker session over a byte stream, for out-of-process workers.
///
/// A worker host binary calls this with its stdin and stdout. Returns when
/// the control side closes the stream.
pub async fn serve<R, W>(name: impl Into<String>, engine: Box<dyn DetectionEngine>, reader: R, writer: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, inbound) =
        channel::framed::<WorkerMessage, ControlMessage, _, _>(reader, writer, channel::DEFAULT_MAX_FRAME_LEN)
            .split();
    let session = WorkerSession::new(name, engine, outbound);
    // The sender lives until `serve` returns, so only EOF ends the loop.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    run_worker(session, inbound, shutdown_rx).await;
}
