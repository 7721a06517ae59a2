//! Control-side facade over one detection worker.
//!
//! The tracker owns the worker's lifetime, correlates `loadMarker` requests
//! with their replies, dispatches frames with bounded backpressure, and turns
//! worker messages into host events on the [`EventBus`].

use std::sync::Arc;

use marker_protocol::{Bitmap, ControlMessage, MarkerId, WorkerMessage};
use marker_worker::{ChannelError, MessageSender, SpawnedWorker, WorkerHandle, WorkerSpawner};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::TrackerConfig;
use crate::error::{RequestError, TrackerError, TrackerResult};
use crate::events::{EventBus, MarkerSighting, TrackerEvent, now_millis};
use crate::filter::RawEventFilter;
use crate::lifecycle::{LifecycleEvent, LifecycleTracker};
use crate::pending::PendingRequests;

/// What happened to a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Bitmap handed to the worker
    Sent,
    /// Bitmap could not be transferred; the frame went out without it
    MetadataOnly,
    /// Not sent: tracker disabled, too many frames in flight, or worker gone
    Dropped,
}

/// Frames awaiting `frameComplete`, scoped to one enable.
///
/// Each `enable` and `disable` bumps the generation. Acknowledgements and
/// exit notices carrying an older generation come from a worker that is no
/// longer ours and are ignored.
#[derive(Debug, Default)]
struct FrameSlots {
    generation: u64,
    in_flight: usize,
}

/// State reachable from the reader and sweep tasks.
struct Shared {
    config: TrackerConfig,
    bus: EventBus,
    pending: PendingRequests<MarkerId>,
    lifecycle: Mutex<LifecycleTracker>,
    filter: RwLock<RawEventFilter>,
    slots: Mutex<FrameSlots>,
}

impl Shared {
    fn dispatch(&self, generation: u64, msg: WorkerMessage) {
        if !self.is_current(generation) {
            trace!(kind = msg.kind(), generation, "Message from retired worker ignored");
            return;
        }
        trace!(kind = msg.kind(), "Worker message");
        match msg {
            WorkerMessage::Ready => {
                info!("Detection worker ready");
                self.bus.publish(TrackerEvent::WorkerReady);
            }
            WorkerMessage::LoadMarkerResult {
                ok,
                marker_id,
                error,
                request_id,
            } => {
                let result = match (ok, marker_id) {
                    (true, Some(id)) => Ok(id),
                    _ => Err(RequestError::Rejected(
                        error.unwrap_or_else(|| "pattern load failed".to_string()),
                    )),
                };
                self.pending.complete(request_id, result);
            }
            WorkerMessage::DetectionResult { frame_id, detections } => {
                trace!(frame_id, count = detections.len(), "Detection batch");
                let events = self.lifecycle.lock().apply_batch(detections, Instant::now());
                self.publish_lifecycle(events);
            }
            WorkerMessage::FrameComplete { frame_id } => {
                self.release_frame_slot(generation);
                trace!(frame_id, "Frame complete");
            }
            WorkerMessage::Error { message } => {
                warn!("Worker error: {}", message);
                self.bus.publish(TrackerEvent::WorkerError { message });
            }
            WorkerMessage::GetMarker { event } => {
                if self.filter.read().accepts(&event) {
                    self.bus.publish(TrackerEvent::GetMarker { event });
                }
            }
        }
    }

    fn sweep(&self, now: Instant) {
        let events = self.lifecycle.lock().sweep(now);
        self.publish_lifecycle(events);
    }

    fn publish_lifecycle(&self, events: Vec<LifecycleEvent>) {
        if events.is_empty() {
            return;
        }
        let timestamp = now_millis();
        for event in events {
            let event = match event {
                LifecycleEvent::Found(d) => {
                    debug!(marker_id = %d.id, "Marker found");
                    TrackerEvent::MarkerFound(MarkerSighting::from_detection(&d, timestamp))
                }
                LifecycleEvent::Updated(d) => TrackerEvent::MarkerUpdated(MarkerSighting::from_detection(&d, timestamp)),
                LifecycleEvent::Lost(id) => {
                    debug!(marker_id = %id, "Marker lost");
                    TrackerEvent::MarkerLost { id, timestamp }
                }
            };
            self.bus.publish(event);
        }
    }

    /// Called when the reader stops on its own, i.e. the worker went away
    /// without `disable`.
    fn worker_exited(&self, generation: u64) {
        {
            let mut slots = self.slots.lock();
            if slots.generation != generation {
                return;
            }
            slots.in_flight = 0;
        }
        let rejected = self.pending.reject_all(RequestError::Terminated);
        warn!(rejected, "Detection worker exited unexpectedly");
        self.bus.publish(TrackerEvent::worker_error("Detection worker exited"));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.slots.lock().generation == generation
    }

    /// Start a new generation with no frames in flight.
    fn next_generation(&self) -> u64 {
        let mut slots = self.slots.lock();
        slots.generation += 1;
        slots.in_flight = 0;
        slots.generation
    }

    /// Reserve a slot, returning the generation it belongs to.
    fn acquire_frame_slot(&self) -> Option<u64> {
        let mut slots = self.slots.lock();
        if slots.in_flight >= self.config.max_frames_in_flight {
            return None;
        }
        slots.in_flight += 1;
        Some(slots.generation)
    }

    fn release_frame_slot(&self, generation: u64) {
        let mut slots = self.slots.lock();
        if slots.generation == generation {
            slots.in_flight = slots.in_flight.saturating_sub(1);
        }
    }
}

struct ActiveWorker {
    sender: MessageSender<ControlMessage>,
    handle: WorkerHandle,
    reader: AbortHandle,
    watcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Tracks visual markers through a detection worker.
pub struct MarkerTracker {
    shared: Arc<Shared>,
    spawner: Box<dyn WorkerSpawner>,
    active: Mutex<Option<ActiveWorker>>,
}

impl MarkerTracker {
    pub fn new(config: TrackerConfig, spawner: impl WorkerSpawner) -> Self {
        let lifecycle = LifecycleTracker::new(config.lost_threshold, config.frame_duration());
        let filter = RawEventFilter::from_config(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                bus: EventBus::default(),
                pending: PendingRequests::new(),
                lifecycle: Mutex::new(lifecycle),
                filter: RwLock::new(filter),
                slots: Mutex::new(FrameSlots::default()),
            }),
            spawner: Box::new(spawner),
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.shared.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn is_enabled(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Start the worker. Does nothing if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enable(&self) -> TrackerResult<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            debug!("Tracker already enabled");
            return Ok(());
        }

        let name = &self.shared.config.worker_name;
        let SpawnedWorker {
            sender,
            receiver,
            handle,
        } = self.spawner.spawn(name)?;

        sender
            .send(ControlMessage::Init {
                options: self.shared.config.worker_options(),
            })
            .map_err(|e| {
                handle.terminate();
                TrackerError::Request(RequestError::Channel(e))
            })?;

        let generation = self.shared.next_generation();
        let shared = Arc::clone(&self.shared);
        let reader = receiver.on_message(move |msg| shared.dispatch(generation, msg));
        let reader_abort = reader.abort_handle();
        let watcher = spawn_exit_watcher(Arc::clone(&self.shared), generation, reader);
        let sweeper = spawn_sweeper(Arc::clone(&self.shared));

        info!(worker = %name, generation, "Tracker enabled");
        *active = Some(ActiveWorker {
            sender,
            handle,
            reader: reader_abort,
            watcher,
            sweeper,
        });
        Ok(())
    }

    /// Stop the worker. Outstanding requests fail with
    /// [`RequestError::Terminated`]. Does nothing if already disabled.
    pub fn disable(&self) {
        let Some(worker) = self.active.lock().take() else {
            return;
        };

        // Retire the generation first so nothing the old reader still
        // delivers can touch the fresh counters.
        self.shared.next_generation();
        worker.handle.terminate();
        worker.reader.abort();
        worker.watcher.abort();
        worker.sweeper.abort();

        let rejected = self.shared.pending.reject_all(RequestError::Terminated);
        self.shared.lifecycle.lock().clear();
        info!(rejected, "Tracker disabled");
    }

    /// Load a marker pattern and start tracking its id.
    pub async fn load_marker(&self, pattern_key: &str, size: f64) -> TrackerResult<MarkerId> {
        let sender = self.sender().ok_or(TrackerError::NotEnabled)?;

        let reply = self.shared.pending.register();
        let request_id = reply.request_id();
        debug!(request_id, pattern_key, "Loading marker pattern");

        if let Err(e) = sender.send(ControlMessage::LoadMarker {
            pattern_key: pattern_key.to_owned(),
            size,
            request_id,
        }) {
            self.shared.pending.cancel(request_id);
            return Err(RequestError::Channel(e).into());
        }

        let marker_id = self
            .shared
            .pending
            .wait(reply, self.shared.config.request_timeout())
            .await?;

        if self.shared.filter.write().track(marker_id) {
            debug!(request_id, marker_id = %marker_id, "Tracking marker");
        }
        Ok(marker_id)
    }

    /// Hand a frame to the worker. Never fails; the outcome says what happened.
    ///
    /// The bitmap is consumed either way and released by whoever ends up
    /// holding it.
    pub fn submit_frame(&self, frame_id: u64, bitmap: Bitmap, width: u32, height: u32) -> SubmitOutcome {
        let Some(sender) = self.sender() else {
            trace!(frame_id, "Tracker disabled, frame dropped");
            return SubmitOutcome::Dropped;
        };
        if sender.is_closed() {
            return self.frame_failed(frame_id, None, ChannelError::Closed);
        }
        let Some(generation) = self.shared.acquire_frame_slot() else {
            trace!(frame_id, "Too many frames in flight, frame dropped");
            return SubmitOutcome::Dropped;
        };

        let frame = ControlMessage::ProcessFrame {
            frame_id,
            bitmap: Some(bitmap),
            width,
            height,
        };
        match sender.send(frame) {
            Ok(()) => SubmitOutcome::Sent,
            Err(ChannelError::Transfer(reason)) => {
                debug!(frame_id, "Bitmap transfer failed, sending metadata only: {}", reason);
                let metadata = ControlMessage::ProcessFrame {
                    frame_id,
                    bitmap: None,
                    width,
                    height,
                };
                match sender.send(metadata) {
                    Ok(()) => SubmitOutcome::MetadataOnly,
                    Err(e) => self.frame_failed(frame_id, Some(generation), e),
                }
            }
            Err(e) => self.frame_failed(frame_id, Some(generation), e),
        }
    }

    fn frame_failed(&self, frame_id: u64, slot: Option<u64>, err: ChannelError) -> SubmitOutcome {
        if let Some(generation) = slot {
            self.shared.release_frame_slot(generation);
        }
        warn!(frame_id, "Failed to submit frame: {}", err);
        self.shared
            .bus
            .publish(TrackerEvent::worker_error(format!("Failed to submit frame {frame_id}: {err}")));
        SubmitOutcome::Dropped
    }

    fn sender(&self) -> Option<MessageSender<ControlMessage>> {
        self.active.lock().as_ref().map(|worker| worker.sender.clone())
    }

    pub fn frames_in_flight(&self) -> usize {
        self.shared.slots.lock().in_flight
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Ids with a live lifecycle record.
    pub fn tracked_markers(&self) -> Vec<MarkerId> {
        self.shared.lifecycle.lock().ids()
    }
}

impl Drop for MarkerTracker {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Report the worker's disappearance once its reader runs dry.
///
/// An aborted reader means `disable` already cleaned up.
fn spawn_exit_watcher(shared: Arc<Shared>, generation: u64, reader: JoinHandle<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if reader.await.is_ok() {
            shared.worker_exited(generation);
        }
    })
}

fn spawn_sweeper(shared: Arc<Shared>) -> JoinHandle<()> {
    let period = shared.config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            shared.sweep(Instant::now());
        }
    })
}
