//! Guarded engine initialization.
//!
//! [`EngineAdapter::ensure_initialized`] is called from the frame path, so it
//! is hit once per frame while the engine is down. It must stay cheap and
//! quiet in that state:
//!
//! - at most one attempt runs at a time; concurrent callers share its outcome
//! - no attempt starts inside the backoff window
//! - each failed attempt reports exactly one `error` message

use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use marker_protocol::{EngineParams, WorkerMessage};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::backoff::{BackoffPolicy, InitBackoff};
use crate::channel::MessageSender;
use crate::engine::{ENGINE_API_VERSION, EventSink, SharedEngine};
use crate::error::EngineError;

type InitAttempt = Shared<BoxFuture<'static, bool>>;

struct InitState {
    params: EngineParams,
    /// Frame size the engine is currently initialized for
    initialized_for: Option<(u32, u32)>,
    backoff: InitBackoff,
    /// Running attempt and the frame size it initializes for
    in_flight: Option<((u32, u32), InitAttempt)>,
    /// Sink handed to the engine once initialization first succeeds
    sink: Option<EventSink>,
    listener_attached: bool,
}

/// Owns the detection engine's bring-up inside a worker session.
pub struct EngineAdapter {
    engine: SharedEngine,
    state: Arc<Mutex<InitState>>,
    outbound: MessageSender<WorkerMessage>,
}

impl EngineAdapter {
    pub fn new(engine: SharedEngine, outbound: MessageSender<WorkerMessage>) -> Self {
        Self::with_policy(engine, outbound, BackoffPolicy::default())
    }

    pub fn with_policy(
        engine: SharedEngine,
        outbound: MessageSender<WorkerMessage>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            engine,
            state: Arc::new(Mutex::new(InitState {
                params: EngineParams::default(),
                initialized_for: None,
                backoff: InitBackoff::new(policy),
                in_flight: None,
                sink: None,
                listener_attached: false,
            })),
            outbound,
        }
    }

    /// Set bootstrap parameters and the listener sink.
    ///
    /// Returns `false` if a listener is already attached, in which case the
    /// new sink is discarded and the existing one stays in place.
    pub fn configure(&self, params: EngineParams, sink: EventSink) -> bool {
        let mut state = self.state.lock();
        state.params = params;
        if state.listener_attached {
            return false;
        }
        state.sink = Some(sink);
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized_for.is_some()
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().backoff.failure_count()
    }

    /// Make sure the engine is up for `width`x`height` frames.
    ///
    /// Resolves `true` when the engine is ready. Resolves `false` without
    /// touching the engine while inside the backoff window.
    ///
    /// An attempt already running for another size is waited out, then the
    /// state is checked again.
    pub async fn ensure_initialized(&self, width: u32, height: u32) -> bool {
        loop {
            let (size, attempt) = {
                let mut state = self.state.lock();
                if state.initialized_for == Some((width, height)) {
                    return true;
                }
                match &state.in_flight {
                    Some((size, attempt)) => (*size, attempt.clone()),
                    None => {
                        if state.backoff.is_blocked(Instant::now()) {
                            trace!(width, height, "Engine initialization suppressed by backoff");
                            return false;
                        }
                        let attempt = self.attempt(state.params.clone(), width, height).boxed().shared();
                        state.in_flight = Some(((width, height), attempt.clone()));
                        ((width, height), attempt)
                    }
                }
            };

            let ready = attempt.await;
            if size == (width, height) {
                return ready;
            }
            trace!(width, height, ?size, "Waited out attempt for another size");
        }
    }

    fn attempt(
        &self,
        params: EngineParams,
        width: u32,
        height: u32,
    ) -> impl Future<Output = bool> + Send + 'static {
        let engine = Arc::clone(&self.engine);
        let state = Arc::clone(&self.state);
        let outbound = self.outbound.clone();

        async move {
            debug!(width, height, "Initializing detection engine");
            let result = {
                let mut engine = engine.lock().await;
                let found = engine.api_version();
                if found != ENGINE_API_VERSION {
                    Err(EngineError::CapabilityMismatch {
                        required: ENGINE_API_VERSION,
                        found,
                    })
                } else {
                    let result = engine.initialize(&params, width, height).await;
                    if result.is_ok() {
                        let sink = {
                            let mut state = state.lock();
                            if state.listener_attached {
                                None
                            } else {
                                state.listener_attached = true;
                                state.sink.take()
                            }
                        };
                        if let Some(sink) = sink {
                            engine.attach_listener(sink);
                            debug!("Attached engine event listener");
                        }
                    }
                    result
                }
            };

            let mut state = state.lock();
            state.in_flight = None;
            match result {
                Ok(()) => {
                    state.backoff.reset();
                    state.initialized_for = Some((width, height));
                    info!(width, height, "Detection engine initialized");
                    true
                }
                Err(e) => {
                    state.initialized_for = None;
                    let delay = state.backoff.record_failure(Instant::now());
                    let failures = state.backoff.failure_count();
                    drop(state);

                    error!(failures, retry_ms = delay.as_millis() as u64, "{}", e);
                    let message = format!("{}; retrying in {} ms", e, delay.as_millis());
                    if outbound.send(WorkerMessage::error(message)).is_err() {
                        debug!("Control side gone, initialization error not delivered");
                    }
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MessageReceiver, local_pair};
    use crate::engine::{DetectionEngine, FrameInput, event_queue, share};
    use async_trait::async_trait;
    use marker_protocol::{MarkerId, PoseMatrix, RawMarkerInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        inits: AtomicUsize,
        attaches: AtomicUsize,
        last_size: Mutex<Option<(u32, u32)>>,
    }

    struct FlakyEngine {
        counters: Arc<Counters>,
        /// Number of initialize calls that fail before one succeeds
        failures_left: usize,
        version: u32,
        init_delay: Duration,
    }

    impl FlakyEngine {
        fn new(counters: &Arc<Counters>, failures: usize) -> Self {
            Self {
                counters: Arc::clone(counters),
                failures_left: failures,
                version: ENGINE_API_VERSION,
                init_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl DetectionEngine for FlakyEngine {
        fn api_version(&self) -> u32 {
            self.version
        }

        async fn initialize(&mut self, _: &EngineParams, width: u32, height: u32) -> Result<(), EngineError> {
            self.counters.inits.fetch_add(1, Ordering::SeqCst);
            *self.counters.last_size.lock() = Some((width, height));
            if !self.init_delay.is_zero() {
                tokio::time::sleep(self.init_delay).await;
            }
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(EngineError::Initialization("camera parameters unavailable".into()));
            }
            Ok(())
        }

        async fn load_pattern(&mut self, _: &str, _: f64) -> Result<MarkerId, EngineError> {
            Ok(MarkerId(0))
        }

        fn attach_listener(&mut self, _sink: EventSink) {
            self.counters.attaches.fetch_add(1, Ordering::SeqCst);
        }

        fn process(&mut self, _: FrameInput<'_>) -> Result<(), EngineError> {
            Ok(())
        }

        fn marker_count(&self) -> usize {
            0
        }

        fn marker(&self, _: usize) -> Option<RawMarkerInfo> {
            None
        }

        fn pose(&self, _: usize) -> Option<PoseMatrix> {
            None
        }
    }

    fn adapter_for(engine: FlakyEngine) -> (EngineAdapter, MessageReceiver<WorkerMessage>) {
        let (tx, rx) = local_pair();
        let adapter = EngineAdapter::new(share(Box::new(engine)), tx);
        let (sink, _queue) = event_queue(8);
        adapter.configure(EngineParams::default(), sink);
        (adapter, rx)
    }

    fn drain_errors(rx: &mut MessageReceiver<WorkerMessage>) -> usize {
        let mut count = 0;
        while let Some(msg) = rx.try_recv() {
            assert!(matches!(msg, WorkerMessage::Error { .. }));
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let (adapter, _rx) = adapter_for(FlakyEngine::new(&counters, 0));

        assert!(adapter.ensure_initialized(640, 480).await);
        assert!(adapter.ensure_initialized(640, 480).await);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 1);
        assert_eq!(counters.attaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_reinitializes_but_attaches_once() {
        let counters = Arc::new(Counters::default());
        let (adapter, _rx) = adapter_for(FlakyEngine::new(&counters, 0));

        assert!(adapter.ensure_initialized(640, 480).await);
        assert!(adapter.ensure_initialized(1280, 720).await);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 2);
        assert_eq!(counters.attaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_suppresses_attempts_and_errors() {
        let counters = Arc::new(Counters::default());
        let (adapter, mut rx) = adapter_for(FlakyEngine::new(&counters, 2));

        assert!(!adapter.ensure_initialized(640, 480).await);
        assert_eq!(drain_errors(&mut rx), 1);

        // Frames inside the 1s window neither retry nor report again.
        for _ in 0..10 {
            assert!(!adapter.ensure_initialized(640, 480).await);
        }
        assert_eq!(counters.inits.load(Ordering::SeqCst), 1);
        assert_eq!(drain_errors(&mut rx), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!adapter.ensure_initialized(640, 480).await);
        assert_eq!(adapter.failure_count(), 2);
        assert_eq!(drain_errors(&mut rx), 1);

        // Second failure doubles the window.
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!adapter.ensure_initialized(640, 480).await);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(adapter.ensure_initialized(640, 480).await);
        assert_eq!(adapter.failure_count(), 0);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_attempt() {
        let counters = Arc::new(Counters::default());
        let mut engine = FlakyEngine::new(&counters, 0);
        engine.init_delay = Duration::from_millis(50);
        let (adapter, _rx) = adapter_for(engine);

        let results = futures::future::join_all((0..4).map(|_| adapter.ensure_initialized(320, 240))).await;
        assert!(results.into_iter().all(|ok| ok));
        assert_eq!(counters.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_with_other_size_does_not_join_attempt() {
        let counters = Arc::new(Counters::default());
        let mut engine = FlakyEngine::new(&counters, 0);
        engine.init_delay = Duration::from_millis(50);
        let (adapter, _rx) = adapter_for(engine);

        let (small, large) = tokio::join!(
            adapter.ensure_initialized(640, 480),
            adapter.ensure_initialized(1280, 720),
        );
        assert!(small && large);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 2);
        assert_eq!(*counters.last_size.lock(), Some((1280, 720)));

        assert!(adapter.ensure_initialized(1280, 720).await);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_mismatch_fails_fast() {
        let counters = Arc::new(Counters::default());
        let mut engine = FlakyEngine::new(&counters, 0);
        engine.version = ENGINE_API_VERSION + 1;
        let (adapter, mut rx) = adapter_for(engine);

        assert!(!adapter.ensure_initialized(640, 480).await);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 0);
        match rx.recv().await {
            Some(WorkerMessage::Error { message }) => {
                assert!(message.contains("does not match"));
                assert!(message.contains("retrying in 1000 ms"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
