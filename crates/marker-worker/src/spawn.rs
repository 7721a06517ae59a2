//! Worker spawn functions.
//!
//! A worker is a dedicated OS thread running its own current-thread tokio
//! runtime, a task on the caller's runtime, or a child process speaking the
//! framed protocol over its stdin/stdout. All come back as a [`SpawnedWorker`]
//! with the same channel types, so the control side does not care which one
//! it got.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use marker_protocol::{ControlMessage, WorkerMessage};
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::channel::{self, MessageReceiver, MessageSender};
use crate::engine::DetectionEngine;
use crate::error::WorkerError;
use crate::session::{WorkerSession, run_worker};

/// A running worker and the control side's ends of its channel.
pub struct SpawnedWorker {
    pub sender: MessageSender<ControlMessage>,
    pub receiver: MessageReceiver<WorkerMessage>,
    pub handle: WorkerHandle,
}

enum WorkerKind {
    Thread {
        shutdown_tx: watch::Sender<bool>,
        thread: Option<thread::JoinHandle<Result<(), WorkerError>>>,
    },
    Task {
        shutdown_tx: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
    Process {
        child: Child,
    },
}

/// Handle used to stop a worker.
pub struct WorkerHandle {
    name: String,
    terminated: AtomicBool,
    kind: Mutex<WorkerKind>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the worker. Safe to call more than once.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        match &mut *self.kind.lock() {
            WorkerKind::Thread { shutdown_tx, .. } | WorkerKind::Task { shutdown_tx, .. } => {
                let _ = shutdown_tx.send(true);
            }
            WorkerKind::Process { child } => {
                if let Err(e) = child.start_kill() {
                    warn!(worker = %self.name, "Failed to kill worker process: {}", e);
                }
            }
        }
        debug!(worker = %self.name, "Worker terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Whether the worker has stopped running.
    pub fn is_finished(&self) -> bool {
        match &*self.kind.lock() {
            WorkerKind::Thread { thread, .. } => thread.as_ref().is_none_or(|t| t.is_finished()),
            WorkerKind::Task { task, .. } => task.is_finished(),
            WorkerKind::Process { .. } => self.is_terminated(),
        }
    }

    /// Wait for a thread worker to exit. Blocks the calling thread.
    pub fn join(self) -> Result<(), WorkerError> {
        let thread = match &mut *self.kind.lock() {
            WorkerKind::Thread { thread, .. } => thread.take(),
            WorkerKind::Task { .. } | WorkerKind::Process { .. } => None,
        };
        if let Some(thread) = thread {
            thread.join().map_err(|_| WorkerError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawn a worker on a dedicated thread.
pub fn spawn_thread_worker(
    name: impl Into<String>,
    engine: Box<dyn DetectionEngine>,
    policy: BackoffPolicy,
) -> Result<SpawnedWorker, WorkerError> {
    let name = name.into();
    debug!(worker = %name, "Spawning worker thread");

    let (control, worker) = channel::local_link::<ControlMessage, WorkerMessage>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let thread_name = name.clone();
    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || -> Result<(), WorkerError> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(WorkerError::SpawnFailed)?;

            let (outbound, inbound) = worker.split();
            let session = WorkerSession::with_policy(thread_name.clone(), engine, outbound, policy);
            rt.block_on(run_worker(session, inbound, shutdown_rx));

            rt.shutdown_background();
            debug!(worker = %thread_name, "Worker thread exiting");
            Ok(())
        })?;

    let (sender, receiver) = control.split();
    Ok(SpawnedWorker {
        sender,
        receiver,
        handle: WorkerHandle {
            name,
            terminated: AtomicBool::new(false),
            kind: Mutex::new(WorkerKind::Thread {
                shutdown_tx,
                thread: Some(thread),
            }),
        },
    })
}

/// Spawn a worker as a task on the current tokio runtime.
///
/// The session shares the caller's scheduler and clock. Must be called from
/// within a tokio runtime.
pub fn spawn_task_worker(
    name: impl Into<String>,
    engine: Box<dyn DetectionEngine>,
    policy: BackoffPolicy,
) -> SpawnedWorker {
    let name = name.into();
    debug!(worker = %name, "Spawning worker task");

    let (control, worker) = channel::local_link::<ControlMessage, WorkerMessage>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (outbound, inbound) = worker.split();
    let session = WorkerSession::with_policy(name.clone(), engine, outbound, policy);
    let task = tokio::spawn(run_worker(session, inbound, shutdown_rx));

    let (sender, receiver) = control.split();
    SpawnedWorker {
        sender,
        receiver,
        handle: WorkerHandle {
            name,
            terminated: AtomicBool::new(false),
            kind: Mutex::new(WorkerKind::Task { shutdown_tx, task }),
        },
    }
}

/// In-memory pipe capacity for loopback workers.
const LOOPBACK_BUFFER: usize = 1 << 20;

/// Spawn a task worker reached through the framed transport over an
/// in-memory pipe, so every message takes the same path as with a process.
pub fn spawn_loopback_worker(
    name: impl Into<String>,
    engine: Box<dyn DetectionEngine>,
    policy: BackoffPolicy,
    max_frame_len: usize,
) -> SpawnedWorker {
    let name = name.into();
    debug!(worker = %name, max_frame_len, "Spawning loopback worker");

    let (control_io, worker_io) = tokio::io::duplex(LOOPBACK_BUFFER);
    let (worker_read, worker_write) = tokio::io::split(worker_io);
    let (outbound, inbound) =
        channel::framed::<WorkerMessage, ControlMessage, _, _>(worker_read, worker_write, max_frame_len).split();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = WorkerSession::with_policy(name.clone(), engine, outbound, policy);
    let task = tokio::spawn(run_worker(session, inbound, shutdown_rx));

    let (control_read, control_write) = tokio::io::split(control_io);
    let (sender, receiver) =
        channel::framed::<ControlMessage, WorkerMessage, _, _>(control_read, control_write, max_frame_len).split();

    SpawnedWorker {
        sender,
        receiver,
        handle: WorkerHandle {
            name,
            terminated: AtomicBool::new(false),
            kind: Mutex::new(WorkerKind::Task { shutdown_tx, task }),
        },
    }
}

/// Spawn a worker process and connect to it over stdio.
///
/// Must be called from within a tokio runtime.
pub fn spawn_process_worker(
    name: impl Into<String>,
    command: &mut Command,
    max_frame_len: usize,
) -> Result<SpawnedWorker, WorkerError> {
    let name = name.into();
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| WorkerError::SpawnFailed(std::io::Error::other("worker stdin not captured")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WorkerError::SpawnFailed(std::io::Error::other("worker stdout not captured")))?;

    debug!(worker = %name, pid = child.id(), "Spawned worker process");
    let (sender, receiver) =
        channel::framed::<ControlMessage, WorkerMessage, _, _>(stdout, stdin, max_frame_len).split();

    Ok(SpawnedWorker {
        sender,
        receiver,
        handle: WorkerHandle {
            name,
            terminated: AtomicBool::new(false),
            kind: Mutex::new(WorkerKind::Process { child }),
        },
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Spawners
// ─────────────────────────────────────────────────────────────────────────────

/// Starts a fresh worker each time the control side is enabled.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self, name: &str) -> Result<SpawnedWorker, WorkerError>;
}

type EngineFactory = Box<dyn Fn() -> Box<dyn DetectionEngine> + Send + Sync>;

/// Where an in-process worker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Placement {
    /// Own OS thread and current-thread runtime
    #[default]
    DedicatedThread,
    /// Task on the runtime that calls `spawn`
    CurrentRuntime,
    /// Task on the calling runtime behind the framed transport
    Loopback { max_frame_len: usize },
}

/// Spawns in-process workers, building a new engine for each.
pub struct EngineSpawner {
    factory: EngineFactory,
    policy: BackoffPolicy,
    placement: Placement,
}

impl EngineSpawner {
    pub fn new(factory: impl Fn() -> Box<dyn DetectionEngine> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            policy: BackoffPolicy::default(),
            placement: Placement::default(),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }
}

impl WorkerSpawner for EngineSpawner {
    fn spawn(&self, name: &str) -> Result<SpawnedWorker, WorkerError> {
        let engine = (self.factory)();
        match self.placement {
            Placement::DedicatedThread => spawn_thread_worker(name, engine, self.policy.clone()),
            Placement::CurrentRuntime => Ok(spawn_task_worker(name, engine, self.policy.clone())),
            Placement::Loopback { max_frame_len } => Ok(spawn_loopback_worker(
                name,
                engine,
                self.policy.clone(),
                max_frame_len,
            )),
        }
    }
}

/// Spawns worker host processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    max_frame_len: usize,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            max_frame_len: channel::DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, name: &str) -> Result<SpawnedWorker, WorkerError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        spawn_process_worker(name, &mut command, self.max_frame_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ENGINE_API_VERSION, EventSink, FrameInput};
    use crate::error::EngineError;
    use async_trait::async_trait;
    use marker_protocol::{
        Bitmap, EngineParams, MarkerId, PoseMatrix, RawMarkerEvent, RawMarkerInfo, WorkerOptions,
    };

    /// Reports marker 1 on every frame, through both result paths.
    struct EchoEngine {
        sink: Option<EventSink>,
    }

    #[async_trait]
    impl DetectionEngine for EchoEngine {
        fn api_version(&self) -> u32 {
            ENGINE_API_VERSION
        }

        async fn initialize(&mut self, _: &EngineParams, _: u32, _: u32) -> Result<(), EngineError> {
            Ok(())
        }

        async fn load_pattern(&mut self, pattern_key: &str, _: f64) -> Result<MarkerId, EngineError> {
            Ok(MarkerId(pattern_key.len() as i32))
        }

        fn attach_listener(&mut self, sink: EventSink) {
            self.sink = Some(sink);
        }

        fn process(&mut self, _: FrameInput<'_>) -> Result<(), EngineError> {
            if let Some(sink) = &self.sink {
                sink.push(RawMarkerEvent {
                    marker_type: 0,
                    matrix: vec![1.0; 16],
                    marker: RawMarkerInfo::pattern(1, 0.9),
                });
            }
            Ok(())
        }

        fn marker_count(&self) -> usize {
            1
        }

        fn marker(&self, _: usize) -> Option<RawMarkerInfo> {
            Some(RawMarkerInfo::pattern(1, 0.9))
        }

        fn pose(&self, _: usize) -> Option<PoseMatrix> {
            Some([1.0; 16])
        }
    }

    fn echo() -> Box<dyn DetectionEngine> {
        Box::new(EchoEngine { sink: None })
    }

    #[tokio::test]
    async fn test_thread_worker_handshake_and_frame() {
        let SpawnedWorker {
            sender,
            mut receiver,
            handle,
        } = spawn_thread_worker("test-worker", echo(), BackoffPolicy::default()).unwrap();

        sender
            .send(ControlMessage::Init {
                options: WorkerOptions::default(),
            })
            .unwrap();
        assert_eq!(receiver.recv().await, Some(WorkerMessage::Ready));

        sender
            .send(ControlMessage::ProcessFrame {
                frame_id: 1,
                bitmap: Some(Bitmap::filled(4, 4, [0; 4])),
                width: 4,
                height: 4,
            })
            .unwrap();

        assert!(matches!(receiver.recv().await, Some(WorkerMessage::GetMarker { .. })));
        match receiver.recv().await {
            Some(WorkerMessage::DetectionResult { frame_id, detections }) => {
                assert_eq!(frame_id, 1);
                assert_eq!(detections[0].id, MarkerId(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(receiver.recv().await, Some(WorkerMessage::FrameComplete { frame_id: 1 }));

        handle.terminate();
        handle.terminate();
        assert!(handle.is_terminated());
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap().unwrap();
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_thread_worker_answers_loads() {
        let spawner = EngineSpawner::new(echo);
        let SpawnedWorker {
            sender,
            mut receiver,
            handle: _handle,
        } = spawner.spawn("load-worker").unwrap();

        sender
            .send(ControlMessage::LoadMarker {
                pattern_key: "patt.hiro".into(),
                size: 1.0,
                request_id: 7,
            })
            .unwrap();
        assert_eq!(receiver.recv().await, Some(WorkerMessage::load_ok(7, MarkerId(9))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_worker_stops_on_terminate() {
        let spawner = EngineSpawner::new(echo).with_placement(Placement::CurrentRuntime);
        let SpawnedWorker {
            sender,
            mut receiver,
            handle,
        } = spawner.spawn("task-worker").unwrap();

        sender
            .send(ControlMessage::Init {
                options: WorkerOptions::default(),
            })
            .unwrap();
        assert_eq!(receiver.recv().await, Some(WorkerMessage::Ready));

        handle.terminate();
        assert_eq!(receiver.recv().await, None);
        tokio::task::yield_now().await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_loopback_worker_speaks_framed_protocol() {
        let spawner = EngineSpawner::new(echo).with_placement(Placement::Loopback {
            max_frame_len: channel::DEFAULT_MAX_FRAME_LEN,
        });
        let SpawnedWorker {
            sender,
            mut receiver,
            handle,
        } = spawner.spawn("loopback-worker").unwrap();

        sender
            .send(ControlMessage::LoadMarker {
                pattern_key: "kanji".into(),
                size: 1.0,
                request_id: 1,
            })
            .unwrap();
        assert_eq!(receiver.recv().await, Some(WorkerMessage::load_ok(1, MarkerId(5))));

        handle.terminate();
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let spawner = ProcessSpawner::new("/nonexistent/marker-worker-host");
        assert!(matches!(spawner.spawn("ghost"), Err(WorkerError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_serve_over_duplex() {
        let (control_io, worker_io) = tokio::io::duplex(1 << 20);
        let (wr, ww) = tokio::io::split(worker_io);
        let server = tokio::spawn(crate::session::serve("duplex-worker", echo(), wr, ww));

        let (cr, cw) = tokio::io::split(control_io);
        let (sender, mut receiver) = channel::framed::<ControlMessage, WorkerMessage, _, _>(
            cr,
            cw,
            channel::DEFAULT_MAX_FRAME_LEN,
        )
        .split();

        sender
            .send(ControlMessage::Init {
                options: WorkerOptions::default(),
            })
            .unwrap();
        assert_eq!(receiver.recv().await, Some(WorkerMessage::Ready));

        drop(sender);
        server.await.unwrap();
    }
}
