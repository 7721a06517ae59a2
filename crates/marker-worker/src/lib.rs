//! Marker Worker - the detection side of the tracker
//!
//! The worker owns the detection engine and everything that talks to it.
//! It runs either on a dedicated OS thread with its own current-thread tokio
//! runtime, or as a separate process speaking length-prefixed JSON over stdio.
//!
//! # Architecture
//!
//! - [`channel`] carries typed messages, in-process or framed over a byte stream
//! - [`adapter`] brings the engine up lazily, once at a time, with backoff
//! - [`patterns`] loads each marker pattern at most once
//! - [`pipeline`] turns transferred bitmaps into detections
//! - [`session`] dispatches control messages to the above
//! - [`spawn`] starts workers and hands back their channel ends

pub mod adapter;
pub mod backoff;
pub mod channel;
pub mod engine;
pub mod error;
pub mod patterns;
pub mod pipeline;
pub mod raster;
pub mod session;
pub mod spawn;

pub use adapter::EngineAdapter;
pub use backoff::{BackoffPolicy, InitBackoff};
pub use channel::{Endpoint, MessageReceiver, MessageSender, local_link, local_pair};
pub use engine::{DetectionEngine, ENGINE_API_VERSION, EventQueue, EventSink, FrameInput, SharedEngine};
pub use error::{ChannelError, EngineError, FrameError, LoadError, WorkerError};
pub use patterns::PatternRegistry;
pub use pipeline::{FrameOutcome, FramePipeline};
pub use raster::RasterBuffer;
pub use session::{WorkerSession, run_worker, serve};
pub use spawn::{
    EngineSpawner, Placement, ProcessSpawner, SpawnedWorker, WorkerHandle, WorkerSpawner, spawn_loopback_worker,
    spawn_process_worker, spawn_task_worker, spawn_thread_worker,
};
