//! Marker Tracker - control side of visual marker tracking
//!
//! Drives a detection worker (see `marker-worker`) and turns its sparse
//! per-frame detections into a debounced found / updated / lost lifecycle
//! published on a broadcast [`EventBus`].
//!
//! ```text
//! host ──submit_frame──▶ MarkerTracker ──processFrame──▶ worker
//!      ◀──TrackerEvent── EventBus ◀── lifecycle / filter ◀── detectionResult, getMarker
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod lifecycle;
pub mod orchestrator;
pub mod pending;

pub use config::TrackerConfig;
pub use error::{ConfigError, RequestError, TrackerError, TrackerResult};
pub use events::{EventBus, MarkerSighting, TrackerEvent};
pub use filter::RawEventFilter;
pub use lifecycle::{LifecycleEvent, LifecycleTracker, MarkerRecord, MarkerState};
pub use orchestrator::{MarkerTracker, SubmitOutcome};
pub use pending::{PendingReply, PendingRequests};
