//! Tracker configuration.
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `MARKER_TRACKER_*` environment variables. Nested engine keys use a double
//! underscore, e.g. `MARKER_TRACKER_ENGINE__MODULE_URL`.

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use marker_protocol::{EngineParams, MarkerId, WorkerOptions};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "MARKER_TRACKER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Missed frames before a marker is declared lost
    #[serde(alias = "lostThreshold")]
    pub lost_threshold: u32,
    /// Nominal frame period
    #[serde(alias = "frameDurationMs")]
    pub frame_duration_ms: u64,
    /// How often the lifecycle sweep runs
    #[serde(alias = "sweepIntervalMs")]
    pub sweep_interval_ms: u64,
    /// Raw events below this confidence are not forwarded
    #[serde(alias = "minConfidence")]
    pub min_confidence: f64,
    /// Upper bound on a `load_marker` round trip
    #[serde(alias = "requestTimeoutMs")]
    pub request_timeout_ms: u64,
    /// Frames submitted but not yet acknowledged by the worker
    #[serde(alias = "maxFramesInFlight")]
    pub max_frames_in_flight: usize,
    /// Engine marker type of pattern markers
    #[serde(alias = "patternMarkerType")]
    pub pattern_marker_type: i32,
    /// Marker ids whose raw events are forwarded. Empty forwards all.
    #[serde(alias = "trackedPatterns")]
    pub tracked_patterns: Vec<MarkerId>,
    /// Raw event queue capacity on the worker side
    #[serde(alias = "eventQueueCapacity")]
    pub event_queue_capacity: usize,
    /// Worker thread name
    #[serde(alias = "workerName")]
    pub worker_name: String,
    pub engine: EngineParams,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            lost_threshold: 5,
            frame_duration_ms: 200,
            sweep_interval_ms: 100,
            min_confidence: 0.6,
            request_timeout_ms: 10_000,
            max_frames_in_flight: 2,
            pattern_marker_type: 0,
            tracked_patterns: Vec::new(),
            event_queue_capacity: WorkerOptions::default().event_queue_capacity,
            worker_name: "marker-worker".to_string(),
            engine: EngineParams::default(),
        }
    }
}

impl TrackerConfig {
    /// Load from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate from a prepared figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lost_threshold == 0 {
            return Err(ConfigError::Invalid("lost_threshold must be at least 1".into()));
        }
        if self.frame_duration_ms == 0 {
            return Err(ConfigError::Invalid("frame_duration_ms must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        if self.max_frames_in_flight == 0 {
            return Err(ConfigError::Invalid("max_frames_in_flight must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_confidence must be within 0..=1, got {}",
                self.min_confidence
            )));
        }
        Ok(())
    }

    pub fn with_lost_threshold(mut self, frames: u32) -> Self {
        self.lost_threshold = frames;
        self
    }

    pub fn with_frame_duration(mut self, duration: Duration) -> Self {
        self.frame_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = confidence;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    pub fn with_tracked_patterns(mut self, ids: impl IntoIterator<Item = MarkerId>) -> Self {
        self.tracked_patterns = ids.into_iter().collect();
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_engine(mut self, engine: EngineParams) -> Self {
        self.engine = engine;
        self
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Options sent with the `init` handshake.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            engine: self.engine.clone(),
            event_queue_capacity: self.event_queue_capacity,
        }
    }
}
