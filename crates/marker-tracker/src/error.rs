//! Tracker error types.

use std::time::Duration;

use marker_worker::{ChannelError, WorkerError};
use thiserror::Error;

/// Why a correlated request to the worker did not produce a result.
#[derive(Error, Debug, Clone)]
pub enum RequestError {
    #[error("Request {request_id} timed out after {after:?}")]
    Timeout { request_id: u64, after: Duration },

    #[error("Worker terminated before replying")]
    Terminated,

    #[error("Worker rejected request: {0}")]
    Rejected(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

/// Top-level tracker errors.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Tracker is not enabled")]
    NotEnabled,

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] WorkerError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type TrackerResult<T> = Result<T, TrackerError>;
