//! Error types for the worker side.

/// Errors raised by the message channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

/// Errors reported by a detection engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    Initialization(String),

    #[error("Engine API version {found} does not match required version {required}")]
    CapabilityMismatch { required: u32, found: u32 },

    #[error("Frame processing failed: {0}")]
    Processing(String),

    #[error("Pattern load failed: {0}")]
    Load(String),
}

/// Errors from loading a marker pattern. Cloned to every waiter of a shared load.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors while compositing a frame into the raster buffer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("Cannot composite {src_width}x{src_height} bitmap into {dst_width}x{dst_height} raster")]
    Composite {
        src_width: u32,
        src_height: u32,
        dst_width: u32,
        dst_height: u32,
    },

    #[error("Frame of {width}x{height} exceeds the {limit} byte raster limit")]
    TooLarge { width: u32, height: u32, limit: usize },
}

/// Errors that can occur when starting or running a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Worker thread panicked")]
    ThreadPanic,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
