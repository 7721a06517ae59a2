//! Marker Protocol - Message contracts between the tracker and its worker
//!
//! This crate contains the pure data structures exchanged across the worker
//! boundary: control and worker messages, detections, raw engine events and
//! the transferable frame bitmap. It has no runtime dependencies so both the
//! control side and the worker side (in-process or out-of-process) share it.

mod bitmap;
mod detection;
mod error;
mod messages;

pub use bitmap::*;
pub use detection::*;
pub use error::*;
pub use messages::*;
