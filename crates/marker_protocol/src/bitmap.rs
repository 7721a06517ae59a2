//! Transferable frame bitmap.
//!
//! A `Bitmap` is moved from the control side into a `processFrame` message
//! and from there into the worker, which releases it exactly once. Release
//! runs an optional hook supplied by whoever created the bitmap (a camera
//! frame pool, a GPU texture, a test counter). The hook runs either on an
//! explicit [`Bitmap::close`] or on drop, never both.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Bytes per pixel of the RGBA8 layout used by every bitmap.
pub const BYTES_PER_PIXEL: usize = 4;

/// Callback invoked when a bitmap's resources are released.
pub type ReleaseHook = Box<dyn FnOnce() + Send + 'static>;

/// An owned RGBA8 frame with single-ownership release semantics.
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    release: Option<ReleaseHook>,
}

impl Bitmap {
    /// Create a bitmap from tightly packed RGBA8 pixels.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ProtocolError> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(ProtocolError::BitmapSize {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
            release: None,
        })
    }

    /// Create a bitmap filled with a single RGBA color.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * BYTES_PER_PIXEL)
            .collect();
        Self {
            width,
            height,
            pixels,
            release: None,
        }
    }

    /// Attach a hook that runs when the bitmap is released.
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA8 pixels, row-major without padding.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Size of the pixel payload in bytes.
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Release the bitmap now.
    pub fn close(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(hook) = self.release.take() {
            hook();
        }
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .field("has_release_hook", &self.release.is_some())
            .finish()
    }
}

// Release hooks never cross a serialization boundary: the sending side keeps
// ownership of the hook and releases when its copy is dropped.

#[derive(Serialize)]
struct BitmapRef<'a> {
    width: u32,
    height: u32,
    pixels: &'a [u8],
}

#[derive(Deserialize)]
struct BitmapOwned {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Serialize for Bitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BitmapRef {
            width: self.width,
            height: self.height,
            pixels: &self.pixels,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bitmap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BitmapOwned::deserialize(deserializer)?;
        Bitmap::new(raw.width, raw.height, raw.pixels).map_err(serde::de::Error::custom)
    }
}
