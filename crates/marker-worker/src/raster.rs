//! Reusable raster the pipeline composites frames into.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba, RgbaImage};
use marker_protocol::Bitmap;

use crate::channel::DEFAULT_MAX_FRAME_LEN;
use crate::error::FrameError;

/// Largest raster the worker will allocate, in bytes.
pub const MAX_RASTER_BYTES: usize = DEFAULT_MAX_FRAME_LEN;

/// RGBA8 buffer sized to the current frame.
///
/// Storage is reallocated only when the frame size changes.
#[derive(Debug, Default)]
pub struct RasterBuffer {
    image: Option<RgbaImage>,
    allocations: u64,
}

impl RasterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject sizes whose RGBA storage would exceed [`MAX_RASTER_BYTES`].
    pub fn check_size(width: u32, height: u32) -> Result<(), FrameError> {
        let bytes = u64::from(width) * u64::from(height) * 4;
        if bytes > MAX_RASTER_BYTES as u64 {
            return Err(FrameError::TooLarge {
                width,
                height,
                limit: MAX_RASTER_BYTES,
            });
        }
        Ok(())
    }

    /// Make the buffer `width`x`height`. Returns `true` if it was reallocated.
    pub fn ensure_size(&mut self, width: u32, height: u32) -> Result<bool, FrameError> {
        if self.image.as_ref().is_some_and(|image| image.dimensions() == (width, height)) {
            return Ok(false);
        }
        Self::check_size(width, height)?;
        self.image = Some(RgbaImage::new(width, height));
        self.allocations += 1;
        Ok(true)
    }

    /// Draw `bitmap` over the whole buffer, scaling when sizes differ.
    pub fn composite(&mut self, bitmap: &Bitmap) -> Result<(), FrameError> {
        let (dst_width, dst_height) = self.dimensions();
        let error = FrameError::Composite {
            src_width: bitmap.width(),
            src_height: bitmap.height(),
            dst_width,
            dst_height,
        };

        let target = match self.image.as_mut() {
            Some(image) if dst_width > 0 && dst_height > 0 => image,
            _ => return Err(error),
        };
        if bitmap.width() == 0 || bitmap.height() == 0 {
            return Err(error);
        }

        if (bitmap.width(), bitmap.height()) == (dst_width, dst_height) {
            target.copy_from_slice(bitmap.pixels());
            return Ok(());
        }

        let source: ImageBuffer<Rgba<u8>, &[u8]> =
            ImageBuffer::from_raw(bitmap.width(), bitmap.height(), bitmap.pixels()).ok_or(error)?;
        let scaled = imageops::resize(&source, dst_width, dst_height, FilterType::Nearest);
        target.copy_from_slice(&scaled);
        Ok(())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.as_ref().map_or((0, 0), |image| image.dimensions())
    }

    pub fn width(&self) -> u32 {
        self.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.dimensions().1
    }

    pub fn pixels(&self) -> &[u8] {
        match &self.image {
            Some(image) => image.as_raw(),
            None => &[],
        }
    }

    /// How many times storage has been (re)allocated.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}
