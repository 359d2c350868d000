//! Frame types: the raw frame produced by hardware and the borrowed
//! buffer handed to subscribers for one distribution cycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Pixel format tag carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Opaque, implementation-defined layout (GPU-sampled buffers).
    Private,
    /// Planar YUV 4:2:0.
    #[serde(rename = "yuv_420_888")]
    Yuv420,
    /// Semi-planar YUV 4:2:0, VU interleaved.
    Nv21,
    /// Compressed JPEG.
    Jpeg,
    /// 8-bit RGBA.
    #[serde(rename = "rgba_8888")]
    Rgba8888,
    /// 8-bit luminance only.
    Gray8,
}

impl PixelFormat {
    /// File extension used when dumping frames of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            PixelFormat::Private => "raw",
            PixelFormat::Yuv420 => "yuv",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Jpeg => "jpg",
            PixelFormat::Rgba8888 => "rgba",
            PixelFormat::Gray8 => "gray",
        }
    }

    /// Expected buffer length for a frame of the given dimensions, when the
    /// layout is known.
    pub fn frame_len(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize) * (height as usize);
        match self {
            PixelFormat::Yuv420 | PixelFormat::Nv21 => Some(pixels * 3 / 2),
            PixelFormat::Rgba8888 => Some(pixels * 4),
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Private | PixelFormat::Jpeg => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Private => "private",
            PixelFormat::Yuv420 => "yuv_420_888",
            PixelFormat::Nv21 => "nv21",
            PixelFormat::Jpeg => "jpeg",
            PixelFormat::Rgba8888 => "rgba_8888",
            PixelFormat::Gray8 => "gray8",
        };
        f.write_str(name)
    }
}

/// A frame as written by the hardware into an output target.
#[derive(Clone)]
pub struct RawFrame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    timestamp: Instant,
    sequence: u64,
}

impl RawFrame {
    /// Creates a new frame stamped with the current instant.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, format: PixelFormat, sequence: u64) -> Self {
        Self {
            pixels,
            width,
            height,
            format,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// Returns the frame sequence number.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the frame pixel format.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("pixel_bytes", &self.pixels.len())
            .finish()
    }
}

/// One captured frame, borrowed for a single distribution cycle.
///
/// The buffer is released when [`FrameBuffer::release`] is called or when it
/// is dropped, whichever comes first. Either way the owning pool observes
/// exactly one release.
pub struct FrameBuffer {
    frame: RawFrame,
    release_counter: Option<Arc<AtomicU64>>,
}

impl FrameBuffer {
    /// Wraps a raw frame whose release is counted by `release_counter`.
    pub(crate) fn tracked(frame: RawFrame, release_counter: Arc<AtomicU64>) -> Self {
        Self {
            frame,
            release_counter: Some(release_counter),
        }
    }

    /// Wraps a raw frame that belongs to no pool.
    pub fn detached(frame: RawFrame) -> Self {
        Self {
            frame,
            release_counter: None,
        }
    }

    /// Returns the pixel data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.frame.pixels
    }

    /// Returns the frame width.
    #[inline]
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    /// Returns the frame height.
    #[inline]
    pub fn height(&self) -> u32 {
        self.frame.height
    }

    /// Returns the pixel format tag.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.frame.format
    }

    /// Returns the capture timestamp.
    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.frame.timestamp
    }

    /// Returns the sequence number.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    /// Returns the buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(counter) = self.release_counter.take() {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.frame.width)
            .field("height", &self.frame.height)
            .field("format", &self.frame.format)
            .field("sequence", &self.frame.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_counted_once() {
        let counter = Arc::new(AtomicU64::new(0));
        let frame = RawFrame::new(vec![0u8; 16], 4, 4, PixelFormat::Gray8, 1);
        let buffer = FrameBuffer::tracked(frame, Arc::clone(&counter));
        assert_eq!(buffer.data().len(), 16);
        buffer.release();
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_drop_counts_as_release() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let frame = RawFrame::new(vec![1, 2, 3], 3, 1, PixelFormat::Gray8, 7);
            let buffer = FrameBuffer::tracked(frame, Arc::clone(&counter));
            assert_eq!(buffer.sequence(), 7);
        }
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_frame_len_by_format() {
        assert_eq!(PixelFormat::Nv21.frame_len(4, 2), Some(12));
        assert_eq!(PixelFormat::Rgba8888.frame_len(2, 2), Some(16));
        assert_eq!(PixelFormat::Private.frame_len(2, 2), None);
    }
}
