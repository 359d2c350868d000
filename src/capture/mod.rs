//! Capture configuration, frame types and the bounded frame source.
//!
//! Frames flow from the hardware into a [`FramePool`] and leave it as
//! [`FrameBuffer`]s that are released exactly once.

mod config;
mod frame;
mod pool;

pub use config::{
    CaptureConfig, ConfigError, FileConfig, PreviewSize, RunConfig, LOCK_ACQUIRE_TIMEOUT,
    MAX_BUFFER_DEPTH,
};
pub use frame::{FrameBuffer, PixelFormat, RawFrame};
pub use pool::{FramePool, PoolStats};
