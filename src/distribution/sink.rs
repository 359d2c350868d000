//! Frame consumer capability.

use crate::capture::FrameBuffer;
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors a subscriber may report for one frame.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Writing the frame failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The sink refused the frame.
    #[error("frame rejected: {0}")]
    Rejected(String),
}

/// A consumer of delivered frames.
///
/// Called on the frame-delivery thread once per frame. The buffer is only
/// valid for the duration of the call.
pub trait FrameSink: Send + Sync {
    /// Handles one frame.
    fn on_frame_available(&self, frame: &FrameBuffer) -> Result<(), SinkError>;
}

impl<F> FrameSink for F
where
    F: Fn(&FrameBuffer) -> Result<(), SinkError> + Send + Sync,
{
    fn on_frame_available(&self, frame: &FrameBuffer) -> Result<(), SinkError> {
        self(frame)
    }
}

#[derive(Debug, Default)]
struct Tally {
    frames: u64,
    bytes: u64,
    last_sequence: Option<u64>,
}

/// Sink that counts frames and lets other threads wait for a count.
#[derive(Debug, Default)]
pub struct CountingSink {
    tally: Mutex<Tally>,
    changed: Condvar,
}

impl CountingSink {
    /// A sink that has seen no frames.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames seen so far.
    pub fn frames(&self) -> u64 {
        self.tally.lock().unwrap_or_else(|e| e.into_inner()).frames
    }

    /// Bytes seen so far.
    pub fn bytes(&self) -> u64 {
        self.tally.lock().unwrap_or_else(|e| e.into_inner()).bytes
    }

    /// Sequence number of the most recent frame.
    pub fn last_sequence(&self) -> Option<u64> {
        self.tally
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_sequence
    }

    /// Blocks until at least `count` frames arrived or `timeout` elapsed.
    pub fn wait_for(&self, count: u64, timeout: Duration) -> bool {
        let tally = self.tally.lock().unwrap_or_else(|e| e.into_inner());
        let (tally, _) = self
            .changed
            .wait_timeout_while(tally, timeout, |t| t.frames < count)
            .unwrap_or_else(|e| e.into_inner());
        tally.frames >= count
    }
}

impl FrameSink for CountingSink {
    fn on_frame_available(&self, frame: &FrameBuffer) -> Result<(), SinkError> {
        let mut tally = self.tally.lock().unwrap_or_else(|e| e.into_inner());
        tally.frames += 1;
        tally.bytes += frame.data().len() as u64;
        tally.last_sequence = Some(frame.sequence());
        drop(tally);
        self.changed.notify_all();
        Ok(())
    }
}
