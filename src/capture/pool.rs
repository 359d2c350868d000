//! Bounded frame source between the hardware and the delivery context.
//!
//! The pool holds at most `depth` undelivered frames. Consumers only ever
//! take the newest one; anything older is released on the spot.

use super::config::PreviewSize;
use super::frame::{FrameBuffer, PixelFormat, RawFrame};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Counters describing a pool's buffer traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Frames pushed by the hardware.
    pub published: u64,
    /// Frames handed out as [`FrameBuffer`]s.
    pub acquired: u64,
    /// Buffers returned after distribution.
    pub released: u64,
    /// Frames discarded without being acquired.
    pub dropped: u64,
}

impl PoolStats {
    /// Buffers acquired but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

struct Slots {
    queued: VecDeque<RawFrame>,
    closed: bool,
}

/// The image source bound to one capture session.
pub struct FramePool {
    size: PreviewSize,
    format: PixelFormat,
    depth: usize,
    slots: Mutex<Slots>,
    published: AtomicU64,
    acquired: AtomicU64,
    released: Arc<AtomicU64>,
    dropped: AtomicU64,
    notify_pending: AtomicBool,
    first_frame_armed: Mutex<Option<Instant>>,
}

impl FramePool {
    /// Creates a pool holding up to `depth` frames of the given size and format.
    pub fn new(size: PreviewSize, format: PixelFormat, depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            size,
            format,
            depth,
            slots: Mutex::new(Slots {
                queued: VecDeque::with_capacity(depth),
                closed: false,
            }),
            published: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            released: Arc::new(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
            notify_pending: AtomicBool::new(false),
            first_frame_armed: Mutex::new(None),
        }
    }

    /// Returns the frame size this pool was created for.
    pub fn size(&self) -> PreviewSize {
        self.size
    }

    /// Returns the pixel format this pool was created for.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Returns the number of slots.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // A poisoned pool only holds plain frames; keep using it.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a frame written by the hardware.
    ///
    /// Returns `false` if the pool is closed and the frame was discarded.
    pub fn push(&self, frame: RawFrame) -> bool {
        self.published.fetch_add(1, Ordering::AcqRel);
        let mut slots = self.slots();
        if slots.closed {
            self.dropped.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        if slots.queued.len() >= self.depth {
            slots.queued.pop_front();
            self.dropped.fetch_add(1, Ordering::AcqRel);
        }
        slots.queued.push_back(frame);
        true
    }

    /// Takes the newest queued frame, releasing every older one.
    pub fn acquire_latest(&self) -> Option<FrameBuffer> {
        let mut slots = self.slots();
        let latest = slots.queued.pop_back()?;
        let skipped = slots.queued.len() as u64;
        slots.queued.clear();
        drop(slots);

        if skipped > 0 {
            self.dropped.fetch_add(skipped, Ordering::AcqRel);
        }
        self.acquired.fetch_add(1, Ordering::AcqRel);
        Some(FrameBuffer::tracked(latest, Arc::clone(&self.released)))
    }

    /// Closes the pool, discarding queued frames. Later pushes are rejected.
    ///
    /// Buffers already acquired stay valid and are counted when released.
    pub fn close(&self) -> usize {
        let mut slots = self.slots();
        slots.closed = true;
        let discarded = slots.queued.len();
        slots.queued.clear();
        drop(slots);
        self.dropped.fetch_add(discarded as u64, Ordering::AcqRel);
        discarded
    }

    /// Marks a frame-available notification as in flight.
    ///
    /// Returns `true` only for the caller that should post it; while one is
    /// pending, further frames ride on the same notification.
    pub fn begin_notify(&self) -> bool {
        !self.notify_pending.swap(true, Ordering::AcqRel)
    }

    /// Clears the in-flight notification. Call before
    /// [`FramePool::acquire_latest`] so a frame pushed afterwards posts anew.
    pub fn end_notify(&self) {
        self.notify_pending.store(false, Ordering::Release);
    }

    /// Returns true once [`FramePool::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.slots().closed
    }

    /// Arms first-frame detection for a new streaming cycle.
    pub fn arm_first_frame(&self) {
        *self.first_frame_armed.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Returns the time since arming, exactly once per armed cycle.
    pub fn take_first_frame(&self) -> Option<Duration> {
        self.first_frame_armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|armed| armed.elapsed())
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            published: self.published.load(Ordering::Acquire),
            acquired: self.acquired.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("size", &self.size)
            .field("format", &self.format)
            .field("depth", &self.depth)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> RawFrame {
        RawFrame::new(vec![0u8; 4], 2, 2, PixelFormat::Gray8, sequence)
    }

    fn pool(depth: usize) -> FramePool {
        FramePool::new(PreviewSize::new(2, 2), PixelFormat::Gray8, depth)
    }

    #[test]
    fn test_notifications_coalesce_until_ended() {
        let pool = pool(3);
        assert!(pool.begin_notify());
        assert!(!pool.begin_notify());
        assert!(!pool.begin_notify());

        pool.end_notify();
        assert!(pool.begin_notify());
    }

    #[test]
    fn test_acquire_latest_drops_older() {
        let pool = pool(3);
        pool.push(frame(1));
        pool.push(frame(2));
        pool.push(frame(3));

        let buffer = pool.acquire_latest().unwrap();
        assert_eq!(buffer.sequence(), 3);
        assert!(pool.acquire_latest().is_none());
        buffer.release();

        let stats = pool.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn test_full_pool_discards_oldest() {
        let pool = pool(2);
        for seq in 1..=5 {
            assert!(pool.push(frame(seq)));
        }
        assert_eq!(pool.stats().dropped, 3);
        assert_eq!(pool.acquire_latest().map(|b| b.sequence()), Some(5));
    }

    #[test]
    fn test_closed_pool_rejects_frames() {
        let pool = pool(3);
        pool.push(frame(1));
        assert_eq!(pool.close(), 1);
        assert!(!pool.push(frame(2)));
        assert!(pool.acquire_latest().is_none());
        assert!(pool.is_closed());
    }

    #[test]
    fn test_buffer_released_after_close() {
        let pool = pool(3);
        pool.push(frame(1));
        let buffer = pool.acquire_latest().unwrap();
        pool.close();
        drop(buffer);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn test_first_frame_once_per_cycle() {
        let pool = pool(1);
        assert!(pool.take_first_frame().is_none());
        pool.arm_first_frame();
        assert!(pool.take_first_frame().is_some());
        assert!(pool.take_first_frame().is_none());
    }
}
