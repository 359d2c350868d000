//! Fan-out of one frame to every registered subscriber.
//!
//! A distributor is owned by exactly one thread. It never locks its
//! subscriber set: additions and removals arrive as messages on the same
//! thread that delivers frames.

use super::sink::FrameSink;
use crate::capture::{FrameBuffer, FramePool, PixelFormat};
use crate::metrics::SessionMetrics;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Identifies a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl From<u64> for SubscriberId {
    /// For callers driving a [`FrameDistributor`] directly instead of
    /// through a delivery context.
    fn from(raw: u64) -> Self {
        SubscriberId(raw)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// Registered frame consumers, kept in registration order.
#[derive(Default)]
pub struct SubscriberSet {
    entries: Vec<(SubscriberId, Arc<dyn FrameSink>)>,
}

impl SubscriberSet {
    /// Adds a subscriber; re-adding an id replaces its sink.
    pub fn insert(&mut self, id: SubscriberId, sink: Arc<dyn FrameSink>) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => entry.1 = sink,
            None => self.entries.push((id, sink)),
        }
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscriber ids in registration order.
    pub fn ids(&self) -> Vec<SubscriberId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    fn iter(&self) -> impl Iterator<Item = &(SubscriberId, Arc<dyn FrameSink>)> {
        self.entries.iter()
    }
}

/// Counters kept by a distributor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionStats {
    /// Frames handed to the subscriber set.
    pub frames_delivered: u64,
    /// Frames released without delivery because of their format.
    pub frames_rejected: u64,
    /// Individual subscriber calls that failed or panicked.
    pub subscriber_failures: u64,
    /// Streaming cycles whose first frame was seen.
    pub first_frames: u64,
    /// Subscribers currently registered.
    pub subscribers: usize,
}

/// Delivers frames from a pool to the subscriber set.
pub struct FrameDistributor {
    expected_format: PixelFormat,
    subscribers: SubscriberSet,
    stats: DistributionStats,
    metrics: Option<Arc<SessionMetrics>>,
}

impl FrameDistributor {
    /// Creates a distributor that only delivers frames tagged `expected_format`.
    pub fn new(expected_format: PixelFormat) -> Self {
        Self {
            expected_format,
            subscribers: SubscriberSet::default(),
            stats: DistributionStats::default(),
            metrics: None,
        }
    }

    /// Mirrors counters into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<SessionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Format a frame must carry to be delivered.
    pub fn expected_format(&self) -> PixelFormat {
        self.expected_format
    }

    /// Registers `sink` under `id`, replacing any sink already there.
    pub fn add(&mut self, id: SubscriberId, sink: Arc<dyn FrameSink>) {
        self.subscribers.insert(id, sink);
        self.subscribers_changed();
        tracing::debug!(%id, subscribers = self.subscribers.len(), "subscriber added");
    }

    /// Unregisters `id`. Returns false if it was not registered.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(id);
        if removed {
            self.subscribers_changed();
            tracing::debug!(%id, subscribers = self.subscribers.len(), "subscriber removed");
        }
        removed
    }

    /// The current subscriber set.
    pub fn subscribers(&self) -> &SubscriberSet {
        &self.subscribers
    }

    /// Counters since construction.
    pub fn stats(&self) -> DistributionStats {
        self.stats
    }

    fn subscribers_changed(&mut self) {
        self.stats.subscribers = self.subscribers.len();
        if let Some(metrics) = &self.metrics {
            metrics.set_subscribers(self.subscribers.len());
        }
    }

    /// Handles a frame-available notification for `pool`.
    ///
    /// Takes the newest frame (older ones are dropped by the pool), checks its
    /// format, delivers it and releases it. Returns the number of subscribers
    /// that handled the frame successfully, or `None` if nothing was delivered.
    pub fn on_frame_available(&mut self, pool: &FramePool) -> Option<usize> {
        pool.end_notify();
        let frame = pool.acquire_latest()?;

        if frame.format() != self.expected_format {
            tracing::debug!(
                expected = %self.expected_format,
                actual = %frame.format(),
                sequence = frame.sequence(),
                "discarding frame with unexpected format"
            );
            self.stats.frames_rejected += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_frame_rejected();
            }
            frame.release();
            return None;
        }

        if let Some(latency) = pool.take_first_frame() {
            tracing::info!(sequence = frame.sequence(), ?latency, "first frame arrived");
            self.stats.first_frames += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_first_frame(latency);
            }
        }

        Some(self.distribute(frame))
    }

    /// Hands `frame` to every subscriber, then releases it.
    ///
    /// A failing or panicking subscriber does not stop delivery to the rest.
    pub fn distribute(&mut self, frame: FrameBuffer) -> usize {
        let mut succeeded = 0;
        let mut failures = 0;
        for (id, sink) in self.subscribers.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.on_frame_available(&frame)));
            match outcome {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(%id, error = %e, sequence = frame.sequence(), "subscriber failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::error!(%id, sequence = frame.sequence(), "subscriber panicked");
                }
            }
        }
        frame.release();

        self.stats.frames_delivered += 1;
        self.stats.subscriber_failures += failures;
        if let Some(metrics) = &self.metrics {
            metrics.record_frame_delivered();
            for _ in 0..failures {
                metrics.record_subscriber_failure();
            }
        }
        succeeded
    }
}

impl fmt::Debug for FrameDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDistributor")
            .field("expected_format", &self.expected_format)
            .field("subscribers", &self.subscribers.ids())
            .field("stats", &self.stats)
            .finish()
    }
}
