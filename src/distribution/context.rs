//! The frame-delivery execution context.
//!
//! A dedicated thread owns the [`FrameDistributor`]. Every interaction,
//! including subscriber registration, is a message posted to that thread,
//! so the subscriber set is only ever touched from one place.

use super::distributor::{DistributionStats, FrameDistributor, SubscriberId};
use super::sink::FrameSink;
use crate::capture::FramePool;
use crate::hardware::FrameAvailableListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Errors starting the delivery context.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The delivery thread could not start.
    #[error("failed to spawn frame-delivery thread: {0}")]
    Spawn(#[from] std::io::Error),
}

enum DeliveryEvent {
    Subscribe(SubscriberId, Arc<dyn FrameSink>),
    Unsubscribe(SubscriberId),
    FrameAvailable(Arc<FramePool>),
    Flush(Sender<DistributionStats>),
    Shutdown,
}

/// Posts frame-available notifications to the delivery thread.
#[derive(Clone)]
pub struct DeliveryNotifier {
    tx: Sender<DeliveryEvent>,
}

impl FrameAvailableListener for DeliveryNotifier {
    fn on_frame_available(&self, pool: &Arc<FramePool>) {
        // A stopped context leaves the frame queued; the pool releases it on close.
        let _ = self.tx.send(DeliveryEvent::FrameAvailable(Arc::clone(pool)));
    }
}

/// Handle to the frame-delivery thread.
pub struct DeliveryContext {
    tx: Sender<DeliveryEvent>,
    next_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl DeliveryContext {
    /// Name of the delivery thread.
    pub const THREAD_NAME: &'static str = "frame-delivery";

    /// Moves `distributor` onto a new delivery thread.
    pub fn start(distributor: FrameDistributor) -> Result<Self, DeliveryError> {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || run_delivery(distributor, rx))?;
        Ok(Self {
            tx,
            next_id: AtomicU64::new(1),
            worker: Some(worker),
        })
    }

    /// Registers a subscriber. Takes effect once the delivery thread
    /// processes the request; frames already queued ahead of it are not
    /// delivered to the new subscriber.
    pub fn add_listener(&self, sink: Arc<dyn FrameSink>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.post(DeliveryEvent::Subscribe(id, sink));
        id
    }

    /// Unregisters a subscriber. Unknown ids are ignored.
    pub fn remove_listener(&self, id: SubscriberId) {
        self.post(DeliveryEvent::Unsubscribe(id));
    }

    /// Returns a listener that output targets use to announce new frames.
    pub fn notifier(&self) -> DeliveryNotifier {
        DeliveryNotifier {
            tx: self.tx.clone(),
        }
    }

    /// Waits until everything posted before this call has been processed
    /// and returns the distributor's counters.
    pub fn flush(&self, timeout: Duration) -> Option<DistributionStats> {
        let (reply_tx, reply_rx) = mpsc::channel();
        if !self.post(DeliveryEvent::Flush(reply_tx)) {
            return None;
        }
        reply_rx.recv_timeout(timeout).ok()
    }

    fn post(&self, event: DeliveryEvent) -> bool {
        if self.tx.send(event).is_err() {
            tracing::warn!("frame-delivery thread is gone, dropping request");
            return false;
        }
        true
    }
}

impl Drop for DeliveryContext {
    fn drop(&mut self) {
        let _ = self.tx.send(DeliveryEvent::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                tracing::error!("frame-delivery thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext").finish_non_exhaustive()
    }
}

fn run_delivery(mut distributor: FrameDistributor, rx: Receiver<DeliveryEvent>) {
    tracing::debug!(format = %distributor.expected_format(), "frame delivery started");
    while let Ok(event) = rx.recv() {
        match event {
            DeliveryEvent::Subscribe(id, sink) => distributor.add(id, sink),
            DeliveryEvent::Unsubscribe(id) => {
                distributor.remove(id);
            }
            DeliveryEvent::FrameAvailable(pool) => {
                distributor.on_frame_available(&pool);
            }
            DeliveryEvent::Flush(reply) => {
                let _ = reply.send(distributor.stats());
            }
            DeliveryEvent::Shutdown => break,
        }
    }
    tracing::debug!(stats = ?distributor.stats(), "frame delivery stopped");
}
