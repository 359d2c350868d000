//! Frame fan-out on the frame-delivery context.
//!
//! Frames arrive as availability notifications from the hardware, are
//! pulled from their pool by the [`FrameDistributor`] and handed to each
//! [`FrameSink`] in turn before being released.

mod context;
mod distributor;
mod dump;
mod sink;

pub use context::{DeliveryContext, DeliveryError, DeliveryNotifier};
pub use distributor::{DistributionStats, FrameDistributor, SubscriberId, SubscriberSet};
pub use dump::FrameDumper;
pub use sink::{CountingSink, FrameSink, SinkError};
