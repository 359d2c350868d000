//! Prometheus metrics for the session controller.
//!
//! # Metrics Exposed
//!
//! ## Lifecycle
//! - `camera_core_open_attempts_total` - Open requests issued to the hardware
//! - `camera_core_lock_timeouts_total` - Lock acquisitions that timed out
//! - `camera_core_closes_total` - Completed close sequences
//! - `camera_core_faults_total{kind}` - Absorbed device, configuration and teardown faults
//! - `camera_core_session_phase` - Current session phase code
//!
//! ## Frames
//! - `camera_core_frames_delivered_total` - Frames fanned out to subscribers
//! - `camera_core_frames_rejected_total` - Frames with an unexpected pixel format
//! - `camera_core_subscriber_failures_total` - Failed or panicking subscriber calls
//! - `camera_core_subscribers` - Registered subscribers
//! - `camera_core_first_frame_latency_seconds` - Latency of the latest first frame
//!
//! # Example
//!
//! ```no_run
//! use camera_core::metrics::SessionMetrics;
//!
//! let metrics = SessionMetrics::new().expect("Failed to create registry");
//! metrics.record_open_attempt();
//! println!("{}", metrics.encode().unwrap());
//! ```

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{MetricsError, MetricsSnapshot, SessionMetrics};
#[cfg(feature = "metrics")]
pub use server::{MetricsServer, MetricsServerConfig, ServerError};
