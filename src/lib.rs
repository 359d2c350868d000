//! Camera Core Library
//!
//! Lifecycle control for a single exclusive capture device: open,
//! configure a preview stream, fan frames out to subscribers, and tear
//! everything down again, with every hardware interaction serialized.
//!
//! # Architecture
//!
//! Work runs on three execution contexts:
//!
//! ```text
//!   caller ──► camera-op ──► hardware ──► camera-callback ──┐
//!                 ▲                                          │
//!                 └──────────── follow-up commands ◄─────────┘
//!
//!   hardware frame source ──► frame-delivery ──► subscribers
//! ```
//!
//! - [`session`]: the state machine and its public controller
//! - [`sync`]: the open/close permit and serial task queues
//! - [`hardware`]: the hardware traits and a mock backend
//! - [`capture`]: configuration, frames and the bounded frame source
//! - [`distribution`]: subscriber fan-out on the delivery context
//! - [`metrics`]: Prometheus counters for the above
//!
//! # Design Principles
//!
//! - **One holder**: open and close are bracketed by a single permit
//! - **Stale-safe**: callbacks from an abandoned open only clean up
//! - **Close always completes**: no teardown failure stops the sequence
//! - **Frames released once**: every acquired buffer is returned exactly once
//!
//! # Example
//!
//! ```no_run
//! use camera_core::{
//!     capture::CaptureConfig,
//!     distribution::CountingSink,
//!     hardware::MockHardware,
//!     session::{SessionController, SessionPhase},
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let hardware = Arc::new(MockHardware::new());
//! let controller = SessionController::new(hardware, CaptureConfig::default()).unwrap();
//!
//! let sink = Arc::new(CountingSink::new());
//! controller.add_frame_listener(sink.clone());
//!
//! controller.open_camera(0).wait(Duration::from_secs(3)).unwrap();
//! controller.wait_for_state(SessionPhase::Streaming, Duration::from_secs(1));
//! sink.wait_for(10, Duration::from_secs(1));
//!
//! controller.shutdown(Duration::from_secs(5)).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod capture;
pub mod distribution;
pub mod hardware;
pub mod metrics;
pub mod session;
pub mod sync;

// Re-export commonly used types at crate root
pub use capture::{CaptureConfig, FrameBuffer, PixelFormat, PreviewSize};
pub use distribution::{FrameSink, SubscriberId};
pub use hardware::{HardwareCameraApi, MockHardware};
pub use metrics::SessionMetrics;
pub use session::{CommandHandle, ControllerError, SessionController, SessionPhase};
pub use sync::{ResourceLock, SerialTaskQueue};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
