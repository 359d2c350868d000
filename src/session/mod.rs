//! Capture session lifecycle.
//!
//! [`SessionController`] accepts open, preview and close requests from any
//! thread, drives the hardware through `Closed → Opening → Open →
//! Configuring → Streaming → Closing → Closed`, and publishes frames through
//! the delivery context.

mod callbacks;
mod command;
mod controller;
mod state;

pub use command::{CommandHandle, ControllerError};
pub use controller::SessionController;
pub use state::{SessionFault, SessionPhase};
