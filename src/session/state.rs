//! Session phases and the faults the controller absorbs.

use std::fmt;
use thiserror::Error;

/// Lifecycle phase of a session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// No device is held.
    Closed,
    /// An open request is in flight.
    Opening,
    /// The device is open, no session is configured.
    Open,
    /// A capture session is being configured.
    Configuring,
    /// The repeating preview request is running.
    Streaming,
    /// Resources are being torn down.
    Closing,
}

impl SessionPhase {
    /// Numeric code exported through metrics.
    pub fn code(&self) -> i64 {
        match self {
            SessionPhase::Closed => 0,
            SessionPhase::Opening => 1,
            SessionPhase::Open => 2,
            SessionPhase::Configuring => 3,
            SessionPhase::Streaming => 4,
            SessionPhase::Closing => 5,
        }
    }

    /// True in every phase where a device handle may be held.
    pub fn holds_device(&self) -> bool {
        matches!(
            self,
            SessionPhase::Open | SessionPhase::Configuring | SessionPhase::Streaming
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Closed => "closed",
            SessionPhase::Opening => "opening",
            SessionPhase::Open => "open",
            SessionPhase::Configuring => "configuring",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// A failure recovered inside the controller. Logged and counted, never
/// returned to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionFault {
    /// The device reported an error or disconnected.
    #[error("device {device} failed: {reason}")]
    Device {
        /// Device id.
        device: String,
        /// What the device reported.
        reason: String,
    },
    /// The capture session could not be configured.
    #[error("session configuration failed: {0}")]
    Configuration(String),
    /// A close step failed or panicked.
    #[error("teardown step '{step}' failed: {reason}")]
    Teardown {
        /// Which step.
        step: &'static str,
        /// The failure message.
        reason: String,
    },
}

impl SessionFault {
    /// Metric label for this fault.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionFault::Device { .. } => "device",
            SessionFault::Configuration(_) => "configuration",
            SessionFault::Teardown { .. } => "teardown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_codes_are_distinct() {
        let phases = [
            SessionPhase::Closed,
            SessionPhase::Opening,
            SessionPhase::Open,
            SessionPhase::Configuring,
            SessionPhase::Streaming,
            SessionPhase::Closing,
        ];
        let mut codes: Vec<i64> = phases.iter().map(SessionPhase::code).collect();
        codes.dedup();
        assert_eq!(codes.len(), phases.len());
        assert_eq!(SessionPhase::Streaming.to_string(), "streaming");
    }

    #[test]
    fn test_fault_kinds() {
        let fault = SessionFault::Teardown {
            step: "session",
            reason: "busy".to_string(),
        };
        assert_eq!(fault.kind(), "teardown");
        assert_eq!(fault.to_string(), "teardown step 'session' failed: busy");
        assert_eq!(SessionFault::Configuration("x".into()).kind(), "configuration");
    }
}
