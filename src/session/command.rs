//! Results of commands submitted to the operation context.

use super::state::SessionPhase;
use crate::capture::ConfigError;
use crate::distribution::DeliveryError;
use crate::metrics::MetricsError;
use crate::sync::{LockError, QueueError};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to controller callers.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The open/close permit was not granted in time.
    #[error("timed out after {timeout:?} waiting to {operation}")]
    AcquisitionTimeout {
        /// The command that wanted the permit.
        operation: String,
        /// How long it waited.
        timeout: Duration,
    },
    /// Open was issued while the session was not closed.
    #[error("camera is already {0}")]
    AlreadyOpen(SessionPhase),
    /// A close discarded the command before it ran.
    #[error("{operation} was cancelled before it started")]
    Cancelled {
        /// The discarded command.
        operation: &'static str,
    },
    /// The command did not finish within the wait.
    #[error("{operation} has not finished yet")]
    Pending {
        /// The command still in flight.
        operation: &'static str,
    },
    /// The controller was shut down.
    #[error("operation queue is shut down")]
    QueueClosed,
    /// Rejected capture configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// An execution context failed to start.
    #[error("failed to start execution context: {0}")]
    Queue(#[from] QueueError),
    /// The delivery context failed to start.
    #[error("failed to start frame delivery: {0}")]
    Delivery(#[from] DeliveryError),
    /// The metrics registry could not be built.
    #[error("failed to create metrics: {0}")]
    Metrics(#[from] MetricsError),
}

impl From<LockError> for ControllerError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AcquisitionTimeout { operation, timeout } => {
                ControllerError::AcquisitionTimeout { operation, timeout }
            }
        }
    }
}

impl ControllerError {
    /// True for the error callers are expected to act on.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ControllerError::AcquisitionTimeout { .. })
    }
}

/// Completion handle for one queued command.
///
/// Dropping the handle does not cancel the command.
#[derive(Debug)]
pub struct CommandHandle {
    operation: &'static str,
    rx: Receiver<Result<(), ControllerError>>,
}

impl CommandHandle {
    pub(crate) fn new(operation: &'static str, rx: Receiver<Result<(), ControllerError>>) -> Self {
        Self { operation, rx }
    }

    /// A handle that is already resolved with `result`.
    pub(crate) fn resolved(operation: &'static str, result: Result<(), ControllerError>) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let _ = tx.send(result);
        Self { operation, rx }
    }

    /// Name of the command.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Waits for the command to finish.
    ///
    /// A command drained before it started yields [`ControllerError::Cancelled`];
    /// one still queued or running when `timeout` elapses yields
    /// [`ControllerError::Pending`] and can be waited on again.
    pub fn wait(&self, timeout: Duration) -> Result<(), ControllerError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ControllerError::Pending {
                operation: self.operation,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ControllerError::Cancelled {
                operation: self.operation,
            }),
        }
    }

    /// Returns the result if the command already finished.
    pub fn try_result(&self) -> Option<Result<(), ControllerError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ControllerError::Cancelled {
                operation: self.operation,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_handle() {
        let handle = CommandHandle::resolved("close camera", Ok(()));
        assert!(handle.wait(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_dropped_sender_means_cancelled() {
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = CommandHandle::new("start preview", rx);
        assert!(handle.try_result().is_none());
        drop(tx);
        assert!(matches!(
            handle.wait(Duration::from_millis(10)),
            Err(ControllerError::Cancelled { operation: "start preview" })
        ));
    }

    #[test]
    fn test_pending_then_finished() {
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = CommandHandle::new("open camera", rx);
        assert!(matches!(
            handle.wait(Duration::from_millis(5)),
            Err(ControllerError::Pending { .. })
        ));
        tx.send(Err(ControllerError::AlreadyOpen(SessionPhase::Open))).unwrap();
        assert!(matches!(
            handle.wait(Duration::from_millis(5)),
            Err(ControllerError::AlreadyOpen(SessionPhase::Open))
        ));
    }

    #[test]
    fn test_lock_timeout_maps_to_acquisition_timeout() {
        let err: ControllerError = LockError::AcquisitionTimeout {
            operation: "open camera".to_string(),
            timeout: Duration::from_millis(2500),
        }
        .into();
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "timed out after 2.5s waiting to open camera"
        );
    }
}
