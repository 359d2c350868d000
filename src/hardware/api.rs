//! The capture hardware capability consumed by the session controller.
//!
//! Every call that changes device state is asynchronous: the result comes
//! back later through one of the callback traits, on whatever thread the
//! implementation chooses. `close` and `stop_repeating` are the exceptions
//! and complete before returning.

use crate::capture::{FramePool, PixelFormat, PreviewSize, RawFrame};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported synchronously by hardware calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HardwareError {
    /// No device has this id.
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    /// Another client holds the device.
    #[error("camera device in use: {0}")]
    DeviceInUse(String),
    /// The device went away.
    #[error("camera device disconnected: {0}")]
    Disconnected(String),
    /// The call is not valid in the object's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Any other backend failure.
    #[error("hardware call failed: {0}")]
    Failed(String),
}

/// Error codes delivered through [`DeviceStateCallback::on_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    /// The device is held by another client.
    InUse,
    /// Too many devices are open system-wide.
    MaxCamerasInUse,
    /// Policy forbids opening the device.
    Disabled,
    /// Fatal device failure; the device must be closed.
    Device,
    /// Fatal camera service failure.
    Service,
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceErrorCode::InUse => "camera in use",
            DeviceErrorCode::MaxCamerasInUse => "max cameras in use",
            DeviceErrorCode::Disabled => "camera disabled",
            DeviceErrorCode::Device => "device error",
            DeviceErrorCode::Service => "service error",
        };
        f.write_str(name)
    }
}

/// Why a single capture did not produce a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFailureReason {
    /// The framework dropped the request.
    Error,
    /// The request was flushed before completion.
    Flushed,
}

/// Template a capture request is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    /// Continuous preview.
    Preview,
    /// Video recording.
    Record,
    /// Single still capture.
    StillCapture,
}

/// Notified whenever a frame lands in a pool.
pub trait FrameAvailableListener: Send + Sync {
    /// Called from the hardware's producer thread after `pool` gained a frame.
    fn on_frame_available(&self, pool: &Arc<FramePool>);
}

/// A buffer sink the hardware renders frames into.
#[derive(Clone)]
pub struct OutputTarget {
    pool: Arc<FramePool>,
    listener: Arc<dyn FrameAvailableListener>,
}

impl OutputTarget {
    /// Binds a pool to the listener that should hear about new frames.
    pub fn new(pool: Arc<FramePool>, listener: Arc<dyn FrameAvailableListener>) -> Self {
        Self { pool, listener }
    }

    /// Returns the backing pool.
    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Writes a frame into the pool and notifies the listener, unless a
    /// notification for this pool is already waiting to be handled.
    ///
    /// Returns `false` if the pool is closed and the frame was discarded.
    pub fn publish(&self, frame: RawFrame) -> bool {
        if !self.pool.push(frame) {
            return false;
        }
        if self.pool.begin_notify() {
            self.listener.on_frame_available(&self.pool);
        }
        true
    }
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputTarget")
            .field("pool", &self.pool)
            .finish()
    }
}

/// Output pipeline requested when creating a capture session.
#[derive(Debug, Clone)]
pub struct OutputConfiguration {
    /// Where frames go.
    pub target: OutputTarget,
    /// Frame dimensions.
    pub size: PreviewSize,
    /// Frame pixel format.
    pub format: PixelFormat,
}

impl OutputConfiguration {
    /// Describes an output writing into `target` at the pool's size and format.
    pub fn for_target(target: OutputTarget) -> Self {
        let size = target.pool().size();
        let format = target.pool().format();
        Self {
            target,
            size,
            format,
        }
    }
}

/// A capture request bound to one or more output targets.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    template: RequestTemplate,
    targets: Vec<OutputTarget>,
}

impl CaptureRequest {
    /// Creates an empty request from a template.
    pub fn new(template: RequestTemplate) -> Self {
        Self {
            template,
            targets: Vec::new(),
        }
    }

    /// Adds an output target.
    pub fn add_target(&mut self, target: OutputTarget) {
        self.targets.push(target);
    }

    /// Returns the template.
    pub fn template(&self) -> RequestTemplate {
        self.template
    }

    /// Returns the output targets.
    pub fn targets(&self) -> &[OutputTarget] {
        &self.targets
    }
}

/// Opened capture device.
pub type CameraHandle = Arc<dyn CameraDevice>;

/// Configured capture session.
pub type SessionHandle = Arc<dyn CaptureSession>;

/// Entry point of the capture hardware.
pub trait HardwareCameraApi: Send + Sync {
    /// Starts opening a device. The outcome arrives through `callback`.
    fn open(
        &self,
        device_id: &str,
        callback: Arc<dyn DeviceStateCallback>,
    ) -> Result<(), HardwareError>;
}

/// An opened device.
pub trait CameraDevice: Send + Sync {
    /// Device identifier.
    fn id(&self) -> &str;

    /// Starts configuring a session. The outcome arrives through `callback`.
    fn create_capture_session(
        &self,
        output: OutputConfiguration,
        callback: Arc<dyn SessionStateCallback>,
    ) -> Result<(), HardwareError>;

    /// Builds a request from a template.
    fn create_capture_request(
        &self,
        template: RequestTemplate,
    ) -> Result<CaptureRequest, HardwareError>;

    /// Closes the device. Sessions created from it stop producing frames.
    fn close(&self) -> Result<(), HardwareError>;
}

/// A configured output pipeline.
pub trait CaptureSession: Send + Sync {
    /// Starts repeating `request` until stopped.
    fn set_repeating_request(
        &self,
        request: CaptureRequest,
        callback: Arc<dyn CaptureCallback>,
    ) -> Result<(), HardwareError>;

    /// Stops the repeating request.
    fn stop_repeating(&self) -> Result<(), HardwareError>;

    /// Closes the session.
    fn close(&self) -> Result<(), HardwareError>;
}

/// Device lifecycle notifications.
pub trait DeviceStateCallback: Send + Sync {
    /// The device finished opening.
    fn on_opened(&self, device: CameraHandle);

    /// The device went away.
    fn on_disconnected(&self, device: CameraHandle);

    /// The device hit a fatal error.
    fn on_error(&self, device: CameraHandle, error: DeviceErrorCode);

    /// The device finished closing.
    fn on_closed(&self, _device_id: &str) {}
}

/// Session configuration notifications.
pub trait SessionStateCallback: Send + Sync {
    /// The session is ready for requests.
    fn on_configured(&self, session: SessionHandle);

    /// The requested output could not be configured.
    fn on_configure_failed(&self);

    /// The session finished closing.
    fn on_closed(&self) {}
}

/// Per-capture notifications for a repeating request.
pub trait CaptureCallback: Send + Sync {
    /// A capture completed.
    fn on_capture_completed(&self, _frame_number: u64) {}

    /// A capture failed.
    fn on_capture_failed(&self, frame_number: u64, reason: CaptureFailureReason);

    /// A buffer for a capture was lost.
    fn on_capture_buffer_lost(&self, frame_number: u64);
}
