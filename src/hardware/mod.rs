//! Capture hardware abstraction.
//!
//! The controller talks to hardware only through these traits, which
//! allows swapping a real backend for [`MockHardware`] in tests.

mod api;
mod mock;

pub use api::{
    CameraDevice, CameraHandle, CaptureCallback, CaptureFailureReason, CaptureRequest,
    CaptureSession, DeviceErrorCode, DeviceStateCallback, FrameAvailableListener,
    HardwareCameraApi, HardwareError, OutputConfiguration, OutputTarget, RequestTemplate,
    SessionHandle, SessionStateCallback,
};
pub use mock::{MockBehavior, MockHardware, MockStats, OpenOutcome};
