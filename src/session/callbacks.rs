//! Hardware callback adapters.
//!
//! The hardware may call these from any thread. Each adapter re-posts the
//! event onto the controller's callback context, tagged with the open
//! cycle it was created for. Adapters hold only a weak reference, so a
//! hardware stack that keeps old callbacks around does not keep the
//! controller alive.

use super::controller::ControllerInner;
use crate::hardware::{
    CameraHandle, CaptureCallback, CaptureFailureReason, DeviceErrorCode, DeviceStateCallback,
    SessionHandle, SessionStateCallback,
};
use std::sync::{Arc, Weak};

/// Runs `f` on the callback context. Returns false if the controller is
/// gone or no longer accepts callbacks.
fn post<F>(inner: &Weak<ControllerInner>, f: F) -> bool
where
    F: FnOnce(&Arc<ControllerInner>) + Send + 'static,
{
    let Some(inner) = inner.upgrade() else {
        return false;
    };
    let target = Arc::clone(&inner);
    inner.callbacks().submit(move || f(&target)).is_ok()
}

fn close_orphan(device: &CameraHandle) {
    tracing::warn!(device = device.id(), "controller gone, closing orphaned device");
    if let Err(e) = device.close() {
        tracing::warn!(device = device.id(), error = %e, "orphaned device close failed");
    }
}

pub(super) struct DeviceEvents {
    inner: Weak<ControllerInner>,
    generation: u64,
}

impl DeviceEvents {
    pub(super) fn new(inner: Weak<ControllerInner>, generation: u64) -> Self {
        Self { inner, generation }
    }

    fn device_lost(&self, device: CameraHandle, reason: String) {
        let generation = self.generation;
        let fallback = Arc::clone(&device);
        if !post(&self.inner, move |inner| {
            inner.on_device_lost(generation, device, reason)
        }) {
            close_orphan(&fallback);
        }
    }
}

impl DeviceStateCallback for DeviceEvents {
    fn on_opened(&self, device: CameraHandle) {
        let generation = self.generation;
        let fallback = Arc::clone(&device);
        if !post(&self.inner, move |inner| {
            inner.on_device_opened(generation, device)
        }) {
            close_orphan(&fallback);
        }
    }

    fn on_disconnected(&self, device: CameraHandle) {
        self.device_lost(device, "disconnected".to_string());
    }

    fn on_error(&self, device: CameraHandle, error: DeviceErrorCode) {
        self.device_lost(device, error.to_string());
    }

    fn on_closed(&self, device_id: &str) {
        tracing::debug!(device = device_id, generation = self.generation, "device closed");
    }
}

pub(super) struct SessionEvents {
    inner: Weak<ControllerInner>,
    generation: u64,
}

impl SessionEvents {
    pub(super) fn new(inner: Weak<ControllerInner>, generation: u64) -> Self {
        Self { inner, generation }
    }
}

impl SessionStateCallback for SessionEvents {
    fn on_configured(&self, session: SessionHandle) {
        let generation = self.generation;
        let fallback = Arc::clone(&session);
        if !post(&self.inner, move |inner| {
            inner.on_session_configured(generation, session)
        }) {
            tracing::warn!("controller gone, closing orphaned session");
            let _ = fallback.close();
        }
    }

    fn on_configure_failed(&self) {
        let generation = self.generation;
        post(&self.inner, move |inner| inner.on_configure_failed(generation));
    }

    fn on_closed(&self) {
        tracing::debug!(generation = self.generation, "capture session closed");
    }
}

/// Logs per-capture problems. These never change session state.
pub(super) struct CaptureEvents {
    generation: u64,
}

impl CaptureEvents {
    pub(super) fn new(generation: u64) -> Self {
        Self { generation }
    }
}

impl CaptureCallback for CaptureEvents {
    fn on_capture_failed(&self, frame_number: u64, reason: CaptureFailureReason) {
        tracing::debug!(generation = self.generation, frame_number, ?reason, "capture failed");
    }

    fn on_capture_buffer_lost(&self, frame_number: u64) {
        tracing::debug!(generation = self.generation, frame_number, "capture buffer lost");
    }
}
