//! The session state machine.
//!
//! Three execution contexts cooperate here:
//!
//! - the operation context (`camera-op`) runs open, preview, streaming and
//!   close commands one at a time;
//! - the callback context (`camera-callback`) receives device and session
//!   notifications and may queue follow-up commands;
//! - the frame-delivery context owns the subscriber set.
//!
//! The [`ResourceLock`] brackets the open transition (acquired by the open
//! command, released by the device callback) and the close sequence.
//! Every open cycle gets a new generation number; callbacks carrying an
//! older generation are stale and only clean up after themselves.

use super::callbacks::{CaptureEvents, DeviceEvents, SessionEvents};
use super::command::{CommandHandle, ControllerError};
use super::state::{SessionFault, SessionPhase};
use crate::capture::{CaptureConfig, FramePool, PoolStats, PreviewSize};
use crate::distribution::{
    DeliveryContext, DistributionStats, FrameDistributor, FrameSink, SubscriberId,
};
use crate::hardware::{
    CameraHandle, HardwareCameraApi, HardwareError, OutputConfiguration, OutputTarget,
    RequestTemplate, SessionHandle,
};
use crate::metrics::SessionMetrics;
use crate::sync::{ResourceLock, SerialTaskQueue};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const OPEN_CAMERA: &str = "open camera";
const START_PREVIEW: &str = "start preview";
const START_STREAMING: &str = "start streaming";
const CLOSE_CAMERA: &str = "close camera";

struct SessionState {
    phase: SessionPhase,
    generation: u64,
    device: Option<CameraHandle>,
    session: Option<SessionHandle>,
    frame_source: Option<OutputTarget>,
    preview_size: PreviewSize,
}

pub(crate) struct ControllerInner {
    hardware: Arc<dyn HardwareCameraApi>,
    config: CaptureConfig,
    lock: ResourceLock,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    metrics: Arc<SessionMetrics>,
    operations: SerialTaskQueue,
    callbacks: SerialTaskQueue,
    delivery: DeliveryContext,
}

/// Owns one capture device and serializes everything done to it.
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    /// Creates a controller with a fresh metrics registry.
    pub fn new(
        hardware: Arc<dyn HardwareCameraApi>,
        config: CaptureConfig,
    ) -> Result<Self, ControllerError> {
        Self::with_metrics(hardware, config, Arc::new(SessionMetrics::new()?))
    }

    /// Creates a controller that records into `metrics`.
    pub fn with_metrics(
        hardware: Arc<dyn HardwareCameraApi>,
        config: CaptureConfig,
        metrics: Arc<SessionMetrics>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;

        let distributor =
            FrameDistributor::new(config.pixel_format).with_metrics(Arc::clone(&metrics));
        let delivery = DeliveryContext::start(distributor)?;
        let operations = SerialTaskQueue::new("camera-op")?;
        let callbacks = SerialTaskQueue::new("camera-callback")?;
        metrics.set_phase(SessionPhase::Closed.code());

        let state = SessionState {
            phase: SessionPhase::Closed,
            generation: 0,
            device: None,
            session: None,
            frame_source: None,
            preview_size: config.preview_size(),
        };

        Ok(Self {
            inner: Arc::new(ControllerInner {
                hardware,
                config,
                lock: ResourceLock::new(),
                state: Mutex::new(state),
                state_changed: Condvar::new(),
                metrics,
                operations,
                callbacks,
                delivery,
            }),
        })
    }

    /// Queues an open of `device_id`.
    ///
    /// The handle resolves once the open request reached the hardware (the
    /// device itself opens asynchronously), with
    /// [`ControllerError::AcquisitionTimeout`] if another open or close held
    /// the lock for too long, or [`ControllerError::AlreadyOpen`].
    pub fn open_camera(&self, device_id: u32) -> CommandHandle {
        self.inner
            .submit(OPEN_CAMERA, move |inner| inner.open_device(device_id))
    }

    /// Queues preview configuration with the current preview size.
    ///
    /// Opening already starts the preview; call this again after a failed
    /// configuration. Ignored unless the camera is open and idle.
    pub fn start_preview(&self) -> CommandHandle {
        self.inner
            .submit(START_PREVIEW, |inner| inner.start_preview(None))
    }

    /// Cancels every queued command that has not started and queues the
    /// close sequence.
    pub fn close_camera(&self) -> CommandHandle {
        self.inner.close_camera()
    }

    /// Closes the camera and waits for the close sequence to finish.
    pub fn shutdown(self, timeout: Duration) -> Result<(), ControllerError> {
        self.close_camera().wait(timeout)
    }

    /// Sets the preview size used by the next preview configuration.
    pub fn set_preview_size(&self, size: PreviewSize) {
        self.inner.state().preview_size = size;
    }

    /// Preview size for the next configuration.
    pub fn preview_size(&self) -> PreviewSize {
        self.inner.state().preview_size
    }

    /// Registers a frame subscriber on the delivery context.
    pub fn add_frame_listener(&self, sink: Arc<dyn FrameSink>) -> SubscriberId {
        self.inner.delivery.add_listener(sink)
    }

    /// Unregisters a frame subscriber.
    pub fn remove_frame_listener(&self, id: SubscriberId) {
        self.inner.delivery.remove_listener(id);
    }

    /// Current phase.
    pub fn state(&self) -> SessionPhase {
        self.inner.state().phase
    }

    /// Blocks until the controller reaches `phase` or `timeout` elapses.
    pub fn wait_for_state(&self, phase: SessionPhase, timeout: Duration) -> bool {
        let state = self.inner.state();
        let (state, _) = self
            .inner
            .state_changed
            .wait_timeout_while(state, timeout, |s| s.phase != phase)
            .unwrap_or_else(|e| e.into_inner());
        state.phase == phase
    }

    /// Available permits of the open/close lock: 0 or 1.
    pub fn lock_permits(&self) -> u32 {
        self.inner.lock.available_permits()
    }

    /// Commands queued on the operation context and not yet started.
    pub fn pending_operations(&self) -> usize {
        self.inner.operations.pending()
    }

    /// True while a device handle is held.
    pub fn has_device(&self) -> bool {
        self.inner.state().device.is_some()
    }

    /// True while a capture session is held.
    pub fn has_session(&self) -> bool {
        self.inner.state().session.is_some()
    }

    /// Counters of the current frame source, if one exists.
    pub fn frame_source_stats(&self) -> Option<PoolStats> {
        self.inner
            .state()
            .frame_source
            .as_ref()
            .map(|t| t.pool().stats())
    }

    /// Waits for the delivery context to process everything posted so far.
    pub fn flush_frames(&self, timeout: Duration) -> Option<DistributionStats> {
        self.inner.delivery.flush(timeout)
    }

    /// Configuration the controller was created with.
    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    /// Metrics recorded by this controller.
    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.inner.metrics
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let idle = self.inner.state().phase == SessionPhase::Closed
            && self.inner.operations.pending() == 0
            && !self.inner.operations.is_busy();
        if !idle {
            // Queued commands keep the inner state alive until the close runs.
            let _ = self.inner.close_camera();
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("phase", &self.state())
            .field("lock_permits", &self.lock_permits())
            .finish()
    }
}

impl ControllerInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn callbacks(&self) -> &SerialTaskQueue {
        &self.callbacks
    }

    fn set_phase(&self, state: &mut SessionState, phase: SessionPhase) {
        if state.phase == phase {
            return;
        }
        debug!(from = %state.phase, to = %phase, generation = state.generation, "session phase");
        state.phase = phase;
        self.metrics.set_phase(phase.code());
        self.state_changed.notify_all();
    }

    fn fault(&self, fault: SessionFault) {
        warn!(kind = fault.kind(), %fault, "session fault");
        self.metrics.record_fault(fault.kind());
    }

    /// Queues `command` on the operation context.
    fn submit<F>(self: &Arc<Self>, operation: &'static str, command: F) -> CommandHandle
    where
        F: FnOnce(&Arc<ControllerInner>) -> Result<(), ControllerError> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let inner = Arc::clone(self);
        let submitted = self.operations.submit(move || {
            let _span = tracing::debug_span!("command", operation).entered();
            let result = command(&inner);
            let _ = tx.send(result);
        });
        match submitted {
            Ok(()) => CommandHandle::new(operation, rx),
            Err(e) => {
                warn!(operation, error = %e, "command rejected");
                CommandHandle::resolved(operation, Err(ControllerError::QueueClosed))
            }
        }
    }

    fn close_camera(self: &Arc<Self>) -> CommandHandle {
        let drained = self.operations.drain();
        if drained > 0 {
            info!(drained, "cancelled pending operations");
        }
        self.submit(CLOSE_CAMERA, |inner| {
            inner.close_device();
            Ok(())
        })
    }

    // Operation context.

    fn open_device(self: &Arc<Self>, device_id: u32) -> Result<(), ControllerError> {
        if let Err(e) = self.lock.acquire(OPEN_CAMERA, self.config.lock_timeout()) {
            self.metrics.record_lock_timeout();
            return Err(e.into());
        }

        let generation = {
            let mut state = self.state();
            if state.phase != SessionPhase::Closed {
                let phase = state.phase;
                drop(state);
                self.lock.release("open camera rejected");
                warn!(%phase, "open ignored, camera not closed");
                return Err(ControllerError::AlreadyOpen(phase));
            }
            state.generation += 1;
            self.set_phase(&mut state, SessionPhase::Opening);
            state.generation
        };

        let id = device_id.to_string();
        info!(device = %id, generation, "opening camera");
        self.metrics.record_open_attempt();
        let callback = Arc::new(DeviceEvents::new(Arc::downgrade(self), generation));

        if let Err(e) = self.hardware.open(&id, callback) {
            self.fault(SessionFault::Device {
                device: id,
                reason: e.to_string(),
            });
            {
                let mut state = self.state();
                if state.generation == generation && state.phase == SessionPhase::Opening {
                    self.set_phase(&mut state, SessionPhase::Closed);
                }
            }
            self.lock.release("open camera failed");
        }
        Ok(())
    }

    fn start_preview(self: &Arc<Self>, cycle: Option<u64>) -> Result<(), ControllerError> {
        let (device, target, generation) = {
            let mut state = self.state();
            if cycle.is_some_and(|g| g != state.generation) {
                debug!("preview request belongs to an earlier open, ignoring");
                return Ok(());
            }
            if state.phase != SessionPhase::Open {
                debug!(phase = %state.phase, "preview not started, camera not idle");
                return Ok(());
            }
            let Some(device) = state.device.clone() else {
                debug!("preview not started, device is gone");
                return Ok(());
            };

            let pool = Arc::new(FramePool::new(
                state.preview_size,
                self.config.pixel_format,
                self.config.buffer_depth,
            ));
            let target = OutputTarget::new(pool, Arc::new(self.delivery.notifier()));
            state.frame_source = Some(target.clone());
            self.set_phase(&mut state, SessionPhase::Configuring);
            (device, target, state.generation)
        };

        info!(size = %target.pool().size(), format = %target.pool().format(), "starting preview");
        let output = OutputConfiguration::for_target(target);
        let callback = Arc::new(SessionEvents::new(Arc::downgrade(self), generation));
        if let Err(e) = device.create_capture_session(output, callback) {
            self.abandon_configuration(generation, None, e.to_string());
        }
        Ok(())
    }

    fn start_streaming(&self, generation: u64) -> Result<(), ControllerError> {
        let (device, session, target) = {
            let state = self.state();
            if state.generation != generation || state.phase != SessionPhase::Configuring {
                debug!(phase = %state.phase, "streaming not started, session superseded");
                return Ok(());
            }
            match (&state.device, &state.session, &state.frame_source) {
                (Some(d), Some(s), Some(t)) => (Arc::clone(d), Arc::clone(s), t.clone()),
                _ => {
                    debug!("streaming not started, session incomplete");
                    return Ok(());
                }
            }
        };

        let result = device
            .create_capture_request(RequestTemplate::Preview)
            .and_then(|mut request| {
                request.add_target(target.clone());
                target.pool().arm_first_frame();
                session.set_repeating_request(request, Arc::new(CaptureEvents::new(generation)))
            });

        match result {
            Ok(()) => {
                let mut state = self.state();
                if state.generation == generation && state.phase == SessionPhase::Configuring {
                    self.set_phase(&mut state, SessionPhase::Streaming);
                    info!(generation, "preview streaming");
                }
            }
            Err(e) => self.abandon_configuration(generation, Some(session), e.to_string()),
        }
        Ok(())
    }

    /// Returns a failed configuration to `Open`, releasing its session and
    /// frame source.
    fn abandon_configuration(&self, generation: u64, session: Option<SessionHandle>, reason: String) {
        let source = {
            let mut state = self.state();
            if state.generation != generation || state.phase != SessionPhase::Configuring {
                return;
            }
            state.session = None;
            self.set_phase(&mut state, SessionPhase::Open);
            state.frame_source.take()
        };
        self.fault(SessionFault::Configuration(reason));
        if let Some(session) = session {
            self.teardown_step("session", || session.close());
        }
        if let Some(target) = source {
            target.pool().close();
        }
    }

    fn close_device(&self) {
        let release = self.lock.release_on_drop(CLOSE_CAMERA);
        if let Err(e) = self.lock.acquire(CLOSE_CAMERA, self.config.lock_timeout()) {
            self.metrics.record_lock_timeout();
            warn!(error = %e, "closing without the lock, tearing down what exists");
        }

        let (session, source, device) = {
            let mut state = self.state();
            // Anything still in flight for this cycle is now stale.
            state.generation += 1;
            self.set_phase(&mut state, SessionPhase::Closing);
            (
                state.session.take(),
                state.frame_source.take(),
                state.device.take(),
            )
        };

        match &session {
            Some(session) => {
                self.teardown_step("stop repeating", || session.stop_repeating());
                self.teardown_step("session", || session.close());
            }
            None => debug!("session is null, not exec close"),
        }
        match source {
            Some(target) => {
                let discarded = target.pool().close();
                debug!(discarded, stats = ?target.pool().stats(), "frame source closed");
            }
            None => debug!("frame source is null, not exec close"),
        }
        match &device {
            Some(device) => self.teardown_step("device", || device.close()),
            None => debug!("device is null, not exec close"),
        }

        drop(release);
        let mut state = self.state();
        self.set_phase(&mut state, SessionPhase::Closed);
        drop(state);
        self.metrics.record_close();
        info!("camera closed");
    }

    /// Runs one close step. Failures are logged and never stop the sequence.
    fn teardown_step<F>(&self, step: &'static str, f: F)
    where
        F: FnOnce() -> Result<(), HardwareError>,
    {
        debug!(step, "close start");
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => debug!(step, "close complete"),
            Ok(Err(e)) => self.fault(SessionFault::Teardown {
                step,
                reason: e.to_string(),
            }),
            Err(_) => self.fault(SessionFault::Teardown {
                step,
                reason: "panicked".to_string(),
            }),
        }
    }

    // Callback context.

    pub(super) fn on_device_opened(self: &Arc<Self>, generation: u64, device: CameraHandle) {
        let mut state = self.state();
        if state.generation != generation || state.phase != SessionPhase::Opening {
            drop(state);
            warn!(device = device.id(), generation, "device opened after its open was abandoned, closing it");
            self.teardown_step("stale device", || device.close());
            return;
        }
        state.device = Some(Arc::clone(&device));
        self.set_phase(&mut state, SessionPhase::Open);
        drop(state);

        self.lock.release("open camera onOpened");
        info!(device = device.id(), generation, "camera opened");
        self.submit(START_PREVIEW, move |inner| inner.start_preview(Some(generation)));
    }

    pub(super) fn on_device_lost(self: &Arc<Self>, generation: u64, device: CameraHandle, reason: String) {
        let phase = {
            let mut state = self.state();
            if state.generation != generation {
                drop(state);
                warn!(device = device.id(), %reason, "device lost after its open was abandoned, closing it");
                self.teardown_step("stale device", || device.close());
                return;
            }
            let phase = state.phase;
            if phase == SessionPhase::Opening {
                self.set_phase(&mut state, SessionPhase::Closed);
            }
            phase
        };

        let fault = SessionFault::Device {
            device: device.id().to_string(),
            reason,
        };
        match phase {
            SessionPhase::Opening => {
                self.lock.release("open camera onError");
                self.teardown_step("failed device", || device.close());
                self.fault(fault);
            }
            p if p.holds_device() => {
                self.fault(fault);
                self.close_camera();
            }
            _ => {
                debug!(%phase, %fault, "device lost while no device is held, closing it");
                self.teardown_step("lost device", || device.close());
            }
        }
    }

    pub(super) fn on_session_configured(self: &Arc<Self>, generation: u64, session: SessionHandle) {
        let mut state = self.state();
        if state.generation != generation || state.phase != SessionPhase::Configuring {
            drop(state);
            warn!(generation, "session configured after it was abandoned, closing it");
            self.teardown_step("stale session", || session.close());
            return;
        }
        state.session = Some(session);
        drop(state);

        info!(generation, "capture session configured");
        self.submit(START_STREAMING, move |inner| inner.start_streaming(generation));
    }

    pub(super) fn on_configure_failed(&self, generation: u64) {
        self.abandon_configuration(
            generation,
            None,
            "hardware rejected the output configuration".to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{DeviceErrorCode, MockHardware, OpenOutcome};
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(3);

    fn controller(hw: &MockHardware) -> SessionController {
        let config = CaptureConfig::with_preview_size(PreviewSize::new(32, 24));
        SessionController::new(Arc::new(hw.clone()), config).unwrap()
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = CaptureConfig::default();
        config.buffer_depth = 0;
        let result = SessionController::new(Arc::new(MockHardware::new()), config);
        assert!(matches!(result, Err(ControllerError::Config(_))));
    }

    #[test]
    fn test_open_reaches_streaming() {
        let hw = MockHardware::new();
        let controller = controller(&hw);
        assert_eq!(controller.state(), SessionPhase::Closed);

        controller.open_camera(0).wait(WAIT).unwrap();
        assert!(controller.wait_for_state(SessionPhase::Streaming, WAIT));
        assert!(controller.has_device());
        assert!(controller.has_session());
        assert_eq!(controller.lock_permits(), 1);
        assert_eq!(hw.stats().open_devices, 1);

        controller.shutdown(WAIT).unwrap();
        assert_eq!(hw.stats().open_devices, 0);
        assert_eq!(hw.stats().live_sessions, 0);
    }

    #[test]
    fn test_second_open_is_rejected() {
        let hw = MockHardware::new();
        let controller = controller(&hw);
        controller.open_camera(0).wait(WAIT).unwrap();
        assert!(controller.wait_for_state(SessionPhase::Streaming, WAIT));

        let result = controller.open_camera(0).wait(WAIT);
        assert!(matches!(result, Err(ControllerError::AlreadyOpen(SessionPhase::Streaming))));
        assert_eq!(controller.lock_permits(), 1);
        assert_eq!(hw.stats().devices_created, 1);
    }

    #[test]
    fn test_unknown_device_returns_to_closed() {
        let hw = MockHardware::new();
        let controller = controller(&hw);

        controller.open_camera(7).wait(WAIT).unwrap();
        assert_eq!(controller.state(), SessionPhase::Closed);
        assert_eq!(controller.lock_permits(), 1);
        assert_eq!(controller.metrics().snapshot().device_faults, 1);
    }

    #[test]
    fn test_open_error_releases_lock() {
        let hw = MockHardware::new();
        hw.update_behavior(|b| b.open_outcome = OpenOutcome::Error(DeviceErrorCode::InUse));
        let controller = controller(&hw);

        controller.open_camera(0).wait(WAIT).unwrap();
        assert!(wait_until(WAIT, || controller.metrics().snapshot().device_faults == 1));
        assert_eq!(controller.state(), SessionPhase::Closed);
        assert_eq!(hw.stats().open_devices, 0);
        assert_eq!(controller.lock_permits(), 1);
        assert!(!controller.has_device());
    }

    #[test]
    fn test_late_open_after_close_is_closed() {
        let hw = MockHardware::new();
        hw.update_behavior(|b| b.open_outcome = OpenOutcome::Hang);
        let controller = controller(&hw);

        controller.open_camera(0).wait(WAIT).unwrap();
        assert_eq!(controller.state(), SessionPhase::Opening);
        assert_eq!(hw.pending_opens(), 1);

        // The open still holds the lock, so close proceeds after the timeout.
        let started = Instant::now();
        controller.close_camera().wait(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(2400));
        assert_eq!(controller.state(), SessionPhase::Closed);
        assert_eq!(controller.lock_permits(), 1);
        assert_eq!(controller.metrics().snapshot().lock_timeouts, 1);

        assert_eq!(hw.complete_pending_opens(), 1);
        assert!(wait_until(WAIT, || hw.stats().open_devices == 0));
        assert_eq!(controller.state(), SessionPhase::Closed);
        assert!(!controller.has_device());
    }

    #[test]
    fn test_close_cancels_queued_commands() {
        let hw = MockHardware::new();
        hw.update_behavior(|b| b.open_outcome = OpenOutcome::Hang);
        let controller = controller(&hw);
        controller.open_camera(0).wait(WAIT).unwrap();

        // Blocks the operation context on the lock held by the hanging open.
        let blocked = controller.open_camera(0);
        let queued = controller.start_preview();
        assert!(wait_until(WAIT, || controller.pending_operations() == 1));

        let close = controller.close_camera();
        assert!(matches!(
            queued.wait(Duration::ZERO),
            Err(ControllerError::Cancelled { .. })
        ));
        let err = blocked.wait(Duration::from_secs(5)).unwrap_err();
        assert!(err.is_timeout());

        close.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(controller.state(), SessionPhase::Closed);
        assert_eq!(controller.lock_permits(), 1);
        assert_eq!(controller.pending_operations(), 0);

        hw.complete_pending_opens();
        assert!(wait_until(WAIT, || hw.stats().open_devices == 0));
    }

    #[test]
    fn test_drop_closes_device() {
        let hw = MockHardware::new();
        let controller = controller(&hw);
        controller.open_camera(0).wait(WAIT).unwrap();
        assert!(controller.wait_for_state(SessionPhase::Streaming, WAIT));

        drop(controller);
        assert!(wait_until(WAIT, || hw.stats().open_devices == 0));
        assert!(wait_until(WAIT, || hw.stats().live_sessions == 0));
    }
}
