//! In-process hardware that behaves like an asynchronous camera stack.
//!
//! Callbacks are delivered from short-lived threads after a configurable
//! latency, and a producer thread renders synthetic frames while a
//! repeating request is active. Counters record how many devices and
//! sessions are alive so leaks show up in tests.

use super::api::{
    CameraDevice, CameraHandle, CaptureCallback, CaptureFailureReason, CaptureRequest,
    CaptureSession, DeviceErrorCode, DeviceStateCallback, HardwareCameraApi, HardwareError,
    OutputConfiguration, OutputTarget, RequestTemplate, SessionStateCallback,
};
use crate::capture::{PixelFormat, RawFrame};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What happens when a device is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The device opens after the configured latency.
    Open,
    /// The device reports an error instead of opening.
    Error(DeviceErrorCode),
    /// The device disconnects instead of opening.
    Disconnect,
    /// No callback is delivered until [`MockHardware::complete_pending_opens`].
    Hang,
    /// `open` fails synchronously.
    Reject(HardwareError),
}

/// Tunable behaviour of [`MockHardware`].
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Outcome of the next open calls.
    pub open_outcome: OpenOutcome,
    /// Delay before the open callback.
    pub open_latency: Duration,
    /// Delay before the session configuration callback.
    pub configure_latency: Duration,
    /// Interval between produced frames.
    pub frame_interval: Duration,
    /// Format stamped on produced frames; `None` uses the output's format.
    pub frame_format: Option<PixelFormat>,
    /// Report a capture failure every N frames.
    pub capture_failure_every: Option<u64>,
    /// Make `stop_repeating` fail.
    pub fail_stop_repeating: bool,
    /// Make session `close` fail.
    pub fail_session_close: bool,
    /// Make device `close` fail.
    pub fail_device_close: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            open_outcome: OpenOutcome::Open,
            open_latency: Duration::from_millis(5),
            configure_latency: Duration::from_millis(5),
            frame_interval: Duration::from_millis(10),
            frame_format: None,
            capture_failure_every: None,
            fail_stop_repeating: false,
            fail_session_close: false,
            fail_device_close: false,
        }
    }
}

/// Snapshot of the mock's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    /// Devices created and not yet closed.
    pub open_devices: usize,
    /// Highest number of simultaneously open devices.
    pub peak_open_devices: usize,
    /// Devices ever created.
    pub devices_created: u64,
    /// Sessions configured and not yet closed.
    pub live_sessions: usize,
    /// Session configuration attempts.
    pub configure_attempts: u64,
    /// Frames rendered into output targets.
    pub frames_produced: u64,
}

#[derive(Debug, Default)]
struct Tracker {
    open_devices: AtomicUsize,
    peak_open_devices: AtomicUsize,
    devices_created: AtomicU64,
    live_sessions: AtomicUsize,
    configure_attempts: AtomicU64,
    frames_produced: AtomicU64,
}

type PendingOpen = (String, Arc<dyn DeviceStateCallback>);

struct MockInner {
    devices: Vec<String>,
    behavior: Mutex<MockBehavior>,
    configure_failures: AtomicU32,
    tracker: Tracker,
    pending_opens: Mutex<Vec<PendingOpen>>,
    current: Mutex<Option<(Arc<MockDevice>, Arc<dyn DeviceStateCallback>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockInner {
    fn behavior(&self) -> MockBehavior {
        lock(&self.behavior).clone()
    }

    fn create_device(self: &Arc<Self>, id: &str, callback: Arc<dyn DeviceStateCallback>) -> Arc<MockDevice> {
        let open = self.tracker.open_devices.fetch_add(1, Ordering::AcqRel) + 1;
        self.tracker
            .peak_open_devices
            .fetch_max(open, Ordering::AcqRel);
        self.tracker.devices_created.fetch_add(1, Ordering::AcqRel);

        let device = Arc::new_cyclic(|this| MockDevice {
            id: id.to_string(),
            hw: Arc::clone(self),
            this: this.clone(),
            callback: Arc::clone(&callback),
            closed: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
        });
        *lock(&self.current) = Some((Arc::clone(&device), callback));
        device
    }

    fn deliver_open(self: &Arc<Self>, id: String, callback: Arc<dyn DeviceStateCallback>, outcome: OpenOutcome) {
        let device = self.create_device(&id, Arc::clone(&callback));
        match outcome {
            OpenOutcome::Error(code) => callback.on_error(device, code),
            OpenOutcome::Disconnect => callback.on_disconnected(device),
            _ => callback.on_opened(device),
        }
    }
}

/// Spawns a callback thread that runs `f` after `delay`.
fn deliver_later<F>(delay: Duration, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name("mock-hal-callback".to_string())
        .spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            f();
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to spawn mock callback thread");
    }
}

/// Mock implementation of [`HardwareCameraApi`].
#[derive(Clone)]
pub struct MockHardware {
    inner: Arc<MockInner>,
}

impl MockHardware {
    /// Creates a mock exposing a single device with id `"0"`.
    pub fn new() -> Self {
        Self::with_devices(["0"])
    }

    /// Creates a mock exposing the given device ids.
    pub fn with_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(MockInner {
                devices: devices.into_iter().map(Into::into).collect(),
                behavior: Mutex::new(MockBehavior::default()),
                configure_failures: AtomicU32::new(0),
                tracker: Tracker::default(),
                pending_opens: Mutex::new(Vec::new()),
                current: Mutex::new(None),
            }),
        }
    }

    /// Replaces the behaviour for subsequent calls.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.inner.behavior) = behavior;
    }

    /// Edits the behaviour in place.
    pub fn update_behavior(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut lock(&self.inner.behavior));
    }

    /// Makes the next `count` session configurations fail.
    pub fn fail_next_configurations(&self, count: u32) {
        self.inner.configure_failures.store(count, Ordering::Release);
    }

    /// Delivers `on_opened` for every open left hanging by [`OpenOutcome::Hang`].
    pub fn complete_pending_opens(&self) -> usize {
        let pending = std::mem::take(&mut *lock(&self.inner.pending_opens));
        let count = pending.len();
        for (id, callback) in pending {
            self.inner.deliver_open(id, callback, OpenOutcome::Open);
        }
        count
    }

    /// Number of opens waiting for [`MockHardware::complete_pending_opens`].
    pub fn pending_opens(&self) -> usize {
        lock(&self.inner.pending_opens).len()
    }

    /// Reports a disconnect for the most recently opened device, if it is
    /// still open. Returns true if a callback was delivered.
    pub fn disconnect_current(&self) -> bool {
        let current = lock(&self.inner.current).clone();
        match current {
            Some((device, callback)) if !device.closed.load(Ordering::Acquire) => {
                let handle: CameraHandle = device;
                callback.on_disconnected(handle);
                true
            }
            _ => false,
        }
    }

    /// Returns the lifetime counters.
    pub fn stats(&self) -> MockStats {
        let t = &self.inner.tracker;
        MockStats {
            open_devices: t.open_devices.load(Ordering::Acquire),
            peak_open_devices: t.peak_open_devices.load(Ordering::Acquire),
            devices_created: t.devices_created.load(Ordering::Acquire),
            live_sessions: t.live_sessions.load(Ordering::Acquire),
            configure_attempts: t.configure_attempts.load(Ordering::Acquire),
            frames_produced: t.frames_produced.load(Ordering::Acquire),
        }
    }
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareCameraApi for MockHardware {
    fn open(
        &self,
        device_id: &str,
        callback: Arc<dyn DeviceStateCallback>,
    ) -> Result<(), HardwareError> {
        if !self.inner.devices.iter().any(|d| d == device_id) {
            return Err(HardwareError::DeviceNotFound(device_id.to_string()));
        }

        let behavior = self.inner.behavior();
        tracing::debug!(device = device_id, outcome = ?behavior.open_outcome, "mock open");
        match behavior.open_outcome {
            OpenOutcome::Reject(err) => Err(err),
            OpenOutcome::Hang => {
                lock(&self.inner.pending_opens).push((device_id.to_string(), callback));
                Ok(())
            }
            outcome => {
                let inner = Arc::clone(&self.inner);
                let id = device_id.to_string();
                deliver_later(behavior.open_latency, move || {
                    inner.deliver_open(id, callback, outcome);
                });
                Ok(())
            }
        }
    }
}

struct MockDevice {
    id: String,
    hw: Arc<MockInner>,
    this: Weak<MockDevice>,
    callback: Arc<dyn DeviceStateCallback>,
    closed: AtomicBool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl CameraDevice for MockDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_capture_session(
        &self,
        output: OutputConfiguration,
        callback: Arc<dyn SessionStateCallback>,
    ) -> Result<(), HardwareError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HardwareError::InvalidState(format!("device {} is closed", self.id)));
        }
        self.hw
            .tracker
            .configure_attempts
            .fetch_add(1, Ordering::AcqRel);

        let behavior = self.hw.behavior();
        let device = self.this.clone();
        deliver_later(behavior.configure_latency, move || {
            let Some(device) = device.upgrade() else {
                callback.on_configure_failed();
                return;
            };
            if device.closed.load(Ordering::Acquire) {
                callback.on_configure_failed();
                return;
            }
            let fail = device
                .hw
                .configure_failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                callback.on_configure_failed();
                return;
            }

            let session = Arc::new(MockSession {
                hw: Arc::clone(&device.hw),
                output,
                closed: AtomicBool::new(false),
                producer: Mutex::new(None),
            });
            device.hw.tracker.live_sessions.fetch_add(1, Ordering::AcqRel);
            lock(&device.sessions).push(Arc::clone(&session));
            callback.on_configured(session);
        });
        Ok(())
    }

    fn create_capture_request(
        &self,
        template: RequestTemplate,
    ) -> Result<CaptureRequest, HardwareError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HardwareError::InvalidState(format!("device {} is closed", self.id)));
        }
        Ok(CaptureRequest::new(template))
    }

    fn close(&self) -> Result<(), HardwareError> {
        if self.hw.behavior().fail_device_close {
            return Err(HardwareError::Failed(format!("close device {}", self.id)));
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let sessions = std::mem::take(&mut *lock(&self.sessions));
        for session in sessions {
            session.release();
        }
        self.hw.tracker.open_devices.fetch_sub(1, Ordering::AcqRel);

        let callback = Arc::clone(&self.callback);
        let id = self.id.clone();
        deliver_later(Duration::ZERO, move || callback.on_closed(&id));
        Ok(())
    }
}

struct Producer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Producer {
    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            tracing::error!("mock frame producer panicked");
        }
    }
}

struct MockSession {
    hw: Arc<MockInner>,
    output: OutputConfiguration,
    closed: AtomicBool,
    producer: Mutex<Option<Producer>>,
}

impl MockSession {
    fn stop_producer(&self) {
        let producer = lock(&self.producer).take();
        if let Some(producer) = producer {
            producer.stop();
        }
    }

    /// Stops streaming and marks the session closed. Idempotent.
    fn release(&self) {
        self.stop_producer();
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hw.tracker.live_sessions.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl CaptureSession for MockSession {
    fn set_repeating_request(
        &self,
        request: CaptureRequest,
        callback: Arc<dyn CaptureCallback>,
    ) -> Result<(), HardwareError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HardwareError::InvalidState("session is closed".to_string()));
        }
        let targets: Vec<OutputTarget> = request.targets().to_vec();
        if targets.is_empty() {
            return Err(HardwareError::InvalidState(
                "request has no output targets".to_string(),
            ));
        }
        self.stop_producer();

        let behavior = self.hw.behavior();
        let format = behavior.frame_format.unwrap_or(self.output.format);
        let size = self.output.size;
        let len = format
            .frame_len(size.width, size.height)
            .unwrap_or_else(|| size.area());
        let hw = Arc::clone(&self.hw);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("mock-hal-producer".to_string())
            .spawn(move || {
                let mut sequence = 0u64;
                while !stop_flag.load(Ordering::Acquire) {
                    thread::sleep(behavior.frame_interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    sequence += 1;
                    let frame = RawFrame::new(
                        vec![(sequence % 256) as u8; len],
                        size.width,
                        size.height,
                        format,
                        sequence,
                    );
                    for target in &targets {
                        target.publish(frame.clone());
                    }
                    hw.tracker.frames_produced.fetch_add(1, Ordering::AcqRel);
                    callback.on_capture_completed(sequence);
                    if let Some(every) = behavior.capture_failure_every {
                        if every > 0 && sequence % every == 0 {
                            callback.on_capture_failed(sequence, CaptureFailureReason::Error);
                        }
                    }
                }
            })
            .map_err(|e| HardwareError::Failed(format!("spawn producer: {}", e)))?;

        *lock(&self.producer) = Some(Producer { stop, handle });
        Ok(())
    }

    fn stop_repeating(&self) -> Result<(), HardwareError> {
        if self.hw.behavior().fail_stop_repeating {
            return Err(HardwareError::Failed("stop repeating".to_string()));
        }
        self.stop_producer();
        Ok(())
    }

    fn close(&self) -> Result<(), HardwareError> {
        if self.hw.behavior().fail_session_close {
            return Err(HardwareError::Failed("close session".to_string()));
        }
        self.release();
        Ok(())
    }
}
