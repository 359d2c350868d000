//! Metrics collection and registry.

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registering or encoding a collector failed.
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Open attempts that reached the hardware.
    pub open_attempts: u64,
    /// Lock acquisitions that timed out.
    pub lock_timeouts: u64,
    /// Completed close sequences.
    pub closes: u64,
    /// Frames delivered to subscribers.
    pub frames_delivered: u64,
    /// Frames discarded for carrying the wrong pixel format.
    pub frames_rejected: u64,
    /// Subscriber calls that failed or panicked.
    pub subscriber_failures: u64,
    /// Device faults absorbed by the controller.
    pub device_faults: u64,
    /// Configuration faults absorbed by the controller.
    pub configuration_faults: u64,
    /// Teardown steps that failed.
    pub teardown_faults: u64,
    /// Numeric code of the current session phase.
    pub phase: i64,
    /// Registered frame subscribers.
    pub subscribers: i64,
    /// Latency of the most recent first frame, in seconds.
    pub first_frame_latency_seconds: f64,
}

/// Prometheus registry for one session controller.
pub struct SessionMetrics {
    registry: Registry,

    // Lifecycle metrics
    open_attempts: IntCounter,
    lock_timeouts: IntCounter,
    closes: IntCounter,
    faults: IntCounterVec,
    phase: IntGauge,

    // Frame metrics
    frames_delivered: IntCounter,
    frames_rejected: IntCounter,
    subscriber_failures: IntCounter,
    subscribers: IntGauge,
    first_frame_latency: Gauge,
}

impl SessionMetrics {
    /// Creates a registry with all session metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let open_attempts = IntCounter::new(
            "camera_core_open_attempts_total",
            "Open requests issued to the hardware",
        )?;
        let lock_timeouts = IntCounter::new(
            "camera_core_lock_timeouts_total",
            "Open/close lock acquisitions that timed out",
        )?;
        let closes = IntCounter::new(
            "camera_core_closes_total",
            "Completed close sequences",
        )?;
        let faults = IntCounterVec::new(
            Opts::new(
                "camera_core_faults_total",
                "Faults absorbed by the session controller",
            ),
            &["kind"],
        )?;
        let phase = IntGauge::new(
            "camera_core_session_phase",
            "Current session phase (0=closed 1=opening 2=open 3=configuring 4=streaming 5=closing)",
        )?;

        let frames_delivered = IntCounter::new(
            "camera_core_frames_delivered_total",
            "Frames fanned out to subscribers",
        )?;
        let frames_rejected = IntCounter::new(
            "camera_core_frames_rejected_total",
            "Frames discarded for an unexpected pixel format",
        )?;
        let subscriber_failures = IntCounter::new(
            "camera_core_subscriber_failures_total",
            "Subscriber calls that returned an error or panicked",
        )?;
        let subscribers = IntGauge::new(
            "camera_core_subscribers",
            "Registered frame subscribers",
        )?;
        let first_frame_latency = Gauge::new(
            "camera_core_first_frame_latency_seconds",
            "Time from starting the repeating request to the first delivered frame",
        )?;

        registry.register(Box::new(open_attempts.clone()))?;
        registry.register(Box::new(lock_timeouts.clone()))?;
        registry.register(Box::new(closes.clone()))?;
        registry.register(Box::new(faults.clone()))?;
        registry.register(Box::new(phase.clone()))?;
        registry.register(Box::new(frames_delivered.clone()))?;
        registry.register(Box::new(frames_rejected.clone()))?;
        registry.register(Box::new(subscriber_failures.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(first_frame_latency.clone()))?;

        Ok(Self {
            registry,
            open_attempts,
            lock_timeouts,
            closes,
            faults,
            phase,
            frames_delivered,
            frames_rejected,
            subscriber_failures,
            subscribers,
            first_frame_latency,
        })
    }

    /// Counts one open command that reached the hardware.
    pub fn record_open_attempt(&self) {
        self.open_attempts.inc();
    }

    /// Counts a permit wait that timed out.
    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.inc();
    }

    /// Counts one completed close.
    pub fn record_close(&self) {
        self.closes.inc();
    }

    /// Counts an absorbed fault under its kind label.
    pub fn record_fault(&self, kind: &str) {
        self.faults.with_label_values(&[kind]).inc();
    }

    /// Publishes the phase code.
    pub fn set_phase(&self, code: i64) {
        self.phase.set(code);
    }

    /// Counts a frame handed to subscribers.
    pub fn record_frame_delivered(&self) {
        self.frames_delivered.inc();
    }

    /// Counts a frame released for its format.
    pub fn record_frame_rejected(&self) {
        self.frames_rejected.inc();
    }

    /// Counts one failed or panicked subscriber call.
    pub fn record_subscriber_failure(&self) {
        self.subscriber_failures.inc();
    }

    /// Publishes the subscriber count.
    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.set(count as i64);
    }

    /// Latency from streaming start to the first frame.
    pub fn record_first_frame(&self, latency: Duration) {
        self.first_frame_latency.set(latency.as_secs_f64());
    }

    /// Reads every metric into a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let fault = |kind: &str| self.faults.with_label_values(&[kind]).get();
        MetricsSnapshot {
            open_attempts: self.open_attempts.get(),
            lock_timeouts: self.lock_timeouts.get(),
            closes: self.closes.get(),
            frames_delivered: self.frames_delivered.get(),
            frames_rejected: self.frames_rejected.get(),
            subscriber_failures: self.subscriber_failures.get(),
            device_faults: fault("device"),
            configuration_faults: fault("configuration"),
            teardown_faults: fault("teardown"),
            phase: self.phase.get(),
            subscribers: self.subscribers.get(),
            first_frame_latency_seconds: self.first_frame_latency.get(),
        }
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for SessionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let metrics = SessionMetrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_counters_update_snapshot() {
        let metrics = SessionMetrics::new().unwrap();
        metrics.record_open_attempt();
        metrics.record_lock_timeout();
        metrics.record_fault("teardown");
        metrics.record_fault("teardown");
        metrics.record_frame_delivered();
        metrics.set_phase(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.open_attempts, 1);
        assert_eq!(snapshot.lock_timeouts, 1);
        assert_eq!(snapshot.teardown_faults, 2);
        assert_eq!(snapshot.device_faults, 0);
        assert_eq!(snapshot.frames_delivered, 1);
        assert_eq!(snapshot.phase, 4);
    }

    #[test]
    fn test_metrics_encode() {
        let metrics = SessionMetrics::new().unwrap();
        metrics.record_fault("device");
        metrics.set_subscribers(2);
        let output = metrics.encode().unwrap();

        assert!(output.contains("camera_core_open_attempts_total 0"));
        assert!(output.contains("camera_core_faults_total{kind=\"device\"} 1"));
        assert!(output.contains("camera_core_subscribers 2"));
    }
}
