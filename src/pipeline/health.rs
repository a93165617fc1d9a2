//! Health monitoring and metrics for the streaming pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for a detection session
///
/// All fields use atomic operations so the scheduler, the transport tasks and
/// the event loop can record without locking.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    /// Frames handed to the transport
    pub frames_sent: AtomicU64,

    /// Total bytes of frame data handed to the transport
    pub bytes_sent: AtomicU64,

    /// Ticks skipped because the connection or session was not ready
    pub ticks_not_ready: AtomicU64,

    /// Ticks skipped because the previous frame was still in flight
    pub ticks_in_flight: AtomicU64,

    /// Frames that failed to capture, encode, or send
    pub frame_failures: AtomicU64,

    /// Inbound messages parsed successfully
    pub messages_received: AtomicU64,

    /// Inbound messages dropped as malformed
    pub malformed_messages: AtomicU64,

    /// Transport errors
    pub network_errors: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame handed to the transport
    pub fn record_frame_sent(&self, size: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_tick_not_ready(&self) {
        self.ticks_not_ready.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick_in_flight(&self) {
        self.ticks_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_failure(&self) {
        self.frame_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Ticks that did not produce a frame
    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_not_ready.load(Ordering::Relaxed) + self.ticks_in_flight.load(Ordering::Relaxed)
    }

    /// Calculate the share of ticks that were skipped, as a percentage
    pub fn skip_rate(&self) -> f64 {
        let skipped = self.ticks_skipped();
        let total = skipped + self.frames_sent();
        if total == 0 {
            return 0.0;
        }
        (skipped as f64 / total as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_sent: self.frames_sent(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            ticks_not_ready: self.ticks_not_ready.load(Ordering::Relaxed),
            ticks_in_flight: self.ticks_in_flight.load(Ordering::Relaxed),
            frame_failures: self.frame_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            skip_rate: self.skip_rate(),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSummary {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub ticks_not_ready: u64,
    pub ticks_in_flight: u64,
    pub frame_failures: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub network_errors: u64,
    pub skip_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames sent ({} bytes), {} ticks skipped ({} not ready, {} in flight, {:.2}%), {} frame failures, {} messages ({} malformed), {} network errors",
            self.frames_sent,
            self.bytes_sent,
            self.ticks_not_ready + self.ticks_in_flight,
            self.ticks_not_ready,
            self.ticks_in_flight,
            self.skip_rate,
            self.frame_failures,
            self.messages_received,
            self.malformed_messages,
            self.network_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = PipelineHealth::new();

        health.record_frame_sent(1000);
        health.record_frame_sent(2000);
        health.record_frame_sent(1500);

        assert_eq!(health.frames_sent(), 3);
        assert_eq!(health.summary().bytes_sent, 4500);
        assert_eq!(health.ticks_skipped(), 0);
        assert_eq!(health.skip_rate(), 0.0);

        health.record_tick_in_flight();
        health.record_tick_not_ready();

        assert_eq!(health.ticks_skipped(), 2);
        assert!((health.skip_rate() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_display() {
        let health = PipelineHealth::new();
        health.record_message();
        health.record_malformed();
        let line = health.summary().to_string();
        assert!(line.contains("1 messages (1 malformed)"));
    }
}
