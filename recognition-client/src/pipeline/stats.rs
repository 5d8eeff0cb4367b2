use common::StatsPayload;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Server-reported throughput counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunningStats {
    pub frames_processed: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Duration,
    pub connected_clients: u32,
}

impl From<&StatsPayload> for RunningStats {
    fn from(payload: &StatsPayload) -> Self {
        let average = if payload.average_processing_time.is_finite() {
            payload.average_processing_time.max(0.0)
        } else {
            0.0
        };
        Self {
            frames_processed: payload.total_frames_processed,
            successes: payload.successful_recognitions,
            failures: payload.failed_recognitions,
            average_latency: Duration::from_secs_f64(average),
            connected_clients: payload.connected_clients,
        }
    }
}

/// Holds the latest authoritative counters.
///
/// The client never counts on its own: dropped and expired frames would
/// make a local tally drift from what the backend actually processed.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    current: RunningStats,
    reset_pending: bool,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_snapshot(&mut self, snapshot: RunningStats) {
        if self.reset_pending {
            info!(
                "📊 Stats reset acknowledged ({} frames processed since)",
                snapshot.frames_processed
            );
            self.reset_pending = false;
        } else if snapshot.frames_processed < self.current.frames_processed {
            debug!(
                "Server counters went back from {} to {} frames",
                self.current.frames_processed, snapshot.frames_processed
            );
        }
        self.current = snapshot;
    }

    /// `successes / frames_processed`, or 0 before anything was processed.
    pub fn success_ratio(&self) -> f64 {
        success_ratio(&self.current)
    }

    /// Marks a reset as requested. Counters stay as they are until the
    /// backend answers with a fresh snapshot.
    pub fn request_reset(&mut self) {
        self.reset_pending = true;
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    pub fn current(&self) -> &RunningStats {
        &self.current
    }
}

pub fn success_ratio(stats: &RunningStats) -> f64 {
    if stats.frames_processed == 0 {
        return 0.0;
    }
    (stats.successes as f64 / stats.frames_processed as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(frames: u64, successes: u64) -> RunningStats {
        RunningStats {
            frames_processed: frames,
            successes,
            failures: frames.saturating_sub(successes),
            average_latency: Duration::from_millis(40),
            connected_clients: 1,
        }
    }

    #[test]
    fn test_ratio_is_zero_without_frames() {
        let aggregator = StatsAggregator::new();
        assert_eq!(aggregator.success_ratio(), 0.0);
    }

    #[test]
    fn test_snapshot_replaces_counters() {
        let mut aggregator = StatsAggregator::new();
        aggregator.apply_snapshot(snapshot(10, 4));
        aggregator.apply_snapshot(snapshot(12, 6));
        assert_eq!(aggregator.current().frames_processed, 12);
        assert_eq!(aggregator.success_ratio(), 0.5);
    }

    #[test]
    fn test_reset_waits_for_acknowledgement() {
        let mut aggregator = StatsAggregator::new();
        aggregator.apply_snapshot(snapshot(10, 4));

        aggregator.request_reset();
        assert!(aggregator.reset_pending());
        assert_eq!(aggregator.current().frames_processed, 10);

        aggregator.apply_snapshot(snapshot(0, 0));
        assert!(!aggregator.reset_pending());
        assert_eq!(aggregator.current(), &snapshot(0, 0));
    }

    #[test]
    fn test_payload_conversion_uses_seconds() {
        let payload = StatsPayload {
            connected_clients: 2,
            total_frames_processed: 8,
            successful_recognitions: 6,
            failed_recognitions: 2,
            average_processing_time: 0.125,
            ..Default::default()
        };
        let stats = RunningStats::from(&payload);
        assert_eq!(stats.average_latency, Duration::from_millis(125));
        assert_eq!(stats.successes, 6);

        let broken = StatsPayload {
            average_processing_time: f64::NAN,
            ..payload
        };
        assert_eq!(RunningStats::from(&broken).average_latency, Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_ratio_within_unit_interval(frames in 0u64..10_000, successes in 0u64..20_000) {
            let ratio = success_ratio(&snapshot(frames, successes));
            prop_assert!((0.0..=1.0).contains(&ratio));
            prop_assert_eq!(ratio == 0.0, frames == 0 || successes == 0);
        }
    }
}
