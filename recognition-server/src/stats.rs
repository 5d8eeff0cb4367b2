// 服务端统计
//
// Counters behind a plain mutex; every critical section is a few field
// updates, never held across an await.

use common::StatsPayload;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

/// Processing times kept for the rolling average
const STATS_WINDOW_SIZE: usize = 100;

struct Counters {
    started_at: Instant,
    connected_clients: u32,
    total_frames: u64,
    successes: u64,
    failures: u64,
    processing_times: VecDeque<Duration>,
}

impl Counters {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connected_clients: 0,
            total_frames: 0,
            successes: 0,
            failures: 0,
            processing_times: VecDeque::with_capacity(STATS_WINDOW_SIZE),
        }
    }
}

pub struct ServerStats {
    counters: Mutex<Counters>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn client_connected(&self) -> u32 {
        let mut counters = self.lock();
        counters.connected_clients += 1;
        counters.connected_clients
    }

    pub fn client_disconnected(&self) -> u32 {
        let mut counters = self.lock();
        counters.connected_clients = counters.connected_clients.saturating_sub(1);
        counters.connected_clients
    }

    pub fn record(&self, recognized: bool, processing_time: Duration) {
        let mut counters = self.lock();
        counters.total_frames += 1;
        if recognized {
            counters.successes += 1;
        } else {
            counters.failures += 1;
        }
        if counters.processing_times.len() == STATS_WINDOW_SIZE {
            counters.processing_times.pop_front();
        }
        counters.processing_times.push_back(processing_time);
    }

    /// Zeroes the frame counters and restarts the uptime clock. Connected
    /// clients are kept.
    pub fn reset(&self) {
        let mut counters = self.lock();
        counters.started_at = Instant::now();
        counters.total_frames = 0;
        counters.successes = 0;
        counters.failures = 0;
        counters.processing_times.clear();
        info!("📊 Stats reset");
    }

    pub fn snapshot(&self, current_provider: &str, available_providers: &[String]) -> StatsPayload {
        let counters = self.lock();
        let average = if counters.processing_times.is_empty() {
            0.0
        } else {
            let total: Duration = counters.processing_times.iter().sum();
            total.as_secs_f64() / counters.processing_times.len() as f64
        };

        StatsPayload {
            connected_clients: counters.connected_clients,
            total_frames_processed: counters.total_frames,
            successful_recognitions: counters.successes,
            failed_recognitions: counters.failures,
            average_processing_time: average,
            uptime_seconds: Some(counters.started_at.elapsed().as_secs_f64()),
            current_provider: Some(current_provider.to_string()),
            available_providers: Some(available_providers.to_vec()),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn providers() -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    #[test]
    fn test_snapshot_counts_frames() {
        let stats = ServerStats::new();
        stats.client_connected();
        stats.record(true, Duration::from_millis(100));
        stats.record(false, Duration::from_millis(300));

        let snapshot = stats.snapshot("A", &providers());
        assert_eq!(snapshot.connected_clients, 1);
        assert_eq!(snapshot.total_frames_processed, 2);
        assert_eq!(snapshot.successful_recognitions, 1);
        assert_eq!(snapshot.failed_recognitions, 1);
        assert!((snapshot.average_processing_time - 0.2).abs() < 1e-9);
        assert_eq!(snapshot.current_provider.as_deref(), Some("A"));
    }

    #[test]
    fn test_reset_keeps_clients() {
        let stats = ServerStats::new();
        stats.client_connected();
        stats.client_connected();
        stats.record(true, Duration::from_millis(50));
        stats.reset();

        let snapshot = stats.snapshot("A", &providers());
        assert_eq!(snapshot.total_frames_processed, 0);
        assert_eq!(snapshot.average_processing_time, 0.0);
        assert_eq!(snapshot.connected_clients, 2);

        assert_eq!(stats.client_disconnected(), 1);
        assert_eq!(stats.client_disconnected(), 0);
        assert_eq!(stats.client_disconnected(), 0);
    }

    #[test]
    fn test_reset_restarts_uptime() {
        let stats = ServerStats::new();
        std::thread::sleep(Duration::from_millis(30));
        let before = stats.snapshot("A", &providers()).uptime_seconds.unwrap();
        assert!(before >= 0.03);

        stats.reset();
        let after = stats.snapshot("A", &providers()).uptime_seconds.unwrap();
        assert!(after < before);
    }

    #[test]
    fn test_average_uses_recent_window() {
        let stats = ServerStats::new();
        for _ in 0..STATS_WINDOW_SIZE {
            stats.record(true, Duration::from_secs(1));
        }
        for _ in 0..STATS_WINDOW_SIZE {
            stats.record(true, Duration::from_millis(10));
        }
        let snapshot = stats.snapshot("A", &providers());
        assert!((snapshot.average_processing_time - 0.01).abs() < 1e-9);
        assert_eq!(snapshot.total_frames_processed, 2 * STATS_WINDOW_SIZE as u64);
    }

    proptest! {
        #[test]
        fn prop_successes_plus_failures_is_total(outcomes in proptest::collection::vec(any::<bool>(), 0..300)) {
            let stats = ServerStats::new();
            for recognized in &outcomes {
                stats.record(*recognized, Duration::from_millis(5));
            }
            let snapshot = stats.snapshot("A", &providers());
            prop_assert_eq!(snapshot.total_frames_processed, outcomes.len() as u64);
            prop_assert_eq!(
                snapshot.successful_recognitions + snapshot.failed_recognitions,
                snapshot.total_frames_processed
            );
        }
    }
}
