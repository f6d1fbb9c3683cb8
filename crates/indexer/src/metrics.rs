use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

const NONE: u64 = u64::MAX;

/// Counts from one committed batch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchTally {
    pub blocks: u64,
    pub stake_blocks: u64,
    /// Newly written events.
    pub events: u64,
    /// Events whose key was already present.
    pub duplicates: u64,
    pub anomalies: u64,
    pub skipped: u64,
}

/// Per-job progress counters. Written by the scan owner, read by anyone.
pub struct ScanProgress {
    started: Mutex<Option<Instant>>,
    first_height: AtomicU64,
    blocks_scanned: AtomicU64,
    stake_blocks: AtomicU64,
    events_found: AtomicU64,
    events_duplicate: AtomicU64,
    anomalies: AtomicU64,
    skipped_heights: AtomicU64,
    last_checkpoint: AtomicU64,
    target_height: AtomicU64,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            started: Mutex::new(None),
            first_height: AtomicU64::new(NONE),
            blocks_scanned: AtomicU64::new(0),
            stake_blocks: AtomicU64::new(0),
            events_found: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            skipped_heights: AtomicU64::new(0),
            last_checkpoint: AtomicU64::new(NONE),
            target_height: AtomicU64::new(NONE),
        }
    }
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self, resume_height: u32) {
        if let Ok(mut started) = self.started.lock() {
            started.get_or_insert_with(Instant::now);
        }
        let _ = self.first_height.compare_exchange(
            NONE,
            u64::from(resume_height),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn set_target(&self, height: u32) {
        self.target_height
            .store(u64::from(height), Ordering::Relaxed);
    }

    pub fn set_checkpoint(&self, height: u32) {
        self.last_checkpoint
            .store(u64::from(height), Ordering::Relaxed);
    }

    pub fn record_batch(&self, tally: &BatchTally) {
        self.blocks_scanned
            .fetch_add(tally.blocks, Ordering::Relaxed);
        self.stake_blocks
            .fetch_add(tally.stake_blocks, Ordering::Relaxed);
        self.events_found
            .fetch_add(tally.events, Ordering::Relaxed);
        self.events_duplicate
            .fetch_add(tally.duplicates, Ordering::Relaxed);
        self.anomalies
            .fetch_add(tally.anomalies, Ordering::Relaxed);
        self.skipped_heights
            .fetch_add(tally.skipped, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self
            .started
            .lock()
            .ok()
            .and_then(|started| started.map(|at| at.elapsed()))
            .unwrap_or(Duration::ZERO);
        let blocks_scanned = self.blocks_scanned.load(Ordering::Relaxed);
        let last_checkpoint = load_opt(&self.last_checkpoint);
        let target_height = load_opt(&self.target_height);
        let secs = elapsed.as_secs_f64();
        let blocks_per_sec = if secs > 0.0 {
            blocks_scanned as f64 / secs
        } else {
            0.0
        };
        let remaining = match (target_height, last_checkpoint, load_opt(&self.first_height)) {
            (Some(target), Some(done), _) => target.saturating_sub(done),
            (Some(target), None, Some(first)) => (target + 1).saturating_sub(first),
            _ => 0,
        };
        let eta_secs = (blocks_per_sec > 0.0 && remaining > 0)
            .then(|| (remaining as f64 / blocks_per_sec).ceil() as u64);
        ProgressSnapshot {
            blocks_scanned,
            stake_blocks: self.stake_blocks.load(Ordering::Relaxed),
            events_found: self.events_found.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            skipped_heights: self.skipped_heights.load(Ordering::Relaxed),
            last_checkpoint,
            target_height,
            elapsed_secs: elapsed.as_secs(),
            blocks_per_sec,
            eta_secs,
        }
    }
}

fn load_opt(value: &AtomicU64) -> Option<u64> {
    match value.load(Ordering::Relaxed) {
        NONE => None,
        value => Some(value),
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub blocks_scanned: u64,
    pub stake_blocks: u64,
    pub events_found: u64,
    pub events_duplicate: u64,
    pub anomalies: u64,
    pub skipped_heights: u64,
    pub last_checkpoint: Option<u64>,
    pub target_height: Option<u64>,
    pub elapsed_secs: u64,
    pub blocks_per_sec: f64,
    pub eta_secs: Option<u64>,
}

#[derive(Default)]
pub struct RpcMetrics {
    requests: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    in_flight_high_water: AtomicU64,
    latency_us: AtomicU64,
}

impl RpcMetrics {
    pub fn record_request(&self, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_in_flight(&self, in_flight: u64) {
        self.in_flight_high_water
            .fetch_max(in_flight, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RpcMetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let latency_us = self.latency_us.load(Ordering::Relaxed);
        RpcMetricsSnapshot {
            requests,
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            in_flight_high_water: self.in_flight_high_water.load(Ordering::Relaxed),
            avg_latency_ms: if requests == 0 {
                0.0
            } else {
                latency_us as f64 / requests as f64 / 1000.0
            },
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMetricsSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub retries: u64,
    pub in_flight_high_water: u64,
    pub avg_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_before_start_is_empty() {
        let progress = ScanProgress::new();
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.blocks_scanned, 0);
        assert_eq!(snapshot.last_checkpoint, None);
        assert_eq!(snapshot.eta_secs, None);
    }

    #[test]
    fn batches_accumulate() {
        let progress = ScanProgress::new();
        progress.mark_started(100);
        progress.set_target(199);
        progress.record_batch(&BatchTally {
            blocks: 50,
            stake_blocks: 20,
            events: 18,
            duplicates: 2,
            anomalies: 1,
            skipped: 0,
        });
        progress.set_checkpoint(149);
        progress.record_batch(&BatchTally {
            blocks: 50,
            stake_blocks: 25,
            events: 25,
            skipped: 1,
            ..BatchTally::default()
        });
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.blocks_scanned, 100);
        assert_eq!(snapshot.stake_blocks, 45);
        assert_eq!(snapshot.events_found, 43);
        assert_eq!(snapshot.events_duplicate, 2);
        assert_eq!(snapshot.skipped_heights, 1);
        assert_eq!(snapshot.last_checkpoint, Some(149));
        assert_eq!(snapshot.target_height, Some(199));
    }

    #[test]
    fn rpc_high_water_keeps_max() {
        let metrics = RpcMetrics::default();
        metrics.observe_in_flight(3);
        metrics.observe_in_flight(1);
        assert_eq!(metrics.snapshot().in_flight_high_water, 3);
    }
}
