//! Upload progress accounting
//!
//! Observational only: nothing here influences what gets sent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Point-in-time view of an upload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Bytes the server has admitted, including those admitted before
    /// this run started
    pub bytes_confirmed: u64,
    pub total_bytes: u64,
    /// 0.0 ..= 100.0
    pub percent: f64,
    /// Bytes per second confirmed during this run
    pub throughput: f64,
    /// Remaining time at the current throughput, unknown until something moved
    pub eta: Option<Duration>,
}

/// Called after every confirmed chunk
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

struct TrackerState {
    confirmed: u64,
    /// Confirmed when dispatch started; excluded from throughput
    baseline: u64,
    started: Instant,
}

/// Tracks confirmed bytes against wall-clock time
pub struct ProgressTracker {
    total: u64,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(total: u64, already_confirmed: u64) -> Self {
        Self {
            total,
            state: Mutex::new(TrackerState {
                confirmed: already_confirmed,
                baseline: already_confirmed,
                started: Instant::now(),
            }),
        }
    }

    /// Record `bytes` more as confirmed
    pub fn confirm(&self, bytes: u64) -> ProgressSnapshot {
        let mut state = self.state.lock();
        state.confirmed = (state.confirmed + bytes).min(self.total);
        self.snapshot_of(&state, Instant::now())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        self.snapshot_of(&state, Instant::now())
    }

    fn snapshot_of(&self, state: &TrackerState, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(state.started).as_secs_f64();
        let moved = state.confirmed.saturating_sub(state.baseline);
        let throughput = if elapsed > 0.0 { moved as f64 / elapsed } else { 0.0 };

        let remaining = self.total.saturating_sub(state.confirmed);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if throughput > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / throughput))
        } else {
            None
        };

        let percent = if self.total == 0 {
            100.0
        } else {
            state.confirmed as f64 * 100.0 / self.total as f64
        };

        ProgressSnapshot {
            bytes_confirmed: state.confirmed,
            total_bytes: self.total,
            percent,
            throughput,
            eta,
        }
    }
}
