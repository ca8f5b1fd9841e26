//! Polling statistics, global and per slave.
//!
//! Raw counters only: requests, failures, and the accumulated response time.
//! Success counts and mean response times are derived on read, so recording
//! is a handful of additions under the lock.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Per-slave request accounting.
#[derive(Debug, Clone, Default)]
pub struct SlaveCounters {
    pub requests: u64,
    pub failures: u64,
    /// Sum of response times across all requests, failed ones included
    pub response_time_sum_ms: f64,
    pub last_error: Option<String>,
}

impl SlaveCounters {
    pub fn successes(&self) -> u64 {
        self.requests - self.failures
    }

    pub fn mean_response_ms(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.response_time_sum_ms / self.requests as f64
    }
}

/// Global counters plus the per-slave map.
#[derive(Debug, Clone, Default)]
pub struct PollingStatsSnapshot {
    pub polls: u64,
    pub failed_polls: u64,
    pub slave_stats: HashMap<u8, SlaveCounters>,
}

impl PollingStatsSnapshot {
    pub fn successful_polls(&self) -> u64 {
        self.polls - self.failed_polls
    }
}

/// Shared, lock-guarded statistics store.
#[derive(Debug, Default)]
pub struct PollingStats {
    inner: Mutex<PollingStatsSnapshot>,
}

impl PollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request.
    pub fn record(&self, slave_id: u8, success: bool, duration_ms: f64, error: Option<String>) {
        let mut inner = self.inner.lock();

        inner.polls += 1;
        if !success {
            inner.failed_polls += 1;
        }

        let slave = inner.slave_stats.entry(slave_id).or_default();
        slave.requests += 1;
        slave.response_time_sum_ms += duration_ms;
        if success {
            slave.last_error = None;
        } else {
            slave.failures += 1;
            if let Some(err) = error {
                slave.last_error = Some(err);
            }
        }
    }

    pub fn snapshot(&self) -> PollingStatsSnapshot {
        self.inner.lock().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = PollingStatsSnapshot::default();
    }
}
