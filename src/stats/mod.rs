//! Statistics collection
//!
//! Broker-wide counters and a completion latency histogram. Counters are
//! lock-free and cache-line aligned since submitters, waiters and the
//! completion thread all update them concurrently; the histogram sits behind a
//! mutex and is only touched once per completed request.
//!
//! # Example
//!
//! ```
//! use diskbroker::stats::BrokerStats;
//!
//! let stats = BrokerStats::new().unwrap();
//! stats.submitted.add(2);
//! stats.record_completion(120, true);
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.submitted, 2);
//! assert_eq!(snapshot.completed, 1);
//! ```

pub mod histogram;

use crate::Result;
use histogram::LatencyHistogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-line aligned atomic counter to prevent false sharing
///
/// ```text
/// [value: 8 bytes][padding: 56 bytes] = 64 bytes total
/// ```
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    /// Increment the counter by `val`
    ///
    /// Relaxed: no ordering is needed between independent counters.
    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker-wide statistics
#[derive(Debug)]
pub struct BrokerStats {
    /// Requests accepted by the transport
    pub submitted: AlignedCounter,
    /// Requests whose transfer completed in full
    pub completed: AlignedCounter,
    /// Requests whose transfer failed (including partial transfers)
    pub errored: AlignedCounter,
    /// Requests that moved fewer bytes than asked
    pub partial: AlignedCounter,
    /// Requests refused for lack of pool slots or queue space
    pub busy: AlignedCounter,
    /// Requests refused by validation or a dead disk
    pub rejected: AlignedCounter,
    /// Cancellation marks applied
    pub cancelled: AlignedCounter,
    /// Requests returned to the pool by a reap
    pub reaped: AlignedCounter,
    /// Disk entries created
    pub disks_opened: AlignedCounter,
    /// Disk entries torn down
    pub disks_closed: AlignedCounter,

    latency: Mutex<LatencyHistogram>,
}

impl BrokerStats {
    pub fn new() -> Result<Self> {
        Ok(Self {
            submitted: AlignedCounter::new(),
            completed: AlignedCounter::new(),
            errored: AlignedCounter::new(),
            partial: AlignedCounter::new(),
            busy: AlignedCounter::new(),
            rejected: AlignedCounter::new(),
            cancelled: AlignedCounter::new(),
            reaped: AlignedCounter::new(),
            disks_opened: AlignedCounter::new(),
            disks_closed: AlignedCounter::new(),
            latency: Mutex::new(LatencyHistogram::new()?),
        })
    }

    /// Record a transport completion and its latency
    pub fn record_completion(&self, elapsed_us: u64, success: bool) {
        if success {
            self.completed.incr();
        } else {
            self.errored.incr();
        }
        self.latency.lock().record_micros(elapsed_us);
    }

    /// Copy of the latency histogram
    pub fn latency(&self) -> LatencyHistogram {
        self.latency.lock().clone()
    }

    /// Point-in-time view of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let latency = self.latency.lock();
        let micros = |d: Option<std::time::Duration>| d.map(|d| d.as_micros() as u64);

        StatsSnapshot {
            submitted: self.submitted.get(),
            completed: self.completed.get(),
            errored: self.errored.get(),
            partial: self.partial.get(),
            busy: self.busy.get(),
            rejected: self.rejected.get(),
            cancelled: self.cancelled.get(),
            reaped: self.reaped.get(),
            disks_opened: self.disks_opened.get(),
            disks_closed: self.disks_closed.get(),
            latency_samples: latency.len(),
            latency_min_us: micros(latency.min()),
            latency_mean_us: micros(latency.mean()),
            latency_p50_us: micros(latency.percentile(50.0)),
            latency_p99_us: micros(latency.percentile(99.0)),
            latency_max_us: micros(latency.max()),
        }
    }
}

/// Serializable statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub errored: u64,
    pub partial: u64,
    pub busy: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub reaped: u64,
    pub disks_opened: u64,
    pub disks_closed: u64,
    pub latency_samples: u64,
    pub latency_min_us: Option<u64>,
    pub latency_mean_us: Option<u64>,
    pub latency_p50_us: Option<u64>,
    pub latency_p99_us: Option<u64>,
    pub latency_max_us: Option<u64>,
}

impl StatsSnapshot {
    /// Requests that reached the transport but are not yet terminal
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed + self.errored)
    }
}
