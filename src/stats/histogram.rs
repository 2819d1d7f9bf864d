//! Latency histogram using HdrHistogram
//!
//! Records request completion latency (submission to transport completion)
//! in microseconds.
//!
//! # Example
//!
//! ```
//! use diskbroker::stats::histogram::LatencyHistogram;
//! use std::time::Duration;
//!
//! let mut hist = LatencyHistogram::new().unwrap();
//! hist.record(Duration::from_micros(100));
//! hist.record(Duration::from_micros(150));
//! hist.record(Duration::from_micros(200));
//!
//! let p50 = hist.percentile(50.0).unwrap();
//! assert!(p50 >= Duration::from_micros(100));
//! ```

use crate::Result;
use anyhow::Context;
use hdrhistogram::Histogram;
use std::time::Duration;

/// Largest trackable latency: one hour, in microseconds
const MAX_MICROS: u64 = 3_600_000_000;

/// Latency histogram wrapper
///
/// Tracks 1µs to 1 hour with 3 significant digits (0.1% precision).
/// Out-of-range samples are clamped.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    /// Create a new latency histogram
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, MAX_MICROS, 3)
            .context("Failed to create latency histogram")?;
        Ok(Self { histogram })
    }

    /// Record a latency sample
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        self.record_micros(latency.as_micros().min(u128::from(MAX_MICROS)) as u64);
    }

    /// Record a latency sample already expressed in microseconds
    #[inline]
    pub fn record_micros(&mut self, micros: u64) {
        let value = micros.clamp(1, MAX_MICROS);
        let _ = self.histogram.record(value);
    }

    /// Latency at `percentile` (0.0 - 100.0), or None if empty
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.histogram.len() == 0 {
            return None;
        }
        Some(Duration::from_micros(self.histogram.value_at_percentile(percentile)))
    }

    pub fn min(&self) -> Option<Duration> {
        if self.histogram.len() == 0 {
            return None;
        }
        Some(Duration::from_micros(self.histogram.min()))
    }

    pub fn max(&self) -> Option<Duration> {
        if self.histogram.len() == 0 {
            return None;
        }
        Some(Duration::from_micros(self.histogram.max()))
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.histogram.len() == 0 {
            return None;
        }
        Some(Duration::from_micros(self.histogram.mean() as u64))
    }

    /// Number of samples recorded
    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_histogram() {
        let hist = LatencyHistogram::new().unwrap();
        assert!(hist.is_empty());
        assert_eq!(hist.percentile(50.0), None);
        assert_eq!(hist.min(), None);
        assert_eq!(hist.max(), None);
        assert_eq!(hist.mean(), None);
    }

    #[test]
    fn test_record_and_query() {
        let mut hist = LatencyHistogram::new().unwrap();
        for us in [100, 200, 300, 400, 500] {
            hist.record(Duration::from_micros(us));
        }

        assert_eq!(hist.len(), 5);
        assert_eq!(hist.min(), Some(Duration::from_micros(100)));
        let max = hist.max().unwrap();
        assert!(max >= Duration::from_micros(500) && max <= Duration::from_micros(501));
        let p50 = hist.percentile(50.0).unwrap();
        assert!(p50 >= Duration::from_micros(299) && p50 <= Duration::from_micros(301));
    }

    #[test]
    fn test_zero_latency_clamped() {
        let mut hist = LatencyHistogram::new().unwrap();
        hist.record_micros(0);
        assert_eq!(hist.min(), Some(Duration::from_micros(1)));
    }
}
