//! Windowed smoothing primitives for heartbeat-derived load signals.
//!
//! These are intentionally small: fixed windows over `VecDeque`, no
//! allocation on the hot path beyond the ring itself. The store stats use
//! the Hull chain (HMA over a max filter) to keep available-space scheduling
//! from chasing spikes; the hot-peer cache uses `TimeMedian` to smooth flow
//! rates.

use std::collections::VecDeque;
use std::time::Duration;

/// Weighted moving average over the most recent `size` samples, newest
/// weighted highest.
fn wma(window: &VecDeque<f64>, size: usize) -> f64 {
    let n = window.len().min(size);
    if n == 0 {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for (i, v) in window.iter().rev().take(n).enumerate() {
        let weight = (n - i) as f64;
        sum += v * weight;
        weight_sum += weight;
    }
    sum / weight_sum
}

/// Hull moving average: `WMA(2*WMA(n/2) - WMA(n), sqrt(n))`. Tracks trends
/// with far less lag than a plain moving average.
#[derive(Debug, Clone)]
pub struct Hma {
    size: usize,
    raw: VecDeque<f64>,
    hull: VecDeque<f64>,
}

impl Hma {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        Self {
            size,
            raw: VecDeque::with_capacity(size),
            hull: VecDeque::with_capacity((size as f64).sqrt().ceil() as usize),
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.raw.len() == self.size {
            self.raw.pop_front();
        }
        self.raw.push_back(value);

        let half = 2.0 * wma(&self.raw, self.size / 2) - wma(&self.raw, self.size);
        let hull_size = (self.size as f64).sqrt().ceil() as usize;
        if self.hull.len() == hull_size {
            self.hull.pop_front();
        }
        self.hull.push_back(half);
    }

    pub fn get(&self) -> f64 {
        let hull_size = (self.size as f64).sqrt().ceil() as usize;
        wma(&self.hull, hull_size)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Max over the most recent `size` samples.
#[derive(Debug, Clone)]
pub struct MaxFilter {
    size: usize,
    window: VecDeque<f64>,
}

impl MaxFilter {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            window: VecDeque::new(),
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    pub fn get(&self) -> f64 {
        self.window.iter().copied().fold(0.0, f64::max)
    }
}

/// Median over the most recent `size` samples.
#[derive(Debug, Clone)]
pub struct MedianFilter {
    size: usize,
    window: VecDeque<f64>,
}

impl MedianFilter {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            window: VecDeque::new(),
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    pub fn get(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }
}

/// Accumulates (delta, interval) pairs and reports the average rate over the
/// accumulated span. Used both as the per-report accumulator (cleared once a
/// full report interval has been gathered) and as the rolling feed.
#[derive(Debug, Clone)]
pub struct AvgOverTime {
    window: Duration,
    total_delta: f64,
    total_interval: Duration,
}

impl AvgOverTime {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            total_delta: 0.0,
            total_interval: Duration::ZERO,
        }
    }

    pub fn add(&mut self, delta: f64, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        self.total_delta += delta;
        self.total_interval += interval;
    }

    /// Average rate in units per second over the accumulated span.
    pub fn get(&self) -> f64 {
        if self.total_interval.is_zero() {
            return 0.0;
        }
        self.total_delta / self.total_interval.as_secs_f64()
    }

    pub fn is_full(&self) -> bool {
        self.total_interval >= self.window
    }

    pub fn interval_sum(&self) -> Duration {
        self.total_interval
    }

    pub fn clear(&mut self) {
        self.total_delta = 0.0;
        self.total_interval = Duration::ZERO;
    }
}

/// Rolling flow-rate estimator: averages within a report interval, then a
/// median filter to shed outliers, then a short Hull average to smooth what
/// the median lets through.
#[derive(Debug, Clone)]
pub struct TimeMedian {
    aot: AvgOverTime,
    median: MedianFilter,
    hull: Hma,
}

impl TimeMedian {
    pub fn new(report_interval: Duration, median_size: usize, hull_size: usize) -> Self {
        Self {
            aot: AvgOverTime::new(report_interval),
            median: MedianFilter::new(median_size),
            hull: Hma::new(hull_size),
        }
    }

    pub fn add(&mut self, delta: f64, interval: Duration) {
        self.aot.add(delta, interval);
        if self.aot.is_full() {
            self.median.add(self.aot.get());
            self.hull.add(self.median.get());
            self.aot.clear();
        }
    }

    pub fn get(&self) -> f64 {
        if self.hull.is_empty() {
            // Not a single full report interval yet; fall back to what we have.
            self.aot.get()
        } else {
            self.hull.get()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hma_converges_to_constant_input() {
        let mut hma = Hma::new(60);
        for _ in 0..120 {
            hma.add(42.0);
        }
        assert!((hma.get() - 42.0).abs() < 1e-6);
    }

    #[test]
    fn max_filter_tracks_window_max() {
        let mut mf = MaxFilter::new(3);
        mf.add(5.0);
        mf.add(1.0);
        assert_eq!(mf.get(), 5.0);
        mf.add(2.0);
        mf.add(3.0);
        // 5.0 has left the window.
        assert_eq!(mf.get(), 3.0);
    }

    #[test]
    fn median_filter_sheds_outliers() {
        let mut mf = MedianFilter::new(5);
        for v in [10.0, 10.0, 1000.0, 10.0, 10.0] {
            mf.add(v);
        }
        assert_eq!(mf.get(), 10.0);
    }

    #[test]
    fn avg_over_time_reports_rate() {
        let mut aot = AvgOverTime::new(Duration::from_secs(10));
        aot.add(600.0, Duration::from_secs(4));
        assert!(!aot.is_full());
        aot.add(600.0, Duration::from_secs(8));
        assert!(aot.is_full());
        assert!((aot.get() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn time_median_smooths_constant_rate() {
        let mut tm = TimeMedian::new(Duration::from_secs(10), 5, 5);
        for _ in 0..30 {
            tm.add(1000.0, Duration::from_secs(10));
        }
        assert!((tm.get() - 100.0).abs() < 1.0);
    }
}
