//! Per-channel metrics (C9): rate and processing-time sliding means,
//! frame-loss detection, and a memory-usage estimate.
//!
//! Grounded on the original driver's `imgRateSamples_`/`imgAcquisitionRate_`
//! sliding-mean bookkeeping (`original_source/tpx3App/src/ADTimePix.cpp`),
//! reimplemented over a bounded `VecDeque` in the teacher's idiom rather
//! than a fixed-size C array with a manual head index.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples kept for the rate sliding window (spec.md §4.9).
const RATE_WINDOW: usize = 60;
/// Samples kept for the processing-time sliding window.
const PROC_TIME_WINDOW: usize = 20;
/// Minimum spacing between rate/processing-time publications.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
/// Minimum spacing between unconditional memory-usage recomputation.
const MEMORY_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(5);
/// Frame-buffer fill ratio that forces an immediate memory recompute.
const MEMORY_FILL_TRIGGER: f64 = 0.90;

/// A detected gap in the monotonic frame-number sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLossEvent {
    /// The frame number that would continue the sequence with no loss.
    pub expected: i64,
    /// The frame number actually received.
    pub got: i64,
}

/// Sliding-window rate estimator over consecutive frame numbers.
#[derive(Debug)]
pub struct RateEstimator {
    samples: VecDeque<f64>,
    prev_frame_number: Option<i64>,
    prev_wall_time: Option<Instant>,
    last_publish: Option<Instant>,
    rate: f64,
}

impl RateEstimator {
    /// Create an estimator with an empty window.
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RATE_WINDOW),
            prev_frame_number: None,
            prev_wall_time: None,
            last_publish: None,
            rate: 0.0,
        }
    }

    /// Record an accepted frame's number at wall-clock time `now`.
    ///
    /// Returns a [`FrameLossEvent`] when the frame-number gap is negative or
    /// greater than one (spec.md §4.9). The first observed frame never
    /// produces a loss event (there is no previous frame to compare against).
    pub fn observe(&mut self, frame_number: i64, now: Instant) -> Option<FrameLossEvent> {
        let mut loss = None;
        if let (Some(prev_n), Some(prev_t)) = (self.prev_frame_number, self.prev_wall_time) {
            let gap = frame_number - prev_n;
            let dt = now.saturating_duration_since(prev_t).as_secs_f64();
            if gap > 0 && dt > 0.0 {
                self.samples.push_back(gap as f64 / dt);
                while self.samples.len() > RATE_WINDOW {
                    self.samples.pop_front();
                }
            }
            if gap < 0 || gap > 1 {
                loss = Some(FrameLossEvent {
                    expected: prev_n + 1,
                    got: frame_number,
                });
            }
        }
        self.prev_frame_number = Some(frame_number);
        self.prev_wall_time = Some(now);
        loss
    }

    /// Mean of the current window, or 0 if empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    /// Whether a publication is due (at most once per second).
    pub fn should_publish(&mut self, now: Instant) -> bool {
        let due = self
            .last_publish
            .is_none_or(|t| now.saturating_duration_since(t) >= PUBLISH_INTERVAL);
        if due {
            self.rate = self.mean();
            self.last_publish = Some(now);
        }
        due
    }

    /// Last computed rate (updated by [`Self::should_publish`]).
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Reset to the empty, never-published state (spec.md §4.6: a clean
    /// stop resets rate samples and zeroes the published rate).
    pub fn reset(&mut self) {
        self.samples.clear();
        self.prev_frame_number = None;
        self.prev_wall_time = None;
        self.last_publish = None;
        self.rate = 0.0;
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding-window processing-time estimator, in milliseconds.
#[derive(Debug)]
pub struct ProcTimeEstimator {
    samples: VecDeque<f64>,
    last_publish: Option<Instant>,
    value_ms: f64,
}

impl ProcTimeEstimator {
    /// Create an estimator with an empty window.
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(PROC_TIME_WINDOW),
            last_publish: None,
            value_ms: 0.0,
        }
    }

    /// Record one frame's processing duration.
    pub fn observe(&mut self, elapsed: Duration) {
        self.samples.push_back(elapsed.as_secs_f64() * 1000.0);
        while self.samples.len() > PROC_TIME_WINDOW {
            self.samples.pop_front();
        }
    }

    /// Whether a publication is due: the window just filled, or at least
    /// one second has passed since the last publication.
    pub fn should_publish(&mut self, now: Instant) -> bool {
        let window_full = self.samples.len() == PROC_TIME_WINDOW;
        let time_elapsed = self
            .last_publish
            .is_none_or(|t| now.saturating_duration_since(t) >= PUBLISH_INTERVAL);
        let due = window_full || time_elapsed;
        if due {
            self.value_ms = if self.samples.is_empty() {
                0.0
            } else {
                self.samples.iter().sum::<f64>() / self.samples.len() as f64
            };
            self.last_publish = Some(now);
        }
        due
    }

    /// Last computed mean processing time, in milliseconds.
    pub fn value_ms(&self) -> f64 {
        self.value_ms
    }

    /// Reset to the empty, never-published state.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_publish = None;
        self.value_ms = 0.0;
    }
}

impl Default for ProcTimeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Running total of pixel/bin counts across an acquisition, saturating.
#[derive(Debug, Default, Clone, Copy)]
pub struct TotalCounts(u64);

impl TotalCounts {
    /// Zero.
    pub fn new() -> Self {
        Self(0)
    }

    /// Add one frame's worth of counts.
    pub fn add(&mut self, frame_sum: u64) {
        self.0 = self.0.saturating_add(frame_sum);
    }

    /// Current total.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Reset to zero.
    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Decides when the memory-usage estimate needs recomputing (spec.md
/// §4.9): every 5 seconds, or immediately whenever the frame buffer is at
/// least 90% full.
#[derive(Debug)]
pub struct MemoryEstimator {
    last_check: Option<Instant>,
    last_bytes: usize,
}

impl MemoryEstimator {
    /// Create an estimator that will recompute on its first check.
    pub fn new() -> Self {
        Self {
            last_check: None,
            last_bytes: 0,
        }
    }

    /// Whether `now`/`fill_ratio` call for a recompute.
    pub fn should_recompute(&self, now: Instant, fill_ratio: f64) -> bool {
        fill_ratio >= MEMORY_FILL_TRIGGER
            || self
                .last_check
                .is_none_or(|t| now.saturating_duration_since(t) >= MEMORY_RECOMPUTE_INTERVAL)
    }

    /// Record a freshly computed byte count as of `now`.
    pub fn record(&mut self, now: Instant, bytes: usize) {
        self.last_check = Some(now);
        self.last_bytes = bytes;
    }

    /// Most recently recorded byte count, converted to MiB.
    pub fn last_mib(&self) -> f64 {
        self.last_bytes as f64 / (1024.0 * 1024.0)
    }
}

impl Default for MemoryEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_estimator_flags_gap_and_negative_step() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();
        assert_eq!(est.observe(1, t0), None);
        let t1 = t0 + Duration::from_millis(10);
        assert_eq!(est.observe(2, t1), None);
        let t2 = t1 + Duration::from_millis(10);
        assert_eq!(
            est.observe(5, t2),
            Some(FrameLossEvent { expected: 3, got: 5 })
        );
        let t3 = t2 + Duration::from_millis(10);
        assert_eq!(
            est.observe(4, t3),
            Some(FrameLossEvent { expected: 6, got: 4 })
        );
    }

    #[test]
    fn rate_estimator_publishes_at_most_once_per_second() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();
        assert!(est.should_publish(t0));
        assert!(!est.should_publish(t0 + Duration::from_millis(500)));
        assert!(est.should_publish(t0 + Duration::from_millis(1001)));
    }

    #[test]
    fn rate_estimator_reset_zeroes_published_rate() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();
        est.observe(1, t0);
        est.observe(2, t0 + Duration::from_millis(10));
        est.should_publish(t0 + Duration::from_millis(10));
        assert!(est.rate() > 0.0);
        est.reset();
        assert_eq!(est.rate(), 0.0);
    }

    #[test]
    fn proc_time_publishes_when_window_fills() {
        let mut est = ProcTimeEstimator::new();
        let t0 = Instant::now();
        for _ in 0..PROC_TIME_WINDOW - 1 {
            est.observe(Duration::from_millis(1));
            assert!(!est.should_publish(t0));
        }
        est.observe(Duration::from_millis(1));
        assert!(est.should_publish(t0));
    }

    #[test]
    fn total_counts_saturates() {
        let mut tc = TotalCounts::new();
        tc.add(u64::MAX);
        tc.add(10);
        assert_eq!(tc.value(), u64::MAX);
    }

    #[test]
    fn memory_estimator_triggers_on_fill_ratio() {
        let est = MemoryEstimator::new();
        let now = Instant::now();
        assert!(est.should_recompute(now, 0.95));
    }

    #[test]
    fn memory_estimator_triggers_after_interval() {
        let mut est = MemoryEstimator::new();
        let t0 = Instant::now();
        est.record(t0, 1024);
        assert!(!est.should_recompute(t0 + Duration::from_secs(1), 0.0));
        assert!(est.should_recompute(t0 + Duration::from_secs(6), 0.0));
    }
}
