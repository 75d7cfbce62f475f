//! Negative-feedback controller for batch size and window length.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples kept for the rolling averages.
pub const SAMPLE_WINDOW: usize = 50;

/// Below this efficiency gain, larger batches are worth trying.
const LOW_EFFICIENCY: f64 = 1.5;
/// Fraction of the wait ceiling treated as "too close".
const WAIT_PRESSURE: f64 = 0.8;
/// Batches filled below this fraction of the optimal size are under-filled.
const UNDER_FILLED: f64 = 0.5;

/// One completed batch, as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSample {
    pub size: usize,
    /// Wait of the oldest member before flush
    pub wait_ms: u64,
    /// Individual cost estimate divided by actual combined cost
    pub efficiency: f64,
}

/// What one control tick changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub batch_size_delta: i64,
    pub window_delta_ms: i64,
}

impl Adjustment {
    pub fn is_noop(&self) -> bool {
        self.batch_size_delta == 0 && self.window_delta_ms == 0
    }
}

/// Controller state: the dynamic batch size and window it steers.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    optimal_batch_size: usize,
    window_ms: u64,
    min_batch_size: usize,
    max_batch_size: usize,
    min_window_ms: u64,
    max_wait_ms: u64,
    samples: VecDeque<BatchSample>,
    /// Samples recorded since the last tick
    fresh: usize,
}

impl AdaptiveController {
    /// Start at the static maximum size and the configured window.
    pub fn new(
        max_batch_size: usize,
        min_batch_size: usize,
        window_ms: u64,
        min_window_ms: u64,
        max_wait_ms: u64,
    ) -> Self {
        Self {
            optimal_batch_size: max_batch_size,
            window_ms,
            min_batch_size: min_batch_size.min(max_batch_size).max(1),
            max_batch_size,
            min_window_ms: min_window_ms.min(window_ms),
            max_wait_ms,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            fresh: 0,
        }
    }

    pub fn optimal_batch_size(&self) -> usize {
        self.optimal_batch_size
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn record(&mut self, sample: BatchSample) {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.fresh += 1;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn avg_batch_size(&self) -> f64 {
        self.mean(|s| s.size as f64)
    }

    pub fn avg_wait_ms(&self) -> f64 {
        self.mean(|s| s.wait_ms as f64)
    }

    pub fn efficiency_gain(&self) -> f64 {
        self.mean(|s| s.efficiency)
    }

    fn mean(&self, f: impl Fn(&BatchSample) -> f64) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().map(f).sum::<f64>() / self.samples.len() as f64
        }
    }

    /// One control tick. Nothing recorded since the previous tick means no
    /// change; the rolling averages only steer once per new batch of feedback.
    pub fn adjust(&mut self) -> Adjustment {
        if self.fresh == 0 {
            return Adjustment::default();
        }
        self.fresh = 0;

        let avg_size = self.avg_batch_size();
        let avg_wait = self.avg_wait_ms();
        let efficiency = self.efficiency_gain();
        let wait_ceiling = self.max_wait_ms as f64 * WAIT_PRESSURE;

        let old_size = self.optimal_batch_size;
        let old_window = self.window_ms;

        if avg_wait > wait_ceiling {
            self.optimal_batch_size = old_size.saturating_sub(1).max(self.min_batch_size);
            self.window_ms = ((old_window as f64 * 0.8) as u64).max(self.min_window_ms);
        } else {
            if efficiency < LOW_EFFICIENCY && old_size < self.max_batch_size {
                self.optimal_batch_size = old_size + 1;
            }
            if avg_size < old_size as f64 * UNDER_FILLED {
                let grown = ((old_window as f64 * 1.2).ceil() as u64).max(old_window + 1);
                self.window_ms = grown.min(self.max_wait_ms);
            }
        }

        Adjustment {
            batch_size_delta: self.optimal_batch_size as i64 - old_size as i64,
            window_delta_ms: self.window_ms as i64 - old_window as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(10, 2, 100, 10, 1000)
    }

    fn sample(size: usize, wait_ms: u64, efficiency: f64) -> BatchSample {
        BatchSample {
            size,
            wait_ms,
            efficiency,
        }
    }

    #[test]
    fn test_starts_at_static_maximum() {
        let c = controller();
        assert_eq!(c.optimal_batch_size(), 10);
        assert_eq!(c.window_ms(), 100);
    }

    #[test]
    fn test_no_samples_no_change() {
        let mut c = controller();
        assert!(c.adjust().is_noop());
    }

    #[test]
    fn test_high_wait_shrinks_size_and_window() {
        let mut c = controller();
        c.record(sample(10, 900, 5.0));
        let adj = c.adjust();
        assert_eq!(adj.batch_size_delta, -1);
        assert_eq!(c.optimal_batch_size(), 9);
        assert_eq!(c.window_ms(), 80);
    }

    #[test]
    fn test_idle_ticks_do_not_reapply_old_samples() {
        let mut c = controller();
        c.record(sample(10, 900, 5.0));
        assert!(!c.adjust().is_noop());
        for _ in 0..20 {
            assert!(c.adjust().is_noop());
        }
        assert_eq!(c.optimal_batch_size(), 9);
        assert_eq!(c.window_ms(), 80);

        // Averages stay readable between ticks
        assert_eq!(c.sample_count(), 1);
        c.record(sample(10, 900, 5.0));
        assert_eq!(c.adjust().batch_size_delta, -1);
        assert_eq!(c.optimal_batch_size(), 8);
    }

    #[test]
    fn test_size_and_window_respect_floors() {
        let mut c = AdaptiveController::new(3, 2, 12, 10, 100);
        for _ in 0..10 {
            c.record(sample(3, 95, 5.0));
            c.adjust();
        }
        assert_eq!(c.optimal_batch_size(), 2);
        assert_eq!(c.window_ms(), 10);
    }

    #[test]
    fn test_low_efficiency_grows_size_with_headroom() {
        let mut c = controller();
        c.record(sample(10, 900, 5.0));
        c.adjust();
        assert_eq!(c.optimal_batch_size(), 9);

        let mut c2 = c.clone();
        c2.samples.clear();
        c2.record(sample(9, 50, 1.1));
        let adj = c2.adjust();
        assert_eq!(adj.batch_size_delta, 1);
        assert_eq!(c2.optimal_batch_size(), 10);

        // No headroom at the static maximum
        c2.samples.clear();
        c2.record(sample(10, 50, 1.1));
        assert_eq!(c2.adjust().batch_size_delta, 0);
    }

    #[test]
    fn test_under_filled_batches_grow_window() {
        let mut c = controller();
        c.record(sample(2, 100, 3.0));
        let adj = c.adjust();
        assert_eq!(adj.window_delta_ms, 20);
        assert_eq!(c.window_ms(), 120);
    }

    #[test]
    fn test_window_capped_at_max_wait() {
        let mut c = AdaptiveController::new(10, 2, 950, 10, 1000);
        c.record(sample(1, 10, 3.0));
        c.adjust();
        assert_eq!(c.window_ms(), 1000);
    }

    #[test]
    fn test_samples_are_bounded() {
        let mut c = controller();
        for i in 0..(SAMPLE_WINDOW + 10) {
            c.record(sample(i, 0, 1.0));
        }
        assert_eq!(c.sample_count(), SAMPLE_WINDOW);
    }
}
