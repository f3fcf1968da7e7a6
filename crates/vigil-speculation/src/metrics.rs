//! Speculation outcome metrics.

use serde::{Deserialize, Serialize};

/// Counters describing how well speculation is paying off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeculationMetrics {
    /// Speculative executions started.
    pub speculative_executions: u64,
    /// Executions whose parent proof confirmed.
    pub speculative_hits: u64,
    /// Executions rolled back after a parent failure.
    pub speculative_misses: u64,
    /// Estimated wall-clock saved by overlapping, milliseconds.
    pub estimated_time_saved_ms: u64,
    /// Estimated wall-clock wasted on rolled-back work, milliseconds.
    pub estimated_time_wasted_ms: u64,
}

impl SpeculationMetrics {
    /// Hit rate as a percentage in `[0, 100]`; 0 before any outcome.
    pub fn hit_rate(&self) -> f64 {
        let outcomes = self.speculative_hits + self.speculative_misses;
        if outcomes == 0 {
            return 0.0;
        }
        (self.speculative_hits as f64 / outcomes as f64) * 100.0
    }

    pub(crate) fn record_execution(&mut self) {
        self.speculative_executions += 1;
    }

    pub(crate) fn record_hit(&mut self, saved_ms: u64) {
        self.speculative_hits += 1;
        self.estimated_time_saved_ms = self.estimated_time_saved_ms.saturating_add(saved_ms);
    }

    pub(crate) fn record_miss(&mut self, wasted_ms: u64) {
        self.speculative_misses += 1;
        self.estimated_time_wasted_ms = self.estimated_time_wasted_ms.saturating_add(wasted_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_stays_in_bounds() {
        let mut metrics = SpeculationMetrics::default();
        assert_eq!(metrics.hit_rate(), 0.0);

        metrics.record_execution();
        metrics.record_execution();
        metrics.record_hit(100);
        metrics.record_miss(50);

        assert!(metrics.hit_rate() >= 0.0 && metrics.hit_rate() <= 100.0);
        assert!(metrics.speculative_hits + metrics.speculative_misses
            <= metrics.speculative_executions);
        assert_eq!(metrics.estimated_time_saved_ms, 100);
        assert_eq!(metrics.estimated_time_wasted_ms, 50);
    }
}
