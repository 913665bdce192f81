//! Per-resource usage counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Usage record for one credential or egress path.
///
/// `use_count` is scoped to the current quota window; the success and error
/// counters are cumulative for the lifetime of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub resource_id: String,
    /// Monotonic timestamp of the last selection, `None` when never used.
    #[serde(skip)]
    pub last_used: Option<Instant>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: u32,
    pub success_count: u64,
    pub error_count: u64,
    pub response_latency: Option<Duration>,
}

impl UsageStats {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            last_used: None,
            last_used_at: None,
            use_count: 0,
            success_count: 0,
            error_count: 0,
            response_latency: None,
        }
    }

    pub fn mark_used(&mut self, now: Instant) {
        self.use_count = self.use_count.saturating_add(1);
        self.last_used = Some(now);
        self.last_used_at = Some(Utc::now());
    }

    pub fn record_outcome(&mut self, success: bool) {
        if success {
            self.success_count = self.success_count.saturating_add(1);
        } else {
            self.error_count = self.error_count.saturating_add(1);
        }
    }

    pub fn record_latency(&mut self, latency: Duration) {
        self.response_latency = Some(latency);
    }

    pub fn reset_window(&mut self) {
        self.use_count = 0;
    }

    /// Fraction of reported outcomes that succeeded, `0.0` with no reports.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// How far errors run ahead of successes.
    pub fn error_surplus(&self) -> u64 {
        self.error_count.saturating_sub(self.success_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_are_unused() {
        let stats = UsageStats::new("alice");
        assert!(stats.last_used.is_none());
        assert_eq!(stats.use_count, 0);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[test]
    fn window_reset_keeps_cumulative_counters() {
        let mut stats = UsageStats::new("alice");
        stats.mark_used(Instant::now());
        stats.record_outcome(true);
        stats.record_outcome(false);
        stats.reset_window();
        assert_eq!(stats.use_count, 0);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 1);
        assert!(stats.last_used.is_some());
    }

    #[test]
    fn error_surplus_saturates() {
        let mut stats = UsageStats::new("p");
        stats.record_outcome(true);
        stats.record_outcome(true);
        stats.record_outcome(false);
        assert_eq!(stats.error_surplus(), 0);
        for _ in 0..4 {
            stats.record_outcome(false);
        }
        assert_eq!(stats.error_surplus(), 3);
    }
}
