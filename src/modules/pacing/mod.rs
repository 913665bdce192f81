//! Minimum-interval request gate.
//!
//! Each pacer owns its own "next free slot"; there is no process-wide state,
//! so independent engines (and tests) never throttle one another.

use log::debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::clock::{Clock, system_clock};

#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    clock: Arc<dyn Clock>,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_clock(min_interval, system_clock())
    }

    pub fn with_clock(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval,
            clock,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Book the next slot and return how long the caller must wait for it.
    ///
    /// Concurrent callers receive consecutive slots `min_interval` apart.
    pub fn reserve(&self) -> Duration {
        let now = self.clock.now();
        let mut next_slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match *next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next_slot = Some(slot + self.min_interval);
        let wait = slot.saturating_duration_since(now);
        if !wait.is_zero() {
            debug!("pacing: next action in {:.2}s", wait.as_secs_f64());
        }
        wait
    }

    /// Wait this caller's turn.
    pub async fn wait_turn(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;

    #[test]
    fn first_request_goes_immediately() {
        let pacer = RequestPacer::new(Duration::from_secs(10));
        assert_eq!(pacer.reserve(), Duration::ZERO);
    }

    #[test]
    fn back_to_back_requests_queue_up() {
        let clock = ManualClock::new();
        let pacer = RequestPacer::with_clock(Duration::from_secs(10), Arc::new(clock.clone()));
        assert_eq!(pacer.reserve(), Duration::ZERO);
        assert_eq!(pacer.reserve(), Duration::from_secs(10));
        assert_eq!(pacer.reserve(), Duration::from_secs(20));
        clock.advance(Duration::from_secs(25));
        assert_eq!(pacer.reserve(), Duration::from_secs(5));
    }

    #[test]
    fn idle_time_is_not_banked() {
        let clock = ManualClock::new();
        let pacer = RequestPacer::with_clock(Duration::from_secs(2), Arc::new(clock.clone()));
        pacer.reserve();
        clock.advance(Duration::from_secs(60));
        assert_eq!(pacer.reserve(), Duration::ZERO);
        assert_eq!(pacer.reserve(), Duration::from_secs(2));
    }

    #[test]
    fn separate_pacers_are_independent() {
        let a = RequestPacer::new(Duration::from_secs(30));
        let b = RequestPacer::new(Duration::from_secs(30));
        a.reserve();
        assert_eq!(b.reserve(), Duration::ZERO);
    }

    #[tokio::test]
    async fn zero_interval_never_sleeps() {
        let pacer = RequestPacer::new(Duration::ZERO);
        for _ in 0..3 {
            pacer.wait_turn().await;
        }
        assert_eq!(pacer.reserve(), Duration::ZERO);
    }
}
