//! Token estimation, the fixed backoff schedule, and the per-instance
//! circuit breaker every pipeline consumes (spec §4.2).

use std::time::{Duration, Instant};

/// `ceil(len/4)` character-based heuristic. Cheap and deterministic.
pub fn estimate_tokens(text: &str) -> u64 {
    let len = text.chars().count() as u64;
    len.div_ceil(4)
}

const BACKOFF_SCHEDULE_SECS: [u64; 5] = [15, 30, 60, 120, 300];

/// `schedule[min(n-1, 4)]` seconds, clamped at the final element for all
/// `n >= len(schedule)`, and at `schedule[0]` for `n <= 1` (including `n=0`).
pub fn compute_backoff_ms(n_failures: u32) -> u64 {
    let index = n_failures.saturating_sub(1).min(4) as usize;
    BACKOFF_SCHEDULE_SECS[index] * 1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const TRIP_THRESHOLD: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// A 3-state gate (closed/open/half-open) that suppresses calls after
/// consecutive failures and probes recovery after a cooldown. One instance
/// per pipeline; never a shared global.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        CircuitBreaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Returns true if the caller should skip invoking the guarded
    /// operation this turn. A single call after the cooldown elapses
    /// transitions the breaker to half-open and returns false exactly once.
    pub fn should_skip(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= COOLDOWN {
                    self.state = BreakerState::HalfOpen;
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// A failure while half-open counts as an immediate re-trip, regardless
    /// of the running consecutive count.
    pub fn record_failure(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.consecutive_failures = TRIP_THRESHOLD;
            self.trip();
            return;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= TRIP_THRESHOLD {
            self.trip();
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn backoff_is_schedule_zero_for_n_le_one() {
        assert_eq!(compute_backoff_ms(0), 15_000);
        assert_eq!(compute_backoff_ms(1), 15_000);
    }

    #[test]
    fn backoff_is_monotone_and_indexes_schedule() {
        assert_eq!(compute_backoff_ms(2), 30_000);
        assert_eq!(compute_backoff_ms(3), 60_000);
        assert_eq!(compute_backoff_ms(4), 120_000);
        assert_eq!(compute_backoff_ms(5), 300_000);
    }

    #[test]
    fn backoff_clamps_at_final_element() {
        assert_eq!(compute_backoff_ms(6), 300_000);
        assert_eq!(compute_backoff_ms(100), 300_000);
    }

    #[test]
    fn breaker_trips_after_three_consecutive_failures() {
        let mut breaker = CircuitBreaker::new();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.should_skip());
    }

    #[test]
    fn breaker_success_resets_to_closed() {
        let mut breaker = CircuitBreaker::new();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_failure_in_half_open_reopens() {
        let mut breaker = CircuitBreaker::new();
        breaker.state = BreakerState::HalfOpen;
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn breaker_half_open_does_not_skip() {
        let mut breaker = CircuitBreaker::new();
        breaker.state = BreakerState::HalfOpen;
        assert!(!breaker.should_skip());
    }
}
