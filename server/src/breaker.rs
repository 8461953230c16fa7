//! Circuit breaker for outbound dependencies.
//!
//! Rolling failure counter drives Closed → Open → HalfOpen transitions. Each
//! breaker guards a single call site; callers hold it behind a mutex and
//! check [`CircuitBreaker::try_acquire`] before dialing out.

use std::sync::Arc;
use std::time::Duration;

use crate::types::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BreakerError {
    /// Rejected without an outbound call: the circuit is open.
    #[error("circuit '{name}' is open; retry after {retry_after_ms}ms")]
    CircuitOpen { name: String, retry_after_ms: u64 },
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: u64,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            reset_timeout,
            clock,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: 0,
        }
    }

    pub fn state(&self) -> &BreakerState {
        &self.state
    }

    /// Gate an outbound attempt.
    ///
    /// In `Open`, rejects until `reset_timeout` has elapsed since `opened_at`,
    /// then admits a single probe by moving to `HalfOpen`.
    pub fn try_acquire(&mut self) -> Result<(), BreakerError> {
        if self.state == BreakerState::Open {
            let elapsed = self.clock.now_millis().saturating_sub(self.opened_at);
            let reset = self.reset_timeout.as_millis() as u64;
            if elapsed < reset {
                return Err(BreakerError::CircuitOpen {
                    name: self.name.clone(),
                    retry_after_ms: reset - elapsed,
                });
            }
            tracing::debug!(breaker = self.name.as_str(), "Circuit half-open, probing");
            self.state = BreakerState::HalfOpen;
        }
        Ok(())
    }

    pub fn record_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            tracing::info!(breaker = self.name.as_str(), "Circuit closed after probe success");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                // Failed probe: re-open and restart the cooldown.
                self.state = BreakerState::Open;
                self.opened_at = self.clock.now_millis();
                tracing::warn!(breaker = self.name.as_str(), "Probe failed, circuit re-opened");
            }
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = self.clock.now_millis();
                    tracing::warn!(
                        breaker = self.name.as_str(),
                        failures = self.consecutive_failures,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("test", 3, Duration::from_millis(1000), clock)
    }

    #[test]
    fn stays_closed_below_threshold() {
        let clock = Arc::new(ManualClock::new(0));
        let mut b = breaker(clock);
        b.record_failure();
        b.record_failure();
        assert_eq!(*b.state(), BreakerState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn success_resets_the_counter() {
        let clock = Arc::new(ManualClock::new(0));
        let mut b = breaker(clock);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(*b.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_at_threshold_and_rejects() {
        let clock = Arc::new(ManualClock::new(0));
        let mut b = breaker(clock.clone());
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(*b.state(), BreakerState::Open);
        match b.try_acquire() {
            Err(BreakerError::CircuitOpen { retry_after_ms, .. }) => {
                assert_eq!(retry_after_ms, 1000);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn half_open_after_reset_timeout() {
        let clock = Arc::new(ManualClock::new(0));
        let mut b = breaker(clock.clone());
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(999);
        assert!(b.try_acquire().is_err());
        clock.advance(1);
        assert!(b.try_acquire().is_ok());
        assert_eq!(*b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn probe_success_closes() {
        let clock = Arc::new(ManualClock::new(0));
        let mut b = breaker(clock.clone());
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(1000);
        b.try_acquire().unwrap();
        b.record_success();
        assert_eq!(*b.state(), BreakerState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn probe_failure_reopens_with_fresh_cooldown() {
        let clock = Arc::new(ManualClock::new(0));
        let mut b = breaker(clock.clone());
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(1000);
        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(*b.state(), BreakerState::Open);
        // Cooldown restarts from the probe failure, not the original open.
        clock.advance(999);
        assert!(b.try_acquire().is_err());
        clock.advance(1);
        assert!(b.try_acquire().is_ok());
    }
}
