//! Circuit breaker state machine (spec.md §4.1.3).
//!
//! Grounded on `kernel::timer::TimerQueue`'s deadline bookkeeping style for
//! the reset timer, wrapped around the classic closed/open/half-open
//! transition rules instead of a generic timer callback.

use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of recording a task result, telling the caller whether the
/// breaker just changed state (so it can emit a `circuitBreakerOpen` /
/// `circuitBreakerClosed` event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Opened,
    HalfOpened,
    Closed,
}

/// Tracks consecutive failures and trips `Closed -> Open` past
/// `error_threshold`; after `reset_timeout_ms` moves `Open -> HalfOpen` and
/// admits up to `half_open_requests` probes, closing on their success or
/// reopening on the first failure.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    error_count: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: CircuitState::Closed,
            error_count: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    /// Called before dispatching a task. `Open` transitions to `HalfOpen`
    /// once the reset timeout has elapsed; returns whether the caller may
    /// proceed with dispatch.
    pub fn allow_request(&mut self, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| now.duration_since(t)).unwrap_or_default();
                if elapsed >= self.reset_timeout() {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    self.half_open_in_flight = 0;
                    self.admit_half_open_probe()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.admit_half_open_probe(),
        }
    }

    fn admit_half_open_probe(&mut self) -> bool {
        if self.half_open_in_flight >= self.config.half_open_requests {
            return false;
        }
        self.half_open_in_flight += 1;
        true
    }

    pub fn record_success(&mut self) -> Transition {
        if !self.config.enabled {
            return Transition::None;
        }
        match self.state {
            CircuitState::Closed => {
                self.error_count = 0;
                Transition::None
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                if self.half_open_successes >= self.config.half_open_requests {
                    self.state = CircuitState::Closed;
                    self.error_count = 0;
                    self.opened_at = None;
                    Transition::Closed
                } else {
                    Transition::None
                }
            }
            CircuitState::Open => Transition::None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Transition {
        if !self.config.enabled {
            return Transition::None;
        }
        match self.state {
            CircuitState::Closed => {
                self.error_count += 1;
                if self.error_count >= self.config.error_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    Transition::Opened
                } else {
                    Transition::None
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.half_open_in_flight = 0;
                self.half_open_successes = 0;
                Transition::Opened
            }
            CircuitState::Open => Transition::None,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig { enabled: true, error_threshold: 3, reset_timeout_ms: 100, half_open_requests: 2 }
    }

    #[test]
    fn opens_after_error_threshold_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(cfg());
        let t0 = Instant::now();
        assert_eq!(breaker.record_failure(t0), Transition::None);
        assert_eq!(breaker.record_failure(t0), Transition::None);
        assert_eq!(breaker.record_failure(t0), Transition::Opened);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn rejects_requests_while_open_until_reset_timeout() {
        let mut breaker = CircuitBreaker::new(cfg());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(t0);
        }
        assert!(!breaker.allow_request(t0 + Duration::from_millis(10)));
        assert!(breaker.allow_request(t0 + Duration::from_millis(150)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_enough_probe_successes() {
        let mut breaker = CircuitBreaker::new(cfg());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(t0);
        }
        let t1 = t0 + Duration::from_millis(150);
        assert!(breaker.allow_request(t1));
        assert!(breaker.allow_request(t1));
        assert!(!breaker.allow_request(t1), "half_open_requests caps in-flight probes");

        assert_eq!(breaker.record_success(), Transition::None);
        assert_eq!(breaker.record_success(), Transition::Closed);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_first_probe_failure() {
        let mut breaker = CircuitBreaker::new(cfg());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(t0);
        }
        let t1 = t0 + Duration::from_millis(150);
        assert!(breaker.allow_request(t1));

        assert_eq!(breaker.record_failure(t1), Transition::Opened);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn disabled_breaker_always_allows_and_never_trips() {
        let mut breaker = CircuitBreaker::new(CircuitBreakerConfig { enabled: false, ..cfg() });
        let t0 = Instant::now();
        for _ in 0..10 {
            assert_eq!(breaker.record_failure(t0), Transition::None);
        }
        assert!(breaker.allow_request(t0));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
