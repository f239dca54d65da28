//! Circuit breaker for registry publishes.
//!
//! The registry is advisory: when Redis is unreachable the element keeps
//! serving and simply stops publishing until the breaker lets a probe
//! through again. State is process-local and cheap to consult.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed. An open breaker lets one probe through
    /// once the cooldown has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    // Half-open: allow the probe, stay open until it reports.
                    inner.state = BreakerState::Open {
                        until: Instant::now() + self.cooldown,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.state = BreakerState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.threshold {
            inner.state = BreakerState::Open {
                until: Instant::now() + self.cooldown,
            };
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, BreakerState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_probe_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.is_open());
        // Zero cooldown: the next call is the half-open probe.
        assert!(breaker.allow());
        breaker.record_success();
        assert!(!breaker.is_open());
    }
}
