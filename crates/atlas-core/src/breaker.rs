//! Per-backend circuit breaker.
//!
//! CLOSED counts consecutive failures; at the threshold the breaker
//! OPENs and short-circuits calls with a `circuit_open` error that is
//! distinguishable from the underlying failure. After the reset
//! timeout the next call probes in HALF_OPEN: success closes the
//! breaker, failure re-opens it.
//!
//! The state is a small mutex-protected struct; the lock is never held
//! across the wrapped call.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{AtlasError, AtlasResult};

/// Default consecutive-failure threshold.
pub const DEFAULT_THRESHOLD: u32 = 5;
/// Default open-state reset timeout.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through; failures are counted.
    Closed,
    /// Calls short-circuit until the reset timeout elapses.
    Open,
    /// One probe call is in flight.
    HalfOpen,
}

impl BreakerState {
    /// Display string for status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Failure-tracking wrapper around calls to one named backend.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// A breaker with explicit threshold and reset timeout.
    pub fn new(name: impl Into<String>, threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    /// A breaker with the default threshold (5) and reset timeout (60s).
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_THRESHOLD, DEFAULT_RESET_TIMEOUT)
    }

    /// The backend name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (for diagnostics).
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive failures recorded while closed.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Force the breaker back to CLOSED (operator repair action).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        tracing::info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Run `f` through the breaker.
    ///
    /// In OPEN state the call short-circuits before `f` is invoked.
    pub fn call<T, F>(&self, f: F) -> AtlasResult<T>
    where
        F: FnOnce() -> AtlasResult<T>,
    {
        // Admission check; the lock is released before `f` runs.
        {
            let mut inner = self.inner.lock();
            if inner.state == BreakerState::Open {
                let elapsed = inner.opened_at.map(|at| at.elapsed());
                if elapsed.is_some_and(|e| e >= self.reset_timeout) {
                    inner.state = BreakerState::HalfOpen;
                    tracing::debug!(breaker = %self.name, "breaker half-open, probing");
                } else {
                    return Err(AtlasError::CircuitOpen { backend: self.name.clone() });
                }
            }
        }

        match f() {
            Ok(value) => {
                let mut inner = self.inner.lock();
                if inner.state != BreakerState::Closed {
                    tracing::info!(breaker = %self.name, "breaker closed after successful probe");
                }
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                Ok(value)
            }
            Err(err) => {
                let mut inner = self.inner.lock();
                match inner.state {
                    BreakerState::HalfOpen => {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        tracing::warn!(breaker = %self.name, "probe failed, breaker re-opened");
                    }
                    _ => {
                        inner.failure_count += 1;
                        if inner.failure_count >= self.threshold {
                            inner.state = BreakerState::Open;
                            inner.opened_at = Some(Instant::now());
                            tracing::warn!(
                                breaker = %self.name,
                                failures = inner.failure_count,
                                "failure threshold reached, breaker opened"
                            );
                        }
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn failing() -> AtlasResult<()> {
        Err(AtlasError::Internal("backend down".into()))
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("vector", 3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(breaker.call(failing).is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Short-circuits before invoking the inner action.
        let mut invoked = false;
        let result = breaker.call(|| {
            invoked = true;
            Ok(())
        });
        assert!(!invoked, "open breaker must not invoke the action");
        match result {
            Err(e) => assert_eq!(e.kind(), ErrorKind::CircuitOpen),
            Ok(()) => panic!("expected circuit_open error"),
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("metadata", 3, Duration::from_secs(60));
        assert!(breaker.call(failing).is_err());
        assert!(breaker.call(failing).is_err());
        assert!(breaker.call(|| Ok(())).is_ok());
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("graph", 1, Duration::from_millis(0));
        assert!(breaker.call(failing).is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        // Zero reset timeout: the next call probes immediately.
        assert!(breaker.call(|| Ok(())).is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("graph", 1, Duration::from_millis(0));
        assert!(breaker.call(failing).is_err());
        assert!(breaker.call(failing).is_err()); // probe fails
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_reset_forces_closed() {
        let breaker = CircuitBreaker::new("vector", 1, Duration::from_secs(60));
        assert!(breaker.call(failing).is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.call(|| Ok(())).is_ok());
    }

    #[test]
    fn test_underlying_error_passes_through_while_closed() {
        let breaker = CircuitBreaker::with_defaults("vector");
        let err = breaker.call(failing).expect_err("fails");
        assert_eq!(err.kind(), ErrorKind::Execution);
    }
}
