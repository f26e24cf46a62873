//! Circuit breaker for the two external services (ICAP scanner, backend).
//!
//! # States
//!
//! - **Closed**: normal operation, failures are counted.
//! - **Open**: the service is failing; calls are rejected immediately until
//!   the recovery timeout elapses.
//! - **Half-open**: probing; the next call goes through, a success closes
//!   the circuit, a failure re-opens it.

use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Current state of a breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker, for logs and tests.
#[derive(Clone, Copy, Debug)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failures: u32,
}

#[derive(Clone, Copy, Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// A failure-rate gate in front of a downstream dependency.
///
/// Two process-wide instances exist, one per external service. State
/// updates are a compare-and-update behind a lock; the lock is only held
/// for the transition itself.
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            recovery_timeout,
            state: RwLock::new(Inner::Closed { failures: 0 }),
        }
    }

    /// Checks whether a call may proceed. An open circuit whose recovery
    /// timeout has elapsed transitions to half-open and admits the call as
    /// a probe.
    pub fn check(&self) -> Result<(), Duration> {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            Inner::Closed { .. } | Inner::HalfOpen => Ok(()),
            Inner::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    *state = Inner::HalfOpen;
                    tracing::info!(service = self.name, "Circuit half-open, probing");
                    Ok(())
                } else {
                    Err(until - now)
                }
            }
        }
    }

    /// Records a successful call. Closes the circuit from half-open and
    /// resets the failure count.
    pub fn record_success(&self) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(*state, Inner::HalfOpen) {
            tracing::info!(service = self.name, "Circuit closed after probe success");
        }
        *state = Inner::Closed { failures: 0 };
    }

    /// Records a failed call. Opens the circuit once the threshold is
    /// reached; any failure in half-open re-opens it.
    pub fn record_failure(&self) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    *state = Inner::Open {
                        until: Instant::now() + self.recovery_timeout,
                    };
                    tracing::warn!(
                        service = self.name,
                        failures,
                        recovery_secs = self.recovery_timeout.as_secs(),
                        "Circuit opened"
                    );
                } else {
                    *state = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen => {
                *state = Inner::Open {
                    until: Instant::now() + self.recovery_timeout,
                };
                tracing::warn!(service = self.name, "Circuit re-opened after probe failure");
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            Inner::Closed { failures } => BreakerSnapshot {
                state: BreakerState::Closed,
                failures,
            },
            Inner::Open { .. } => BreakerSnapshot {
                state: BreakerState::Open,
                failures: 0,
            },
            Inner::HalfOpen => BreakerSnapshot {
                state: BreakerState::HalfOpen,
                failures: 0,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
