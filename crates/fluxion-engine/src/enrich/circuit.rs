//! Per-endpoint circuit breaker shared by every call to the same endpoint.
//!
//! State lives in atomics so concurrent workers never block on it:
//! `Closed -> Open` when consecutive failures reach the threshold,
//! `Open -> HalfOpen` for exactly one caller once the cool-down has elapsed,
//! and the probe's outcome decides between `Closed` and `Open` again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOL_DOWN_MS: u64 = 10_000;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Breaker tuning, configured per `httpCall` as `circuitBreaker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitSettings {
    #[serde(alias = "failureThreshold")]
    pub failure_threshold: u32,
    #[serde(alias = "coolDownMs")]
    pub cool_down_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cool_down_ms: DEFAULT_COOL_DOWN_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Proof that a call may proceed. A probe decides the half-open outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    settings: CircuitSettings,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    open_until_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, settings: CircuitSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    #[must_use]
    pub fn settings(&self) -> CircuitSettings {
        self.settings
    }

    /// Ask to make a call. `None` means the circuit is open and the call
    /// must be short-circuited without touching the network.
    pub fn try_acquire(&self) -> Option<Permit> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Some(Permit::Normal),
            OPEN => {
                if self.now_ms() < self.open_until_ms.load(Ordering::Acquire) {
                    return None;
                }
                self.state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .ok()
                    .map(|_| {
                        tracing::info!(endpoint = %self.endpoint, "Circuit half-open, sending probe");
                        Permit::Probe
                    })
            }
            // A probe is already in flight.
            _ => None,
        }
    }

    /// The endpoint answered (including terminal 4xx answers).
    pub fn on_success(&self, permit: Permit) {
        self.consecutive_failures.store(0, Ordering::Release);
        if permit == Permit::Probe
            && self
                .state
                .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::info!(endpoint = %self.endpoint, "Circuit closed after successful probe");
        }
    }

    /// The endpoint failed with a retryable error.
    pub fn on_failure(&self, permit: Permit) {
        match permit {
            Permit::Probe => {
                self.open_until_ms.store(self.deadline_ms(), Ordering::Release);
                self.state.store(OPEN, Ordering::Release);
                tracing::warn!(
                    endpoint = %self.endpoint,
                    cool_down_ms = self.settings.cool_down_ms,
                    "Circuit probe failed, re-opening"
                );
            }
            Permit::Normal => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures < self.settings.failure_threshold
                    || self.state.load(Ordering::Acquire) != CLOSED
                {
                    return;
                }
                self.open_until_ms.store(self.deadline_ms(), Ordering::Release);
                if self
                    .state
                    .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        failures,
                        cool_down_ms = self.settings.cool_down_ms,
                        "Circuit opened"
                    );
                }
            }
        }
    }

    /// A call holding `permit` was dropped before it finished. An abandoned
    /// probe re-opens the circuit with an expired deadline so the next caller
    /// can probe again.
    pub fn abandon(&self, permit: Permit) {
        if permit == Permit::Probe {
            self.open_until_ms.store(self.now_ms(), Ordering::Release);
            let _ = self.state.compare_exchange(
                HALF_OPEN,
                OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Force the breaker back to `Closed`.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.open_until_ms.store(0, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn deadline_ms(&self) -> u64 {
        self.now_ms().saturating_add(self.settings.cool_down_ms)
    }
}

/// Breakers keyed by endpoint (`METHOD url-template`).
///
/// Pipelines compiled against the same registry share breakers, so failures
/// observed by one run protect every other caller of the endpoint.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Breaker for `endpoint`, created with `settings` on first use.
    /// Later callers share the first caller's settings.
    pub fn breaker(&self, endpoint: &str, settings: CircuitSettings) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, settings))),
        )
    }

    #[must_use]
    pub fn get(&self, endpoint: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }

    /// Close every breaker and forget accumulated failures.
    pub fn reset(&self) {
        for breaker in self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            breaker.reset();
        }
    }
}
