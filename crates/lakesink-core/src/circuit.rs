//! Circuit Breaker (§4.7): CLOSED/OPEN/HALF_OPEN state machine keyed by
//! service name, backed by a `DashMap` per the concurrency-model note in
//! SPEC_FULL.md §5.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{info, warn};

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_TIMEOUT: Duration = Duration::from_secs(60);
const SUCCESS_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-service counters backing the state machine. Plain atomics rather
/// than a mutex-guarded struct since each field only needs independent,
/// not cross-field-atomic, updates.
struct ServiceCircuit {
    state: parking_lot::Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at_epoch_ms: AtomicU64,
}

impl Default for ServiceCircuit {
    fn default() -> Self {
        Self {
            state: parking_lot::Mutex::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at_epoch_ms: AtomicU64::new(0),
        }
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared circuit-breaker registry for every downstream service the
/// connector calls (object store, schema registry, DLQ producer, ...).
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    services: DashMap<String, ServiceCircuit>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a call to `service` is currently permitted. Transitions
    /// OPEN -> HALF_OPEN when the open timeout has elapsed.
    pub fn allow(&self, service: &str) -> bool {
        let entry = self.services.entry(service.to_string()).or_default();
        let mut state = entry.state.lock();
        match *state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = now_epoch_ms().saturating_sub(entry.opened_at_epoch_ms.load(Ordering::SeqCst));
                if elapsed >= OPEN_TIMEOUT.as_millis() as u64 {
                    *state = CircuitState::HalfOpen;
                    entry.half_open_successes.store(0, Ordering::SeqCst);
                    info!(service, "circuit breaker entering half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, service: &str) {
        let entry = self.services.entry(service.to_string()).or_default();
        let mut state = entry.state.lock();
        match *state {
            CircuitState::Closed => {
                entry.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = entry.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= SUCCESS_THRESHOLD {
                    *state = CircuitState::Closed;
                    entry.consecutive_failures.store(0, Ordering::SeqCst);
                    info!(service, "circuit breaker closed after recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, service: &str) {
        let entry = self.services.entry(service.to_string()).or_default();
        let mut state = entry.state.lock();
        match *state {
            CircuitState::Closed => {
                let failures = entry.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= FAILURE_THRESHOLD {
                    *state = CircuitState::Open;
                    entry.opened_at_epoch_ms.store(now_epoch_ms(), Ordering::SeqCst);
                    warn!(service, failures, "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                entry.opened_at_epoch_ms.store(now_epoch_ms(), Ordering::SeqCst);
                entry.consecutive_failures.store(FAILURE_THRESHOLD, Ordering::SeqCst);
                warn!(service, "probe failed in half-open, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state_of(&self, service: &str) -> CircuitState {
        self.services
            .get(service)
            .map(|e| *e.state.lock())
            .unwrap_or(CircuitState::Closed)
    }
}
