//! Per-operation circuit breakers.
//!
//! One breaker guards each `provider:operation` pair so an outage in one
//! backend operation never blocks the others. State transitions follow the
//! classic three-state machine: CLOSED opens after a run of consecutive
//! failures, OPEN admits a single probe once the reset timeout elapses, and
//! the probe's outcome decides between CLOSED and OPEN.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RESET_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_HALF_OPEN_MAX: u32 = 1;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub reset_timeout_ms: u64,
    /// Probes admitted while half-open.
    pub half_open_max: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            half_open_max: DEFAULT_HALF_OPEN_MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Lock-free circuit breaker. Safe to share across worker threads; all
/// transitions go through atomics with `compare_exchange` guarding the
/// open-to-half-open edge so only one caller arms the probe window.
pub struct CircuitBreaker {
    /// 0=CLOSED, 1=OPEN, 2=HALF_OPEN
    state: AtomicU8,
    failure_count: AtomicU32,
    /// Unix millis when the circuit last opened.
    opened_at_ms: AtomicU64,
    half_open_probes: AtomicU32,
    config: CircuitConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            half_open_probes: AtomicU32::new(0),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitConfig::default())
    }

    /// Whether a call may proceed right now. An expired open window
    /// transitions to half-open as a side effect and admits the caller as
    /// the probe.
    pub fn can_execute(&self) -> bool {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => true,
            STATE_OPEN => {
                let opened_at = self.opened_at_ms.load(Ordering::SeqCst);
                let elapsed = now_ms().saturating_sub(opened_at);
                if elapsed < self.config.reset_timeout_ms {
                    return false;
                }
                if self
                    .state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    self.half_open_probes.store(0, Ordering::SeqCst);
                }
                self.half_open_probes.fetch_add(1, Ordering::SeqCst) < self.config.half_open_max
            }
            STATE_HALF_OPEN => {
                self.half_open_probes.fetch_add(1, Ordering::SeqCst) < self.config.half_open_max
            }
            _ => false,
        }
    }

    /// A success closes a half-open circuit and clears the failure run.
    pub fn record_success(&self) {
        let state = self.state.load(Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        if state == STATE_HALF_OPEN {
            self.state.store(STATE_CLOSED, Ordering::SeqCst);
        }
    }

    /// A failure extends the run; at the threshold (or during a probe) the
    /// circuit opens.
    pub fn record_failure(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            STATE_HALF_OPEN => self.open(),
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Milliseconds until the open window expires; zero when not open.
    pub fn open_remaining_ms(&self) -> u64 {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return 0;
        }
        let opened_at = self.opened_at_ms.load(Ordering::SeqCst);
        self.config
            .reset_timeout_ms
            .saturating_sub(now_ms().saturating_sub(opened_at))
    }

    /// Retry-after hint for a denied caller. While open this is the
    /// remaining window; a half-open denial (probe slot already taken)
    /// reports the full reset timeout, the worst case if the probe fails.
    pub fn retry_after_hint_ms(&self) -> u64 {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => self.open_remaining_ms().max(1),
            _ => self.config.reset_timeout_ms,
        }
    }

    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.half_open_probes.store(0, Ordering::SeqCst);
    }

    fn open(&self) {
        self.state.store(STATE_OPEN, Ordering::SeqCst);
        self.opened_at_ms.store(now_ms(), Ordering::SeqCst);
        self.half_open_probes.store(0, Ordering::SeqCst);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Breaker registry keyed by `provider:operation`. Breakers are created
/// lazily on first use and never removed.
pub struct CircuitRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitConfig,
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Fraction of known breakers currently open. Zero when none are
    /// registered yet. Drives service-level auto-adjustment.
    pub fn unhealthy_ratio(&self) -> f64 {
        let breakers = self.breakers.lock().expect("breaker lock poisoned");
        if breakers.is_empty() {
            return 0.0;
        }
        let open = breakers.values().filter(|b| b.is_open()).count();
        open as f64 / breakers.len() as f64
    }

    /// Per-breaker state snapshot for the health endpoint.
    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .lock()
            .expect("breaker lock poisoned")
            .iter()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn fast_config(threshold: u32, reset_ms: u64) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
            half_open_max: 1,
        }
    }

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new(fast_config(3, 1000));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
        assert_eq!(breaker.failure_count(), 2);
    }

    #[test]
    fn opens_at_threshold_and_blocks() {
        let breaker = CircuitBreaker::new(fast_config(3, 60_000));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        assert!(!breaker.can_execute());
        assert!(breaker.open_remaining_ms() > 0);
    }

    #[test]
    fn success_resets_the_failure_run() {
        let breaker = CircuitBreaker::new(fast_config(3, 1000));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(fast_config(1, 20));
        breaker.record_failure();
        assert!(!breaker.can_execute());

        thread::sleep(Duration::from_millis(30));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn probe_outcome_decides_next_state() {
        let breaker = CircuitBreaker::new(fast_config(1, 10));
        breaker.record_failure();
        thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn denial_hint_tracks_breaker_state() {
        let breaker = CircuitBreaker::new(fast_config(1, 40));
        breaker.record_failure();
        let hint = breaker.retry_after_hint_ms();
        assert!((1..=40).contains(&hint));

        thread::sleep(Duration::from_millis(50));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // The probe slot is taken; the next caller waits a full window.
        assert!(!breaker.can_execute());
        assert_eq!(breaker.retry_after_hint_ms(), 40);
    }

    #[test]
    fn registry_tracks_open_ratio() {
        let registry = CircuitRegistry::new(fast_config(1, 60_000));
        assert_eq!(registry.unhealthy_ratio(), 0.0);

        let a = registry.get("responses:create_response");
        let b = registry.get("converse:create_response");
        assert!(Arc::ptr_eq(&a, &registry.get("responses:create_response")));

        a.record_failure();
        assert_eq!(registry.unhealthy_ratio(), 0.5);
        b.record_failure();
        assert_eq!(registry.unhealthy_ratio(), 1.0);

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.get("responses:create_response"),
            Some(&CircuitState::Open)
        );
    }
}
