//! Circuit breaker guarding the export path and the orchestrator.
//!
//! Three states: closed (normal), open (rejecting), half-open (probing).
//! Consecutive failures open the circuit; after the recovery window a bounded
//! number of probe requests are admitted, and enough probe successes close it
//! again. State transitions are logged at staged severities so an operator
//! watching the logs sees the failure approaching, the trip, and the
//! recovery.
//!
//! The fast path (`allow`, success/failure accounting in the steady state)
//! reads atomics only; transitions re-check under a mutex so concurrent
//! callers cannot double-transition.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Circuit breaker settings
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Whether the breaker is active; a disabled breaker always allows
    pub enabled: bool,
    /// Consecutive failures that open the circuit
    pub max_failures: u32,
    /// How long the circuit stays open before probing
    pub recovery_time: Duration,
    /// Probe admissions (and required successes) in the half-open window
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 5,
            recovery_time: Duration::from_secs(30),
            half_open_max: 2,
        }
    }
}

/// Three-state failure isolator.
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    half_open_probes: AtomicU32,
    timestamps: Mutex<Timestamps>,
}

#[derive(Debug, Default)]
struct Timestamps {
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_probes: AtomicU32::new(0),
            timestamps: Mutex::new(Timestamps::default()),
        }
    }

    /// Check whether a request should proceed.
    ///
    /// In the open state this also performs the open → half-open transition
    /// once the recovery window has elapsed. Half-open admits at most
    /// `half_open_max` probes; the excess is rejected.
    pub fn allow(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => true,
            STATE_OPEN => self.try_enter_half_open(),
            _ => {
                let probes = self.half_open_probes.fetch_add(1, Ordering::AcqRel);
                probes < self.config.half_open_max
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            STATE_HALF_OPEN => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(
                    circuit = self.name,
                    successes = successes,
                    required = self.config.half_open_max,
                    "half-open probe succeeded"
                );
                if successes >= self.config.half_open_max {
                    self.close_from_half_open();
                }
            }
            _ => {}
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        {
            let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
            timestamps.last_failure = Some(Instant::now());
        }

        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                self.log_closed_failure(failures);
                if failures >= self.config.max_failures {
                    self.open_from("closed", failures);
                }
            }
            STATE_HALF_OPEN => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                self.open_from("half-open", failures);
            }
            _ => {}
        }
    }

    /// Current state as a stable label
    pub fn state(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => "open",
            STATE_HALF_OPEN => "half-open",
            _ => "closed",
        }
    }

    /// Current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Force the breaker back to closed, clearing all counters
    pub fn reset(&self) {
        let _guard = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
        info!(circuit = self.name, "circuit breaker reset to closed");
    }

    fn try_enter_half_open(&self) -> bool {
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        // Re-check: another thread may have transitioned while we waited
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            drop(timestamps);
            return self.allow();
        }
        let recovered = timestamps
            .last_failure
            .map(|at| at.elapsed() >= self.config.recovery_time)
            .unwrap_or(true);
        if !recovered {
            return false;
        }
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_probes.store(1, Ordering::Release);
        self.state.store(STATE_HALF_OPEN, Ordering::Release);
        let open_for = timestamps
            .opened_at
            .map(|at| at.elapsed())
            .unwrap_or_default();
        info!(
            circuit = self.name,
            open_for_ms = open_for.as_millis() as u64,
            probes = self.config.half_open_max,
            "circuit breaker entering half-open, probing recovery"
        );
        true
    }

    fn open_from(&self, previous: &'static str, failures: u32) {
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.state.load(Ordering::Acquire);
        if current == STATE_OPEN {
            return;
        }
        self.state.store(STATE_OPEN, Ordering::Release);
        timestamps.opened_at = Some(Instant::now());
        warn!(
            circuit = self.name,
            previous_state = previous,
            failures = failures,
            recovery_ms = self.config.recovery_time.as_millis() as u64,
            "circuit breaker OPEN; requests rejected until the recovery window elapses. \
             Check the downstream endpoint and its logs"
        );
    }

    fn close_from_half_open(&self) {
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        if self.state.load(Ordering::Acquire) != STATE_HALF_OPEN {
            return;
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
        let downtime = timestamps
            .opened_at
            .take()
            .map(|at| at.elapsed())
            .unwrap_or_default();
        info!(
            circuit = self.name,
            recovered_after_ms = downtime.as_millis() as u64,
            "circuit breaker closed, downstream recovered"
        );
    }

    fn log_closed_failure(&self, failures: u32) {
        let max = self.config.max_failures;
        if failures == 1 {
            info!(circuit = self.name, "first failure recorded");
            return;
        }
        if max > 2 {
            // Halfway rounds up so odd thresholds warn past the midpoint
            let halfway = (max + 1) / 2;
            if failures == halfway || failures == max - 1 {
                warn!(
                    circuit = self.name,
                    failures = failures,
                    max_failures = max,
                    "circuit breaker approaching failure threshold"
                );
            }
        }
    }
}
