//! Per-operation-class circuit breaker.
//!
//! ```text
//! Closed    -> Open      consecutive failures reach the threshold
//! Open      -> HalfOpen  open period elapsed; the caller that notices is the probe
//! HalfOpen  -> Closed    probe succeeded
//! HalfOpen  -> Open      probe failed; open period grows by the escalation factor
//! ```
//!
//! Outcomes are reported with the [`Admission`] the request was given, so a
//! late result from a request admitted while the circuit was closed never
//! resolves a half-open probe.
//!
//! All state lives behind one mutex and every method holds it only for a
//! handful of field updates, so callers never observe a half-applied
//! transition and never hold the lock across an await point.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_OPEN_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_ESCALATION_FACTOR: f64 = 2.0;

/// Upper bound on a single open period. Keeps `Instant` arithmetic finite
/// after many failed probes.
const MAX_OPEN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub base_open_duration: Duration,
    /// Multiplier applied to the open period per consecutive failed probe.
    pub escalation_factor: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            base_open_duration: DEFAULT_OPEN_DURATION,
            escalation_factor: DEFAULT_ESCALATION_FACTOR,
        }
    }
}

/// Point-in-time view of a breaker, for logs and reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_half_open_failures: u32,
    pub current_open_duration_ms: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_half_open_failures: u32,
    current_open_duration: Duration,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

/// Ticket for one admitted request, handed back with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Admission {
    probe: bool,
}

impl Admission {
    /// Whether this request is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

pub struct CircuitBreaker {
    operation: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("operation", &self.operation)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, settings: BreakerSettings) -> Self {
        Self::with_clock(operation, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        operation: impl Into<String>,
        settings: BreakerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings = sanitize(settings);
        Self {
            operation: operation.into(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_half_open_failures: 0,
                current_open_duration: settings.base_open_duration,
                open_until: None,
                probe_in_flight: false,
            }),
            settings,
            clock,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Ask whether a request may proceed.
    ///
    /// Once the open period has elapsed, exactly one caller is admitted as the
    /// half-open probe; everyone else is rejected until that probe reports back.
    pub fn allow_request(&self) -> Option<Admission> {
        let now = self.clock.now();
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Some(Admission { probe: false }),
            CircuitState::Open => {
                if st.open_until.is_some_and(|until| now >= until) {
                    st.state = CircuitState::HalfOpen;
                    st.open_until = None;
                    st.probe_in_flight = true;
                    info!(operation = %self.operation, "circuit half-open, admitting probe");
                    Some(Admission { probe: true })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if st.probe_in_flight {
                    None
                } else {
                    st.probe_in_flight = true;
                    Some(Admission { probe: true })
                }
            }
        }
    }

    pub fn on_success(&self, admission: Admission) {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => st.consecutive_failures = 0,
            CircuitState::HalfOpen if admission.probe => {
                st.state = CircuitState::Closed;
                st.consecutive_failures = 0;
                st.consecutive_half_open_failures = 0;
                st.current_open_duration = self.settings.base_open_duration;
                st.open_until = None;
                st.probe_in_flight = false;
                info!(operation = %self.operation, "circuit closed after successful probe");
            }
            // A request admitted before the circuit opened finished late. Only
            // the probe decides when the circuit closes again.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self, admission: Admission) {
        let now = self.clock.now();
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                if st.consecutive_failures >= self.settings.failure_threshold {
                    st.state = CircuitState::Open;
                    st.current_open_duration = self.settings.base_open_duration;
                    st.open_until = Some(now + st.current_open_duration);
                    warn!(
                        operation = %self.operation,
                        failures = st.consecutive_failures,
                        open_ms = st.current_open_duration.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if admission.probe => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                st.consecutive_half_open_failures =
                    st.consecutive_half_open_failures.saturating_add(1);
                st.current_open_duration = escalated_duration(
                    self.settings.base_open_duration,
                    self.settings.escalation_factor,
                    st.consecutive_half_open_failures,
                );
                st.state = CircuitState::Open;
                st.open_until = Some(now + st.current_open_duration);
                st.probe_in_flight = false;
                warn!(
                    operation = %self.operation,
                    probe_failures = st.consecutive_half_open_failures,
                    open_ms = st.current_open_duration.as_millis() as u64,
                    "probe failed, circuit re-opened"
                );
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            }
        }
    }

    /// The request gave up without an outcome (cancelled, aborted or
    /// panicked). A probe hands its slot back so the next caller can take it.
    pub fn on_abandoned(&self, admission: Admission) {
        if !admission.probe {
            return;
        }
        let now = self.clock.now();
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen && st.probe_in_flight {
            st.state = CircuitState::Open;
            st.open_until = Some(now);
            st.probe_in_flight = false;
        }
    }

    /// Current state. An open breaker whose period has elapsed still reports
    /// `Open` until a caller claims the probe.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let st = self.lock();
        BreakerSnapshot {
            operation: self.operation.clone(),
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            consecutive_half_open_failures: st.consecutive_half_open_failures,
            current_open_duration_ms: st.current_open_duration.as_millis() as u64,
        }
    }

    /// Remaining time before the breaker will admit a probe, if open.
    pub fn remaining_open(&self) -> Option<Duration> {
        let now = self.clock.now();
        let st = self.lock();
        st.open_until.map(|until| until.saturating_duration_since(now))
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sanitize(mut settings: BreakerSettings) -> BreakerSettings {
    if settings.failure_threshold == 0 {
        settings.failure_threshold = DEFAULT_FAILURE_THRESHOLD;
    }
    if settings.base_open_duration.is_zero() {
        settings.base_open_duration = DEFAULT_OPEN_DURATION;
    }
    if !settings.escalation_factor.is_finite() || settings.escalation_factor <= 1.0 {
        settings.escalation_factor = DEFAULT_ESCALATION_FACTOR;
    }
    settings
}

/// `base * factor^probe_failures`, capped at [`MAX_OPEN_DURATION`].
fn escalated_duration(base: Duration, factor: f64, probe_failures: u32) -> Duration {
    let exponent = i32::try_from(probe_failures).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * factor.powi(exponent);
    if secs.is_finite() && secs < MAX_OPEN_DURATION.as_secs_f64() {
        Duration::from_secs_f64(secs)
    } else {
        MAX_OPEN_DURATION
    }
}

/// One breaker per operation class, created lazily and shared by every task
/// of that class for the lifetime of a run.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(operation.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(
                    operation,
                    self.settings.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }

    /// Snapshots of every breaker created so far, sorted by operation name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }
}
