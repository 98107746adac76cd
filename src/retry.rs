//! Retry executor: runs one logical operation up to `max_attempts` times,
//! gated by a shared circuit breaker, with equal-jitter backoff in between.
//!
//! Every attempt outcome is reported back to the breaker except a rejection
//! by the breaker itself, which already knows the dependency is unhealthy.

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backoff;
use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::error::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(30_000);

/// Decides whether a failure message should be retried.
pub type Classifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Anything the executor can retry: it must be able to say whether it
/// succeeded and, if not, why.
pub trait RetryOutcome {
    fn is_success(&self) -> bool;
    fn error_message(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Applied to each attempt individually, measured from the attempt start.
    pub attempt_timeout: Option<Duration>,
    /// Extra substrings (case-insensitive) that make a failure fatal.
    pub non_retryable_markers: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES + 1,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            attempt_timeout: None,
            non_retryable_markers: Vec::new(),
        }
    }
}

/// Final result of one executor run.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome<T> {
    pub success: bool,
    /// The last result produced, failure-shaped when `success` is false.
    pub value: T,
    pub error_message: Option<String>,
    /// Attempts that actually reached the operation. A breaker rejection
    /// before the first attempt reports zero.
    pub attempts_used: u32,
}

impl<T: RetryOutcome> AttemptOutcome<T> {
    fn from_value(value: T, attempts_used: u32) -> Self {
        Self {
            success: value.is_success(),
            error_message: value.error_message().map(str::to_string),
            value,
            attempts_used,
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    classifier: Classifier,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy,
            breaker,
            classifier: Arc::new(is_retryable),
            shutdown: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Abandon the operation (and any pending backoff) once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: Option<watch::Receiver<bool>>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. Errors it returns, as
    /// well as breaker rejections, timeouts and interruptions, are turned into
    /// failure-shaped results through `map_error`.
    pub async fn execute<T, F, Fut, M>(
        &self,
        label: &str,
        mut operation: F,
        map_error: M,
    ) -> AttemptOutcome<T>
    where
        T: RetryOutcome,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        M: Fn(Error) -> T,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 1u32;

        loop {
            if shutdown_requested(shutdown.as_ref()) {
                return AttemptOutcome::from_value(map_error(Error::Interrupted), attempt - 1);
            }

            let Some(admission) = self.breaker.allow_request() else {
                warn!(
                    label,
                    operation = self.breaker.operation(),
                    remaining_ms = self
                        .breaker
                        .remaining_open()
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                    "circuit breaker open, failing fast"
                );
                let err = Error::CircuitOpen {
                    operation: self.breaker.operation().to_string(),
                };
                return AttemptOutcome::from_value(map_error(err), attempt - 1);
            };
            let ticket = AdmissionGuard::new(&self.breaker, admission);

            let result = match self.run_attempt(&mut operation, attempt, &mut shutdown).await {
                Ok(value) => value,
                Err(Error::Interrupted) => {
                    drop(ticket);
                    return AttemptOutcome::from_value(map_error(Error::Interrupted), attempt);
                }
                Err(e) => map_error(e),
            };

            if result.is_success() {
                ticket.succeeded();
                debug!(label, attempt, "attempt succeeded");
                return AttemptOutcome::from_value(result, attempt);
            }

            ticket.failed();
            let message = result.error_message().unwrap_or("unknown error").to_string();

            if !self.should_retry(&message) {
                warn!(label, attempt, error = %message, "non-retryable failure");
                return AttemptOutcome::from_value(result, attempt);
            }

            if attempt >= max_attempts {
                warn!(label, attempt, error = %message, "retries exhausted");
                return AttemptOutcome::from_value(result, attempt);
            }

            let wait = backoff::delay(
                attempt as i32,
                self.policy.backoff_base,
                self.policy.backoff_cap,
            );
            warn!(
                label,
                attempt,
                max_attempts,
                delay_ms = wait.as_millis() as u64,
                error = %message,
                "retrying after transient failure"
            );

            if sleep_or_shutdown(wait, &mut shutdown).await {
                // The shutdown flag stays set on the channel; callers further up
                // still see it. Hand back the last real failure.
                return AttemptOutcome::from_value(result, attempt);
            }

            attempt += 1;
        }
    }

    async fn run_attempt<T, F, Fut>(
        &self,
        operation: &mut F,
        attempt: u32,
        shutdown: &mut Option<watch::Receiver<bool>>,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let fut = operation(attempt);
        let timed = async {
            match self.policy.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .unwrap_or(Err(Error::Timeout(limit))),
                None => fut.await,
            }
        };

        tokio::select! {
            result = timed => result,
            _ = wait_for_shutdown(shutdown) => Err(Error::Interrupted),
        }
    }

    fn should_retry(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        if self
            .policy
            .non_retryable_markers
            .iter()
            .any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
        {
            return false;
        }
        (self.classifier)(message)
    }
}

/// Reports one admitted attempt back to the breaker. Dropped without an
/// outcome (cancelled, aborted or unwound by a panic) it abandons the
/// admission, which frees a held half-open probe.
struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl<'a> AdmissionGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            admission: Some(admission),
        }
    }

    fn succeeded(mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.on_success(admission);
        }
    }

    fn failed(mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.on_failure(admission);
        }
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.on_abandoned(admission);
        }
    }
}

static RETRYABLE_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:429|5\d\d)\b").expect("valid regex"));
static FATAL_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:400|401|403|422)\b").expect("valid regex"));

const FATAL_MARKERS: &[&str] = &[
    "invalid api key",
    "invalid request",
    "invalid argument",
    "validation",
    "malformed",
    "missing required",
    "missing parameter",
    "unauthorized",
    "forbidden",
    "authentication",
    "not authenticated",
    "permission denied",
    "api key",
    "bad request",
    "circuit breaker is open",
    "interrupted",
    // Local failures that another attempt cannot fix.
    "prompt error",
    "failed to spawn",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "temporarily unavailable",
    "service unavailable",
    "overloaded",
    "server error",
    "network",
];

/// Default retryability classifier.
///
/// Validation, auth and malformed-input failures are fatal even when the
/// message also mentions something transient. Everything else coming back
/// from the remote service is presumed transient.
pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) || FATAL_STATUS.is_match(&lower) {
        return false;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) || RETRYABLE_STATUS.is_match(&lower) {
        return true;
    }
    true
}

pub(crate) fn shutdown_requested(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

/// Resolves once the shutdown flag is (or becomes) true. Never resolves when
/// there is no receiver or the sender has gone away without signalling.
pub(crate) async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Returns true when interrupted by shutdown before `duration` elapsed.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut Option<watch::Receiver<bool>>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = wait_for_shutdown(shutdown) => true,
    }
}
