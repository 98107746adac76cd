#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reviewpass::circuit_breaker::{BreakerSettings, CircuitBreaker};
use reviewpass::dispatcher::{DispatchConfig, Dispatcher};
use reviewpass::error::{Error, Result};
use reviewpass::retry::RetryPolicy;
use reviewpass::runner::{AgentRunner, RunResult};

/// One scripted reply: `Ok(stdout)` or `Err(message)`, optionally after a delay.
#[derive(Debug, Clone)]
pub struct Reply {
    pub delay: Duration,
    pub outcome: std::result::Result<String, String>,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(stdout.to_string()),
        }
    }

    pub fn err(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(message.to_string()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Runner that replays scripted replies per (agent, pass) and records
/// concurrency. Unscripted calls, or calls past the end of a script, get the
/// fallback reply.
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<(String, u32), VecDeque<Reply>>>,
    fallback: Reply,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new(fallback: Reply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn script(self, agent: &str, pass: u32, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert((agent.to_string(), pass), replies.into());
        self
    }

    fn next_reply(&self, agent: &str, pass: u32) -> Reply {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&(agent.to_string(), pass))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Decrements the in-flight counter even when the call is dropped mid-sleep.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AgentRunner for ScriptedRunner {
    async fn run(&self, agent_id: &str, pass_index: u32) -> Result<RunResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self.next_reply(agent_id, pass_index);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        match reply.outcome {
            Ok(stdout) => Ok(RunResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            }),
            Err(message) => Err(Error::AgentRunner(message)),
        }
    }
}

/// Retry policy with millisecond backoff so tests stay fast.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        ..RetryPolicy::default()
    }
}

pub fn dispatcher(parallelism: usize, timeout: Duration, max_attempts: u32) -> Dispatcher {
    let breaker = Arc::new(CircuitBreaker::new("review", BreakerSettings::default()));
    dispatcher_with_breaker(parallelism, timeout, max_attempts, breaker)
}

pub fn dispatcher_with_breaker(
    parallelism: usize,
    timeout: Duration,
    max_attempts: u32,
    breaker: Arc<CircuitBreaker>,
) -> Dispatcher {
    Dispatcher::new(
        DispatchConfig::default()
            .with_parallelism(parallelism)
            .with_task_timeout(timeout)
            .with_retry_policy(fast_policy(max_attempts)),
        breaker,
    )
}

pub const FINDINGS_A: &str = "### 1. [High] Unchecked index in parser\n**Location:** src/parse.rs:40\n\nIndexing panics on short input.\n\n### 2. [Low] Typo in log message\n**Location:** src/log.rs:7\n\nSays 'recieved'.\n";

/// Same findings as `FINDINGS_A`, reworded and reordered the way a second
/// pass might report them.
pub const FINDINGS_A_REWORDED: &str = "## Typo in a log message (low)\nFile: `./src/log.rs:7`\n\nSpelling of 'received'.\n\n## Parser indexes without a bounds check\nSeverity: high\nLocation: src/parse.rs:40\n\nShort input panics.\n";
