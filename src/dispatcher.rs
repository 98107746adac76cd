use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::Error;
use crate::findings::Finding;
use crate::retry::{
    Classifier, RetryExecutor, RetryOutcome, RetryPolicy, is_retryable, shutdown_requested,
    wait_for_shutdown,
};
use crate::runner::AgentRunner;

pub const DEFAULT_PARALLELISM: usize = 4;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of one (agent, pass) task or, after merging, of a whole agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewResult {
    pub agent_id: String,
    /// `None` once the result has been merged across passes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_index: Option<u32>,
    pub success: bool,
    pub content: Option<String>,
    pub error_message: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
}

impl ReviewResult {
    pub fn success(agent_id: impl Into<String>, pass_index: u32, content: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            pass_index: Some(pass_index),
            success: true,
            content: Some(content.into()),
            error_message: None,
            timestamp: now_millis(),
            attempts: 0,
            findings: Vec::new(),
        }
    }

    pub fn failure(agent_id: impl Into<String>, pass_index: u32, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            pass_index: Some(pass_index),
            success: false,
            content: None,
            error_message: Some(error.into()),
            timestamp: now_millis(),
            attempts: 0,
            findings: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl RetryOutcome for ReviewResult {
    fn is_success(&self) -> bool {
        self.success
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One agent to dispatch: its invocation capability and how many passes to run.
/// Agent ids must be unique within a dispatch.
pub struct AgentSpec<R> {
    pub id: String,
    pub runner: Arc<R>,
    pub passes: u32,
}

impl<R> AgentSpec<R> {
    pub fn new(id: impl Into<String>, runner: Arc<R>, passes: u32) -> Self {
        Self {
            id: id.into(),
            runner,
            passes,
        }
    }
}

/// A single (agent, pass) unit of work. Consumed by exactly one spawned task.
struct Task<R> {
    agent_id: String,
    pass_index: u32,
    runner: Arc<R>,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub parallelism: usize,
    /// Limit on each attempt of a task, measured from when the attempt starts.
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Runs every (agent, pass) combination with at most `parallelism` tasks in
/// flight, each through its own retry executor against one shared breaker.
pub struct Dispatcher {
    config: DispatchConfig,
    breaker: Arc<CircuitBreaker>,
    classifier: Classifier,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            breaker,
            classifier: Arc::new(is_retryable),
            shutdown: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Dispatch all tasks and return one result per (agent, pass), ordered by
    /// agent input order and then pass index.
    ///
    /// Every task outcome is captured as a `ReviewResult`. Tasks that never
    /// ran because the run was cancelled come back as `interrupted` failures.
    pub async fn dispatch<R: AgentRunner>(&self, agents: &[AgentSpec<R>]) -> Vec<ReviewResult> {
        let tasks = expand_tasks(agents);
        let keys: Vec<(String, u32)> = tasks
            .iter()
            .map(|t| (t.agent_id.clone(), t.pass_index))
            .collect();
        let parallelism = self.config.parallelism.max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut shutdown = self.shutdown.clone();

        let mut policy = self.config.retry.clone();
        policy.attempt_timeout = Some(self.config.task_timeout);

        info!(
            agents = agents.len(),
            tasks = tasks.len(),
            parallelism,
            "dispatching review tasks"
        );

        let mut join_set = JoinSet::new();
        let mut task_keys = HashMap::new();

        for task in tasks {
            // Take the slot before spawning so no more than `parallelism`
            // tasks exist at once.
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    warn!("dispatch cancelled, not starting remaining tasks");
                    break;
                }
            };

            let executor = RetryExecutor::new(policy.clone(), Arc::clone(&self.breaker))
                .with_classifier(Arc::clone(&self.classifier))
                .with_shutdown(self.shutdown.clone());
            let key = (task.agent_id.clone(), task.pass_index);

            let handle = join_set.spawn(async move {
                let _permit = permit;
                run_task(task, executor).await
            });
            task_keys.insert(handle.id(), key);
        }

        let mut collected: HashMap<(String, u32), ReviewResult> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    if let Some(pass_index) = result.pass_index {
                        collected.insert((result.agent_id.clone(), pass_index), result);
                    }
                }
                Err(e) => {
                    let Some((agent_id, pass_index)) = task_keys.remove(&e.id()) else {
                        continue;
                    };
                    warn!(agent = %agent_id, pass = pass_index, error = %e, "review task aborted");
                    let result =
                        ReviewResult::failure(&agent_id, pass_index, format!("task failed: {e}"));
                    collected.insert((agent_id, pass_index), result);
                }
            }
        }

        let cancelled = shutdown_requested(self.shutdown.as_ref());
        keys.into_iter()
            .map(|(agent_id, pass_index)| {
                collected
                    .remove(&(agent_id.clone(), pass_index))
                    .unwrap_or_else(|| {
                        let reason = if cancelled {
                            Error::Interrupted.to_string()
                        } else {
                            "task did not complete".to_string()
                        };
                        ReviewResult::failure(agent_id, pass_index, reason)
                    })
            })
            .collect()
    }
}

fn expand_tasks<R>(agents: &[AgentSpec<R>]) -> Vec<Task<R>> {
    agents
        .iter()
        .flat_map(|agent| {
            (1..=agent.passes.max(1)).map(move |pass_index| Task {
                agent_id: agent.id.clone(),
                pass_index,
                runner: Arc::clone(&agent.runner),
            })
        })
        .collect()
}

async fn run_task<R: AgentRunner>(task: Task<R>, executor: RetryExecutor) -> ReviewResult {
    let Task {
        agent_id,
        pass_index,
        runner,
    } = task;
    let label = format!("{agent_id}#{pass_index}");
    let runner = &runner;
    let agent = agent_id.as_str();

    debug!(agent, pass = pass_index, "review task started");

    let outcome = executor
        .execute(
            &label,
            |_attempt| async move {
                runner
                    .run(agent, pass_index)
                    .await
                    .map(|output| ReviewResult::success(agent, pass_index, output.stdout))
            },
            |e| ReviewResult::failure(agent, pass_index, e.to_string()),
        )
        .await;

    if outcome.success {
        info!(agent, pass = pass_index, attempts = outcome.attempts_used, "pass complete");
    } else {
        warn!(
            agent,
            pass = pass_index,
            attempts = outcome.attempts_used,
            error = outcome.error_message.as_deref().unwrap_or("unknown error"),
            "pass failed"
        );
    }

    outcome.value.with_attempts(outcome.attempts_used)
}
