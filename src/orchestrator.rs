use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::circuit_breaker::{BreakerRegistry, BreakerSnapshot};
use crate::dispatcher::{AgentSpec, DispatchConfig, Dispatcher, ReviewResult};
use crate::error::{Error, Result};
use crate::merger::ResultMerger;
use crate::report;
use crate::retry::{Classifier, RetryExecutor, RetryOutcome, is_retryable, shutdown_requested};
use crate::runner::{AgentRunner, Summarizer};

/// Operation class shared by every review pass.
pub const REVIEW_OPERATION: &str = "review";
/// Operation class of the summary step.
pub const SUMMARY_OPERATION: &str = "summary";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryOutcome {
    pub success: bool,
    pub content: Option<String>,
    pub error_message: Option<String>,
    pub attempts: u32,
}

impl SummaryOutcome {
    fn success(content: String) -> Self {
        Self {
            success: true,
            content: Some(content),
            error_message: None,
            attempts: 0,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error_message: Some(error.into()),
            attempts: 0,
        }
    }
}

impl RetryOutcome for SummaryOutcome {
    fn is_success(&self) -> bool {
        self.success
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub target: String,
    /// One merged result per requested agent, in request order.
    pub results: Vec<ReviewResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryOutcome>,
    pub breakers: Vec<BreakerSnapshot>,
}

impl RunReport {
    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| !r.success)
    }
}

/// Dispatch, merge, then optionally summarize.
pub struct ReviewOrchestrator<R, S> {
    target: String,
    agents: Vec<AgentSpec<R>>,
    summarizer: Option<Arc<S>>,
    dispatch: DispatchConfig,
    registry: Arc<BreakerRegistry>,
    merger: ResultMerger,
    classifier: Classifier,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<R: AgentRunner, S: Summarizer> ReviewOrchestrator<R, S> {
    pub fn new(
        target: impl Into<String>,
        agents: Vec<AgentSpec<R>>,
        dispatch: DispatchConfig,
        registry: Arc<BreakerRegistry>,
        merger: ResultMerger,
    ) -> Self {
        Self {
            target: target.into(),
            agents,
            summarizer: None,
            dispatch,
            registry,
            merger,
            classifier: Arc::new(is_retryable),
            shutdown: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: S) -> Self {
        self.summarizer = Some(Arc::new(summarizer));
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn run(&self) -> Result<RunReport> {
        let mut dispatcher = Dispatcher::new(
            self.dispatch.clone(),
            self.registry.get(REVIEW_OPERATION),
        )
        .with_classifier(Arc::clone(&self.classifier));
        if let Some(ref shutdown) = self.shutdown {
            dispatcher = dispatcher.with_shutdown(shutdown.clone());
        }

        let pass_results = dispatcher.dispatch(&self.agents).await;
        self.check_shutdown(&pass_results)?;

        let results = self.merger.merge(pass_results);
        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            agents = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            "review passes merged"
        );

        let summary = match self.summarizer {
            Some(ref summarizer) => Some(self.summarize(summarizer, &results).await),
            None => None,
        };
        if shutdown_requested(self.shutdown.as_ref()) {
            return Err(Error::Interrupted);
        }

        let breakers = self.registry.snapshots();
        report::log_breakers(&breakers);

        Ok(RunReport {
            target: self.target.clone(),
            results,
            summary,
            breakers,
        })
    }

    fn check_shutdown(&self, pass_results: &[ReviewResult]) -> Result<()> {
        if !shutdown_requested(self.shutdown.as_ref()) {
            return Ok(());
        }
        let completed = pass_results.iter().filter(|r| r.success).count();
        warn!(
            completed,
            total = pass_results.len(),
            "run cancelled, discarding partial results"
        );
        Err(Error::Interrupted)
    }

    async fn summarize(&self, summarizer: &Arc<S>, results: &[ReviewResult]) -> SummaryOutcome {
        let mut policy = self.dispatch.retry.clone();
        policy.attempt_timeout = Some(self.dispatch.task_timeout);

        let executor = RetryExecutor::new(policy, self.registry.get(SUMMARY_OPERATION))
            .with_classifier(Arc::clone(&self.classifier))
            .with_shutdown(self.shutdown.clone());

        let review_report = report::render_results_markdown(results);
        let review_report = review_report.as_str();
        let summarizer = summarizer.as_ref();

        let outcome = executor
            .execute(
                SUMMARY_OPERATION,
                move |_attempt| async move {
                    summarizer
                        .summarize(review_report)
                        .await
                        .map(|output| SummaryOutcome::success(output.stdout))
                },
                |e| SummaryOutcome::failure(e.to_string()),
            )
            .await;

        if outcome.success {
            info!(attempts = outcome.attempts_used, "summary complete");
        } else {
            warn!(
                attempts = outcome.attempts_used,
                error = outcome.error_message.as_deref().unwrap_or("unknown error"),
                "summary failed"
            );
        }

        let mut summary = outcome.value;
        summary.attempts = outcome.attempts_used;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerSettings, CircuitState};
    use crate::retry::RetryPolicy;
    use crate::runner::RunResult;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedRunner(&'static str);

    impl AgentRunner for FixedRunner {
        async fn run(&self, _agent_id: &str, _pass_index: u32) -> Result<RunResult> {
            Ok(RunResult {
                exit_code: 0,
                stdout: self.0.to_string(),
                stderr: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSummarizer {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Summarizer for RecordingSummarizer {
        async fn summarize(&self, review_report: &str) -> Result<RunResult> {
            self.seen.lock().unwrap().push(review_report.to_string());
            if self.fail {
                return Err(Error::AgentRunner("401 unauthorized".into()));
            }
            Ok(RunResult {
                exit_code: 0,
                stdout: "Fix the parser first.".into(),
                stderr: String::new(),
            })
        }
    }

    const FINDING: &str = "### 1. [High] Unchecked index in parser\n**Location:** src/parse.rs:40\n\nPanics on short input.\n";

    fn orchestrator(
        passes: u32,
        summarizer: Option<RecordingSummarizer>,
    ) -> ReviewOrchestrator<FixedRunner, RecordingSummarizer> {
        let runner = Arc::new(FixedRunner(FINDING));
        let agents = vec![
            AgentSpec::new("correctness", Arc::clone(&runner), passes),
            AgentSpec::new("security", runner, passes),
        ];
        let dispatch = DispatchConfig::default()
            .with_parallelism(2)
            .with_task_timeout(Duration::from_secs(5))
            .with_retry_policy(RetryPolicy {
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(2),
                ..RetryPolicy::default()
            });
        let registry = Arc::new(BreakerRegistry::new(BreakerSettings::default()));
        let orch = ReviewOrchestrator::new("./svc", agents, dispatch, registry, ResultMerger::default());
        match summarizer {
            Some(s) => orch.with_summarizer(s),
            None => orch,
        }
    }

    #[tokio::test]
    async fn test_run_merges_per_agent() {
        let report = orchestrator(2, None).run().await.unwrap();
        assert_eq!(report.target, "./svc");
        assert_eq!(report.results.len(), 2);
        for result in &report.results {
            assert!(result.success);
            assert_eq!(result.findings.len(), 1);
            assert_eq!(result.attempts, 2);
            assert!(
                result
                    .content
                    .as_deref()
                    .unwrap()
                    .contains("detected in passes: 1, 2")
            );
        }
        assert!(report.summary.is_none());
        assert!(!report.all_failed());

        let review = report
            .breakers
            .iter()
            .find(|b| b.operation == REVIEW_OPERATION)
            .unwrap();
        assert_eq!(review.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_summary_sees_rendered_review() {
        let orch = orchestrator(1, Some(RecordingSummarizer::default()));
        let report = orch.run().await.unwrap();
        let summary = report.summary.unwrap();
        assert!(summary.success);
        assert_eq!(summary.content.as_deref(), Some("Fix the parser first."));
        assert_eq!(summary.attempts, 1);

        let seen = orch.summarizer.as_ref().unwrap().seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("## correctness"));
        assert!(seen[0].contains("Unchecked index in parser"));
        assert!(report.breakers.iter().any(|b| b.operation == SUMMARY_OPERATION));
    }

    #[tokio::test]
    async fn test_summary_failure_does_not_fail_run() {
        let orch = orchestrator(
            1,
            Some(RecordingSummarizer {
                fail: true,
                ..Default::default()
            }),
        );
        let report = orch.run().await.unwrap();
        assert!(report.results.iter().all(|r| r.success));
        let summary = report.summary.unwrap();
        assert!(!summary.success);
        assert_eq!(summary.attempts, 1);
        assert!(summary.error_message.unwrap().contains("401"));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_interrupted() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let orch = orchestrator(1, None).with_shutdown(rx);
        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }
}
