use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::circuit_breaker::{
    BreakerSettings, DEFAULT_ESCALATION_FACTOR, DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_DURATION,
};
use crate::cli::Cli;
use crate::dispatcher::{DEFAULT_PARALLELISM, DEFAULT_TASK_TIMEOUT, DispatchConfig};
use crate::error::{Error, Result};
use crate::merger::DEFAULT_SIMILARITY_THRESHOLD;
use crate::prompts::{
    DEFAULT_REVIEW_PROMPT, DEFAULT_SUMMARY_PROMPT, validate_agent_template, validate_template,
    with_findings_format,
};
use crate::retry::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::runner::RunnerKind;

pub const DEFAULT_CONFIG_PATH: &str = ".reviewpass.toml";
pub const DEFAULT_REVIEW_PASSES: u32 = 2;

/// Agents run when the config file names none: (name, focus).
pub const DEFAULT_AGENTS: &[(&str, &str)] = &[
    (
        "correctness",
        "logic errors, unhandled edge cases and broken invariants",
    ),
    (
        "security",
        "injection, authentication, secrets handling and unsafe input",
    ),
    (
        "performance",
        "needless allocation, blocking calls and algorithmic complexity",
    ),
    (
        "maintainability",
        "unclear naming, duplication and missing tests",
    ),
];

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub runner: Option<String>,
    pub agent_binary: Option<String>,
    pub agent_model: Option<String>,
    pub parallelism: Option<i64>,
    pub review_passes: Option<i64>,
    pub max_retries: Option<i64>,
    pub backoff_base_ms: Option<i64>,
    pub backoff_max_ms: Option<i64>,
    pub failure_threshold: Option<i64>,
    pub open_duration_ms: Option<i64>,
    pub open_escalation_factor: Option<f64>,
    pub task_timeout_secs: Option<i64>,
    pub similarity_threshold: Option<f64>,
    #[serde(default)]
    pub non_retryable_markers: Vec<String>,
    #[serde(default)]
    pub agents: Vec<AgentConfigFile>,
    pub summary: Option<SummaryConfigFile>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfigFile {
    pub name: String,
    pub prompt: Option<String>,
    pub focus: Option<String>,
    pub passes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SummaryConfigFile {
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub name: String,
    pub focus: String,
    /// Prompt template including the findings output format.
    pub prompt: String,
    pub passes: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryConfig {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub target: PathBuf,
    pub runner: RunnerKind,
    pub agent_binary: String,
    pub agent_model: Option<String>,
    pub parallelism: usize,
    pub review_passes: u32,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub open_escalation_factor: f64,
    pub task_timeout: Duration,
    pub similarity_threshold: f64,
    pub non_retryable_markers: Vec<String>,
    pub agents: Vec<AgentConfig>,
    pub summary: Option<SummaryConfig>,
}

impl Config {
    /// Load the config file (if any) and merge CLI overrides into it.
    ///
    /// A missing default config file is fine; a missing file passed with
    /// `--config` is an error.
    pub fn load(cli: &Cli) -> Result<Self> {
        let file_config = match cli.config {
            Some(ref path) => {
                let path = Path::new(path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    parse_config(&std::fs::read_to_string(path)?)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        merge(file_config, cli)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries + 1,
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
            attempt_timeout: Some(self.task_timeout),
            non_retryable_markers: self.non_retryable_markers.clone(),
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            base_open_duration: self.open_duration,
            escalation_factor: self.open_escalation_factor,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig::default()
            .with_parallelism(self.parallelism)
            .with_task_timeout(self.task_timeout)
            .with_retry_policy(self.retry_policy())
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    if let Some(ref runner) = config.runner {
        runner.parse::<RunnerKind>()?;
    }

    let mut seen = HashSet::new();
    for agent in &config.agents {
        if agent.name.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "agent name must not be empty".to_string(),
            ));
        }
        if !seen.insert(agent.name.as_str()) {
            return Err(Error::ConfigValidation(format!(
                "duplicate agent name: {}",
                agent.name
            )));
        }
        if let Some(ref prompt) = agent.prompt {
            if prompt.trim().is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "agent '{}' has an empty prompt",
                    agent.name
                )));
            }
            validate_agent_template(prompt)
                .map_err(|e| Error::ConfigValidation(format!("agent '{}': {e}", agent.name)))?;
        }
    }

    if let Some(ref summary) = config.summary
        && let Some(ref prompt) = summary.prompt
    {
        if prompt.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "summary prompt must not be empty".to_string(),
            ));
        }
        validate_template(prompt)
            .map_err(|e| Error::ConfigValidation(format!("summary: {e}")))?;
    }

    Ok(())
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let runner: RunnerKind = cli
        .runner
        .as_deref()
        .or(file.runner.as_deref())
        .unwrap_or("claude")
        .parse()?;

    let review_passes = positive(
        cli.passes.map(i64::from).or(file.review_passes),
        DEFAULT_REVIEW_PASSES as u64,
    ) as u32;

    let backoff_base = Duration::from_millis(positive(
        file.backoff_base_ms,
        DEFAULT_BACKOFF_BASE.as_millis() as u64,
    ));
    let backoff_cap = Duration::from_millis(positive(
        file.backoff_max_ms,
        DEFAULT_BACKOFF_CAP.as_millis() as u64,
    ))
    .max(backoff_base);

    let agents = resolve_agents(&file.agents, review_passes, &cli.agents)?;

    let summary = match file.summary {
        Some(summary) if !cli.no_summary => Some(SummaryConfig {
            prompt: summary
                .prompt
                .unwrap_or_else(|| DEFAULT_SUMMARY_PROMPT.to_string()),
        }),
        _ => None,
    };

    Ok(Config {
        target: cli.target.clone().unwrap_or_else(|| PathBuf::from(".")),
        runner,
        agent_binary: cli
            .agent_binary
            .clone()
            .or(file.agent_binary)
            .unwrap_or_else(|| runner.to_string()),
        agent_model: cli.agent_model.clone().or(file.agent_model),
        parallelism: positive(
            cli.parallelism.map(i64::from).or(file.parallelism),
            DEFAULT_PARALLELISM as u64,
        ) as usize,
        review_passes,
        max_retries: positive(
            cli.max_retries.map(i64::from).or(file.max_retries),
            DEFAULT_MAX_RETRIES as u64,
        ) as u32,
        backoff_base,
        backoff_cap,
        failure_threshold: positive(file.failure_threshold, DEFAULT_FAILURE_THRESHOLD as u64)
            as u32,
        open_duration: Duration::from_millis(positive(
            file.open_duration_ms,
            DEFAULT_OPEN_DURATION.as_millis() as u64,
        )),
        open_escalation_factor: file
            .open_escalation_factor
            .filter(|f| f.is_finite() && *f > 1.0)
            .unwrap_or(DEFAULT_ESCALATION_FACTOR),
        task_timeout: Duration::from_secs(positive(
            cli.agent_timeout
                .map(|t| i64::try_from(t).unwrap_or(i64::MAX))
                .or(file.task_timeout_secs),
            DEFAULT_TASK_TIMEOUT.as_secs(),
        )),
        similarity_threshold: file
            .similarity_threshold
            .filter(|t| *t > 0.0 && *t <= 1.0)
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
        non_retryable_markers: file.non_retryable_markers,
        agents,
        summary,
    })
}

/// Zero, negative and out-of-range values fall back to `default`.
fn positive(value: Option<i64>, default: u64) -> u64 {
    match value {
        Some(v) if v > 0 && v <= u32::MAX as i64 => v as u64,
        _ => default,
    }
}

fn resolve_agents(
    configured: &[AgentConfigFile],
    review_passes: u32,
    selected: &[String],
) -> Result<Vec<AgentConfig>> {
    let all: Vec<AgentConfig> = if configured.is_empty() {
        DEFAULT_AGENTS
            .iter()
            .map(|(name, focus)| AgentConfig {
                name: name.to_string(),
                focus: focus.to_string(),
                prompt: with_findings_format(DEFAULT_REVIEW_PROMPT),
                passes: review_passes,
            })
            .collect()
    } else {
        configured
            .iter()
            .map(|agent| AgentConfig {
                name: agent.name.clone(),
                focus: agent.focus.clone().unwrap_or_else(|| agent.name.clone()),
                prompt: with_findings_format(
                    agent.prompt.as_deref().unwrap_or(DEFAULT_REVIEW_PROMPT),
                ),
                passes: positive(agent.passes, review_passes as u64) as u32,
            })
            .collect()
    };

    if selected.is_empty() {
        return Ok(all);
    }

    for name in selected {
        if !all.iter().any(|a| &a.name == name) {
            let available: Vec<&str> = all.iter().map(|a| a.name.as_str()).collect();
            return Err(Error::ConfigValidation(format!(
                "unknown agent: {name} (available: {})",
                available.join(", ")
            )));
        }
    }

    Ok(all
        .into_iter()
        .filter(|a| selected.contains(&a.name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["reviewpass"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
runner = "codex"
parallelism = 8
review_passes = 3
non_retryable_markers = ["quota exhausted"]

[[agents]]
name = "security"
focus = "authn and secrets"

[[agents]]
name = "docs"
prompt = "Review the docs in {{target_path}}."
passes = 1

[summary]
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.runner.as_deref(), Some("codex"));
        assert_eq!(config.parallelism, Some(8));
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].passes, Some(1));
        assert_eq!(config.summary, Some(SummaryConfigFile::default()));
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_parse_invalid_runner() {
        let err = parse_config(r#"runner = "gemini""#).unwrap_err();
        assert!(err.to_string().contains("unknown runner"));
    }

    #[test]
    fn test_parse_unknown_field() {
        let err = parse_config(r#"bogus = "value""#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_parse_duplicate_agent() {
        let toml = r#"
[[agents]]
name = "security"

[[agents]]
name = "security"
"#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate agent name: security"));
    }

    #[test]
    fn test_parse_empty_agent_prompt() {
        let toml = r#"
[[agents]]
name = "security"
prompt = "  "
"#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("empty prompt"));
    }

    #[test]
    fn test_parse_prompt_with_unknown_variable() {
        let toml = r#"
[[agents]]
name = "security"
prompt = "Review {{repo_url}}"
"#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("unknown template variable: repo_url"));
    }

    #[test]
    fn test_parse_agent_prompt_with_summary_variable() {
        let toml = r#"
[[agents]]
name = "security"
prompt = "Review {{target_path}} against {{review_report}}"

[summary]
prompt = "Summarize {{review_report}}"
"#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("agent 'security'"));
        assert!(err.to_string().contains("review_report is only available to the summary prompt"));
    }

    #[test]
    fn test_defaults_applied() {
        let config = merge(ConfigFile::default(), &cli(&[])).unwrap();
        assert_eq!(config.target, PathBuf::from("."));
        assert_eq!(config.runner, RunnerKind::Claude);
        assert_eq!(config.agent_binary, "claude");
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.review_passes, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(1000));
        assert_eq!(config.backoff_cap, Duration::from_millis(30_000));
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.open_duration, Duration::from_millis(30_000));
        assert_eq!(config.open_escalation_factor, 2.0);
        assert_eq!(config.task_timeout, Duration::from_secs(600));
        assert_eq!(config.similarity_threshold, 0.75);
        assert!(config.summary.is_none());

        let names: Vec<&str> = config.agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["correctness", "security", "performance", "maintainability"]
        );
        assert!(config.agents.iter().all(|a| a.passes == 2));
        assert!(config.agents[0].prompt.contains("NO_ISSUES_FOUND"));
    }

    #[test]
    fn test_non_positive_values_fall_back_to_defaults() {
        let file = ConfigFile {
            parallelism: Some(0),
            review_passes: Some(-2),
            max_retries: Some(-1),
            backoff_base_ms: Some(0),
            backoff_max_ms: Some(-500),
            failure_threshold: Some(0),
            open_duration_ms: Some(-1),
            open_escalation_factor: Some(0.5),
            task_timeout_secs: Some(0),
            similarity_threshold: Some(1.5),
            ..Default::default()
        };
        let config = merge(file, &cli(&[])).unwrap();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.review_passes, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(1000));
        assert_eq!(config.backoff_cap, Duration::from_millis(30_000));
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.open_duration, Duration::from_millis(30_000));
        assert_eq!(config.open_escalation_factor, 2.0);
        assert_eq!(config.task_timeout, Duration::from_secs(600));
        assert_eq!(config.similarity_threshold, 0.75);
    }

    #[test]
    fn test_backoff_cap_never_below_base() {
        let file = ConfigFile {
            backoff_base_ms: Some(5000),
            backoff_max_ms: Some(100),
            ..Default::default()
        };
        let config = merge(file, &cli(&[])).unwrap();
        assert_eq!(config.backoff_cap, Duration::from_millis(5000));
    }

    #[test]
    fn test_cli_overrides_config() {
        let file = ConfigFile {
            runner: Some("claude".to_string()),
            parallelism: Some(2),
            review_passes: Some(5),
            task_timeout_secs: Some(60),
            ..Default::default()
        };
        let config = merge(
            file,
            &cli(&["--runner", "codex", "--passes", "1", "--agent-timeout", "30"]),
        )
        .unwrap();
        assert_eq!(config.runner, RunnerKind::Codex); // CLI wins
        assert_eq!(config.agent_binary, "codex");
        assert_eq!(config.review_passes, 1); // CLI wins
        assert_eq!(config.task_timeout, Duration::from_secs(30)); // CLI wins
        assert_eq!(config.parallelism, 2); // file value kept
    }

    #[test]
    fn test_agent_pass_override() {
        let file = ConfigFile {
            review_passes: Some(3),
            agents: vec![
                AgentConfigFile {
                    name: "a".into(),
                    ..Default::default()
                },
                AgentConfigFile {
                    name: "b".into(),
                    passes: Some(1),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let config = merge(file, &cli(&[])).unwrap();
        assert_eq!(config.agents[0].passes, 3);
        assert_eq!(config.agents[0].focus, "a");
        assert_eq!(config.agents[1].passes, 1);
    }

    #[test]
    fn test_agent_selection() {
        let config = merge(
            ConfigFile::default(),
            &cli(&["--agent", "performance", "--agent", "security"]),
        )
        .unwrap();
        let names: Vec<&str> = config.agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["security", "performance"]);
    }

    #[test]
    fn test_unknown_agent_selection() {
        let err = merge(ConfigFile::default(), &cli(&["--agent", "style"])).unwrap_err();
        assert!(err.to_string().contains("unknown agent: style"));
    }

    #[test]
    fn test_summary_enabled_and_disabled() {
        let file = ConfigFile {
            summary: Some(SummaryConfigFile::default()),
            ..Default::default()
        };
        let config = merge(file.clone(), &cli(&[])).unwrap();
        assert_eq!(
            config.summary.map(|s| s.prompt),
            Some(DEFAULT_SUMMARY_PROMPT.to_string())
        );

        let config = merge(file, &cli(&["--no-summary"])).unwrap();
        assert!(config.summary.is_none());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = merge(ConfigFile::default(), &cli(&["--max-retries", "1"])).unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.attempt_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_load_missing_explicit_config() {
        let err = Config::load(&cli(&["--config", "/nonexistent/reviewpass.toml"])).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }
}
