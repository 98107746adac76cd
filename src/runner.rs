use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, run_process};
use crate::prompts::render_template;

/// Stderr lines carried into a failure message, so the retry classifier can
/// see rate-limit / auth text printed by the agent CLI.
const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Claude,
    Codex,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerKind::Claude => write!(f, "claude"),
            RunnerKind::Codex => write!(f, "codex"),
        }
    }
}

impl FromStr for RunnerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "claude" => Ok(RunnerKind::Claude),
            "codex" => Ok(RunnerKind::Codex),
            other => Err(Error::ConfigValidation(format!(
                "unknown runner: {other} (expected: claude, codex)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The invocation capability handed to the dispatcher: one call produces the
/// review text for one pass of one agent.
pub trait AgentRunner: Send + Sync + 'static {
    fn run(
        &self,
        agent_id: &str,
        pass_index: u32,
    ) -> impl Future<Output = Result<RunResult>> + Send;
}

/// Produces the executive summary from the rendered, merged review.
pub trait Summarizer: Send + Sync + 'static {
    fn summarize(&self, review_report: &str) -> impl Future<Output = Result<RunResult>> + Send;
}

/// Runs an agent CLI (`claude` or `codex`) with a rendered prompt in the
/// review target directory.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    kind: RunnerKind,
    agent_binary: String,
    model: Option<String>,
    working_dir: PathBuf,
    template: String,
    vars: HashMap<String, String>,
}

impl CommandRunner {
    pub fn new(
        kind: RunnerKind,
        agent_binary: impl Into<String>,
        model: Option<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind,
            agent_binary: agent_binary.into(),
            model,
            working_dir: working_dir.into(),
            template: String::new(),
            vars: HashMap::new(),
        }
    }

    /// Set the prompt template and the variables that stay fixed across passes.
    pub fn with_prompt(mut self, template: impl Into<String>, vars: HashMap<String, String>) -> Self {
        self.template = template.into();
        self.vars = vars;
        self
    }

    pub fn render_prompt(&self, agent_id: &str, pass_index: u32) -> Result<String> {
        let mut vars = self.vars.clone();
        vars.entry("agent_name".to_string())
            .or_insert_with(|| agent_id.to_string());
        vars.insert("pass_index".to_string(), pass_index.to_string());
        render_template(&self.template, &vars)
    }

    /// Build the command, arguments and optional stdin payload for a prompt.
    pub fn build_command(&self, prompt: &str) -> (String, Vec<String>, Option<String>) {
        match self.kind {
            RunnerKind::Claude => {
                let mut args = vec![
                    "--print".to_string(),
                    "--output-format".to_string(),
                    "text".to_string(),
                ];
                if let Some(ref model) = self.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                args.push("-p".to_string());
                args.push(prompt.to_string());
                (self.agent_binary.clone(), args, None)
            }
            RunnerKind::Codex => {
                let mut args = vec!["exec".to_string(), "--sandbox".to_string(), "read-only".to_string()];
                if let Some(ref model) = self.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                args.push("-".to_string());
                (self.agent_binary.clone(), args, Some(prompt.to_string()))
            }
        }
    }
}

impl AgentRunner for CommandRunner {
    async fn run(&self, agent_id: &str, pass_index: u32) -> Result<RunResult> {
        let prompt = self.render_prompt(agent_id, pass_index)?;
        let (command, args, stdin_data) = self.build_command(&prompt);

        let config = ProcessConfig {
            command,
            args,
            working_dir: self.working_dir.clone(),
            log_prefix: format!("{agent_id}#{pass_index}"),
            env: vec![],
            stdin_data,
        };

        let output = run_process(config).await?;

        if let Some(sig) = output.signal {
            return Err(Error::AgentRunner(format!("agent killed by signal {sig}")));
        }

        if !output.success() {
            let tail_start = output.stderr_lines.len().saturating_sub(STDERR_TAIL_LINES);
            let tail = output.stderr_lines[tail_start..].join(" | ");
            return Err(Error::AgentRunner(if tail.is_empty() {
                format!("agent exited with code {}", output.exit_code)
            } else {
                format!("agent exited with code {}: {tail}", output.exit_code)
            }));
        }

        Ok(RunResult {
            exit_code: output.exit_code,
            stdout: output.stdout_lines.join("\n"),
            stderr: output.stderr_lines.join("\n"),
        })
    }
}

impl Summarizer for CommandRunner {
    async fn summarize(&self, review_report: &str) -> Result<RunResult> {
        let mut runner = self.clone();
        runner
            .vars
            .insert("review_report".to_string(), review_report.to_string());
        runner.run("summary", 1).await
    }
}
