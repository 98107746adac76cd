use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Markdown,
    Json,
}

/// Run a panel of AI review agents over a codebase
#[derive(Parser, Debug, Clone)]
#[command(name = "reviewpass", version, about)]
pub struct Cli {
    /// Directory to review (default: current directory)
    pub target: Option<PathBuf>,

    /// Path to config file (default: .reviewpass.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Only run the named agent (repeatable)
    #[arg(long = "agent", value_name = "NAME")]
    pub agents: Vec<String>,

    /// Review passes per agent
    #[arg(long)]
    pub passes: Option<u32>,

    /// Maximum number of passes running at once
    #[arg(long)]
    pub parallelism: Option<u32>,

    /// Agent runner to use (claude, codex)
    #[arg(long)]
    pub runner: Option<String>,

    /// Agent binary to use (default: the runner name)
    #[arg(long)]
    pub agent_binary: Option<String>,

    /// Model for the agent to use
    #[arg(long)]
    pub agent_model: Option<String>,

    /// Per-attempt agent timeout in seconds
    #[arg(long)]
    pub agent_timeout: Option<u64>,

    /// Retries after the first failed attempt of a pass
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Report format written to stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
    pub format: OutputFormat,

    /// Skip the summary step even when one is configured
    #[arg(long)]
    pub no_summary: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(long, short)]
    pub verbose: bool,
}
