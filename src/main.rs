use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reviewpass::circuit_breaker::BreakerRegistry;
use reviewpass::cli::{Cli, OutputFormat};
use reviewpass::config::Config;
use reviewpass::dispatcher::AgentSpec;
use reviewpass::error::Error;
use reviewpass::merger::ResultMerger;
use reviewpass::orchestrator::ReviewOrchestrator;
use reviewpass::report;
use reviewpass::runner::CommandRunner;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(e: Error) -> ! {
    if matches!(e, Error::Interrupted) {
        eprintln!("error: {e}");
        std::process::exit(130);
    }
    eprintln!("error: {e}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("reviewpass starting");

    let config = Config::load(&cli).unwrap_or_else(|e| fail(e));
    if !config.target.is_dir() {
        fail(Error::ConfigValidation(format!(
            "target is not a directory: {}",
            config.target.display()
        )));
    }

    info!(
        target = %config.target.display(),
        runner = %config.runner,
        agents = config.agents.len(),
        parallelism = config.parallelism,
        max_retries = config.max_retries,
        timeout_secs = config.task_timeout.as_secs(),
        summary = config.summary.is_some(),
        "config loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            let _ = shutdown_tx.send(true);
        }
    });

    let target_path = config.target.display().to_string();
    let agents: Vec<AgentSpec<CommandRunner>> = config
        .agents
        .iter()
        .map(|agent| {
            let vars = HashMap::from([
                ("agent_focus".to_string(), agent.focus.clone()),
                ("pass_count".to_string(), agent.passes.to_string()),
                ("target_path".to_string(), target_path.clone()),
            ]);
            let runner = CommandRunner::new(
                config.runner,
                config.agent_binary.clone(),
                config.agent_model.clone(),
                config.target.clone(),
            )
            .with_prompt(agent.prompt.clone(), vars);
            AgentSpec::new(agent.name.clone(), Arc::new(runner), agent.passes)
        })
        .collect();

    let registry = Arc::new(BreakerRegistry::new(config.breaker_settings()));
    let mut orchestrator = ReviewOrchestrator::new(
        target_path.clone(),
        agents,
        config.dispatch_config(),
        registry,
        ResultMerger::new(config.similarity_threshold),
    )
    .with_shutdown(shutdown_rx);

    if let Some(ref summary) = config.summary {
        let vars = HashMap::from([
            ("agent_name".to_string(), "summary".to_string()),
            ("agent_focus".to_string(), "summary".to_string()),
            ("pass_count".to_string(), "1".to_string()),
            ("target_path".to_string(), target_path.clone()),
        ]);
        let summarizer = CommandRunner::new(
            config.runner,
            config.agent_binary.clone(),
            config.agent_model.clone(),
            config.target.clone(),
        )
        .with_prompt(summary.prompt.clone(), vars);
        orchestrator = orchestrator.with_summarizer(summarizer);
    }

    let run_report = orchestrator.run().await.unwrap_or_else(|e| fail(e));

    let rendered = match cli.format {
        OutputFormat::Markdown => report::render_markdown(&run_report),
        OutputFormat::Json => report::render_json(&run_report).unwrap_or_else(|e| fail(e)),
    };
    println!("{rendered}");

    if run_report.all_failed() {
        fail(Error::AgentRunner("every review agent failed".to_string()));
    }
}
