pub mod backoff;
pub mod circuit_breaker;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod findings;
pub mod merger;
pub mod orchestrator;
pub mod process;
pub mod prompts;
pub mod report;
pub mod retry;
pub mod runner;
