//! Minimal consumer: run one task from the command line.
//!
//! ```sh
//! LLM_API_KEY=... LLM_MODEL=gpt-4o-mini \
//!   cargo run --bin auspex-demo -- https://example.com "What is this page about?"
//! ```

use anyhow::{bail, Context, Result};
use auspex::{Agent, AgentConfig, RunOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (url, prompt) = match (args.next(), args.next()) {
        (Some(url), Some(prompt)) => (url, prompt),
        _ => bail!("usage: auspex-demo <url> <prompt>"),
    };

    let cfg = AgentConfig {
        api_key: std::env::var("LLM_API_KEY").context("LLM_API_KEY is required")?,
        base_url: std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        log_dir: Some("logs".to_string()),
        ..AgentConfig::default()
    };

    let agent = Agent::new(cfg)?;
    let result = agent.run(RunOptions::new(url, prompt)).await?;
    println!("{}", result.report);
    agent.shutdown().await;
    Ok(())
}
