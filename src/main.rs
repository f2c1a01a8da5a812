use anyhow::Result;
use clap::Parser;
use std::env;
use unthread_sync::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Initialize logging based on config
    let log_level = config.logging.level.to_lowercase();
    let default_directive = format!("unthread_sync={}", log_level);
    let env_override = env::var("RUST_LOG").unwrap_or_default();
    let combined_filter = if env_override.trim().is_empty() {
        default_directive.clone()
    } else if env_override.contains("unthread_sync") {
        env_override
    } else {
        format!("{},{}", env_override, default_directive)
    };

    tracing_subscriber::fmt()
        .with_env_filter(combined_filter)
        .with_target(true)
        .init();

    cli::execute(cli.command, config).await
}
