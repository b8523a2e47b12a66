/// Niche Tweet Bot
///
/// Generates a short post about a randomly chosen niche topic with Gemini,
/// skips it if it is a near-duplicate of something already posted, publishes
/// it to X, and records it in the Postgres history.
///
/// Each process run is one iteration (`RUN_MODE=once`, the default, for CI or
/// cron), or an HTTP server that runs one iteration per `POST /trigger`
/// (`RUN_MODE=serve`).

use anyhow::Result;
use niche_tweet_bot::{bot, config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    pretty_env_logger::init();

    log::info!("Starting Niche Tweet Bot...");

    // Load configuration from environment
    let cfg = config::Config::from_env()?;

    // Validate configuration and connections
    cfg.validate().await?;

    bot::run_bot(cfg).await?;

    Ok(())
}
