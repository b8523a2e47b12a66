/// Bot wiring module
///
/// Connects the pieces: configuration, Gemini generator, OpenAI embeddings,
/// Postgres history, and the X publisher, then drives the workflow either once
/// (CI / cron trigger) or behind the HTTP trigger.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::config::{Config, RunMode};
use crate::generator::GeminiGenerator;
use crate::history::PgHistoryStore;
use crate::http_server::{start_server, AppState};
use crate::publisher::TwitterPublisher;
use crate::similarity::{NearDuplicateFilter, OpenAiEmbedder};
use crate::workflow::{IterationOutcome, PostingWorkflow};

/// Build a workflow backed by the real collaborators
pub async fn build_workflow(config: &Config) -> Result<PostingWorkflow> {
    log::info!("Initializing posting workflow...");

    let http_client = config.http_client()?;

    let store = PgHistoryStore::connect(&config.database_url, &config.history_table).await?;
    store.initialize().await?;

    let generator = GeminiGenerator::new(
        http_client.clone(),
        &config.gemini_base_url,
        &config.gemini_api_key,
        &config.gemini_model,
    );

    let embedder = OpenAiEmbedder::new(
        http_client.clone(),
        &config.openai_base_url,
        &config.openai_api_key,
        &config.embedding_model,
    );
    let filter = NearDuplicateFilter::new(embedder, config.duplicate_check)
        .with_persistent_cache(Arc::new(store.embedding_cache()));

    let publisher = TwitterPublisher::new(
        http_client,
        &config.twitter_base_url,
        &config.twitter_bearer_token,
    );

    log::info!(
        "Using {} for generation, {} for embeddings ({:?} duplicate check)",
        config.gemini_model,
        config.embedding_model,
        config.duplicate_check
    );

    Ok(PostingWorkflow::new(
        config.workflow_settings(),
        Arc::new(generator),
        Arc::new(filter),
        Arc::new(publisher),
        Arc::new(store),
    ))
}

/// Run according to `RUN_MODE`
///
/// # Errors
/// In `once` mode, a failed iteration is returned as an error so the
/// process exits non-zero and the scheduler marks the run as failed.
pub async fn run_bot(config: Config) -> Result<()> {
    let workflow = Arc::new(build_workflow(&config).await?);

    match config.run_mode {
        RunMode::Once => {
            let outcome = workflow.run_once().await;
            log::info!("Iteration finished: {}", outcome.label());
            if let IterationOutcome::Failed { stage, error } = outcome {
                bail!("posting iteration failed at {:?}: {}", stage, error);
            }
            Ok(())
        }
        RunMode::Serve => {
            let state = AppState::new(workflow, config.trigger_secret.clone());
            start_server(state, config.port).await
        }
    }
}
