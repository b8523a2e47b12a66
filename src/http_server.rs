/// HTTP Server Module
///
/// External trigger surface: a scheduler (CI job, cron, uptime pinger) calls
/// `POST /trigger` to run one posting iteration. Overlapping triggers are
/// refused instead of queued.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::workflow::{IterationOutcome, PostingWorkflow};

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<PostingWorkflow>,
    pub trigger_secret: Option<String>,
    pub run_status: Arc<RwLock<RunStatus>>,
    /// Held for the duration of one iteration
    pub run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(workflow: Arc<PostingWorkflow>, trigger_secret: Option<String>) -> Self {
        Self {
            workflow,
            trigger_secret,
            run_status: Arc::new(RwLock::new(RunStatus::default())),
            run_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_post_id: Option<String>,
    pub last_error: Option<String>,
    pub total_runs: u32,
    pub total_posts: u32,
}

impl RunStatus {
    fn record(&mut self, outcome: &IterationOutcome) {
        self.last_run = Some(Utc::now());
        self.last_outcome = Some(outcome.label().to_string());
        self.total_runs += 1;
        self.last_error = None;

        match outcome {
            IterationOutcome::Posted { receipt, .. } => {
                self.total_posts += 1;
                self.last_post_id = Some(receipt.post_id.clone());
            }
            IterationOutcome::PostedNotRecorded { receipt, error } => {
                self.total_posts += 1;
                self.last_post_id = Some(receipt.post_id.clone());
                self.last_error = Some(error.to_string());
            }
            IterationOutcome::Failed { error, .. } => {
                self.last_error = Some(error.to_string());
            }
            IterationOutcome::SkippedDuplicate { .. } => {}
        }
    }
}

/// JSON view of an iteration outcome
pub fn outcome_json(outcome: &IterationOutcome) -> serde_json::Value {
    match outcome {
        IterationOutcome::Posted {
            receipt,
            topic,
            attempts,
        } => serde_json::json!({
            "status": outcome.label(),
            "post_id": receipt.post_id,
            "text": receipt.text,
            "topic": topic,
            "attempts": attempts,
        }),
        IterationOutcome::PostedNotRecorded { receipt, error } => serde_json::json!({
            "status": outcome.label(),
            "post_id": receipt.post_id,
            "text": receipt.text,
            "error": error.to_string(),
        }),
        IterationOutcome::SkippedDuplicate {
            max_similarity,
            attempts,
            ..
        } => serde_json::json!({
            "status": outcome.label(),
            "max_similarity": max_similarity,
            "attempts": attempts,
        }),
        IterationOutcome::Failed { stage, error } => serde_json::json!({
            "status": outcome.label(),
            "stage": stage,
            "component": error.component(),
            "error": error.to_string(),
        }),
    }
}

/// Create and configure the HTTP server router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/trigger", post(trigger_endpoint))
        .route("/status", get(status_endpoint))
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "ok",
        "service": "niche_tweet_bot",
        "timestamp": Utc::now().to_rfc3339()
    })))
}

fn authorized(secret: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(secret) = secret else {
        return true;
    };

    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|token| token == secret)
        .unwrap_or(false)
}

/// Run one posting iteration
async fn trigger_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !authorized(state.trigger_secret.as_deref(), &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let Ok(_guard) = state.run_lock.try_lock() else {
        log::warn!("Trigger refused: a posting iteration is already running");
        return Err(StatusCode::CONFLICT);
    };

    log::info!("Posting iteration triggered via HTTP endpoint");
    let outcome = state.workflow.run_once().await;

    state.run_status.write().await.record(&outcome);

    Ok(Json(outcome_json(&outcome)))
}

/// Get run status endpoint
async fn status_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let status = state.run_status.read().await;
    serde_json::to_value(&*status)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Start the HTTP server
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context("Failed to bind HTTP server")?;

    log::info!("HTTP server listening on port {}", port);

    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
