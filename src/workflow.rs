/// Posting workflow
///
/// One call to [`PostingWorkflow::run_once`] walks a single iteration:
/// pick a topic and style, generate, check against history, publish, record.
/// Every collaborator failure ends the iteration with an explicit outcome; the
/// workflow itself never returns an error. Repetition is the caller's job
/// (CI schedule, cron, or the HTTP trigger).

use anyhow::bail;
use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DEFAULT_STYLE_TEMPLATE, DEFAULT_TOPICS};
use crate::error::BotError;
use crate::generator::TextGenerator;
use crate::history::HistoryStore;
use crate::publisher::{PublishReceipt, Publisher};
use crate::similarity::{DuplicateFilter, DEFAULT_SIMILARITY_THRESHOLD};

/// What to do with a candidate the duplicate filter could not evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterErrorPolicy {
    /// Treat it as rejected
    Skip,
    /// Publish it unchecked
    Post,
}

impl std::str::FromStr for FilterErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Ok(FilterErrorPolicy::Skip),
            "post" => Ok(FilterErrorPolicy::Post),
            other => bail!("unknown filter error policy '{}' (expected 'skip' or 'post')", other),
        }
    }
}

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub topics: Vec<String>,
    pub style_templates: Vec<String>,
    pub similarity_threshold: f32,
    /// Generate/check attempts before giving up on duplicates; at least 1
    pub retry_bound: u32,
    pub on_filter_error: FilterErrorPolicy,
    /// Continue with empty history if it cannot be loaded
    pub allow_post_without_history: bool,
    /// Upper bound on each collaborator call
    pub call_timeout: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            style_templates: vec![DEFAULT_STYLE_TEMPLATE.to_string()],
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            retry_bound: 1,
            on_filter_error: FilterErrorPolicy::Skip,
            allow_post_without_history: false,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Step at which an iteration stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generating,
    Filtering,
    Publishing,
    Recording,
}

/// Result of one iteration
#[derive(Debug)]
pub enum IterationOutcome {
    /// Published and recorded
    Posted {
        receipt: PublishReceipt,
        topic: String,
        attempts: u32,
    },
    /// Published, but the history append failed; the next run will not see this text
    PostedNotRecorded {
        receipt: PublishReceipt,
        error: BotError,
    },
    /// Every attempt produced a near-duplicate; nothing was published
    SkippedDuplicate {
        text: String,
        max_similarity: f32,
        attempts: u32,
    },
    /// A collaborator failed before anything was published
    Failed { stage: Stage, error: BotError },
}

impl IterationOutcome {
    /// True if a live post exists because of this iteration
    pub fn is_published(&self) -> bool {
        matches!(
            self,
            IterationOutcome::Posted { .. } | IterationOutcome::PostedNotRecorded { .. }
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, IterationOutcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            IterationOutcome::Posted { .. } => "posted",
            IterationOutcome::PostedNotRecorded { .. } => "posted_not_recorded",
            IterationOutcome::SkippedDuplicate { .. } => "skipped_duplicate",
            IterationOutcome::Failed { .. } => "failed",
        }
    }
}

/// Generate -> filter -> publish -> record, once per call
pub struct PostingWorkflow {
    settings: WorkflowSettings,
    generator: Arc<dyn TextGenerator>,
    filter: Arc<dyn DuplicateFilter>,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn HistoryStore>,
}

impl PostingWorkflow {
    pub fn new(
        settings: WorkflowSettings,
        generator: Arc<dyn TextGenerator>,
        filter: Arc<dyn DuplicateFilter>,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            settings,
            generator,
            filter,
            publisher,
            store,
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Uniformly random topic and style template
    fn pick_prompt(&self) -> Option<(String, String)> {
        let mut rng = rand::thread_rng();
        let topic = self.settings.topics.choose(&mut rng)?.clone();
        let template = self.settings.style_templates.choose(&mut rng)?.clone();
        Some((topic, template))
    }

    /// Run a collaborator call under the configured timeout
    async fn timed<T, F>(&self, call: F, on_timeout: fn(String) -> BotError) -> Result<T, BotError>
    where
        F: Future<Output = Result<T, BotError>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!(
                "timed out after {:?}",
                self.settings.call_timeout
            ))),
        }
    }

    fn fail(stage: Stage, error: BotError) -> IterationOutcome {
        log::error!(
            "Iteration failed at {:?} ({}): {}",
            stage,
            error.component(),
            error
        );
        IterationOutcome::Failed { stage, error }
    }

    /// Load history for duplicate checks, honouring `allow_post_without_history`
    async fn load_history(&self) -> Result<Vec<String>, BotError> {
        match self
            .timed(self.store.load_all(), BotError::StoreUnavailable)
            .await
        {
            Ok(history) => Ok(history),
            Err(e) if self.settings.allow_post_without_history => {
                log::warn!(
                    "History unavailable ({}); continuing without duplicate history",
                    e
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Execute one iteration; at most one post is published
    pub async fn run_once(&self) -> IterationOutcome {
        let bound = self.settings.retry_bound.max(1);
        let mut history: Option<Vec<String>> = None;
        let mut last_duplicate: Option<(String, f32)> = None;

        for attempt in 1..=bound {
            // Generating
            let Some((topic, template)) = self.pick_prompt() else {
                return Self::fail(
                    Stage::Generating,
                    BotError::Generation("no topics or style templates configured".to_string()),
                );
            };
            log::info!(
                "Attempt {}/{}: generating post about '{}'",
                attempt,
                bound,
                topic
            );

            let candidate = match self
                .timed(self.generator.generate(&topic, &template), BotError::Generation)
                .await
            {
                Ok(c) => c,
                Err(e) => return Self::fail(Stage::Generating, e),
            };

            if candidate.text.trim().is_empty() {
                return Self::fail(Stage::Generating, BotError::EmptyCandidate);
            }
            log::info!("Generated candidate: {}", candidate.text);

            // Filtering
            if history.is_none() {
                match self.load_history().await {
                    Ok(h) => history = Some(h),
                    Err(e) => return Self::fail(Stage::Filtering, e),
                }
            }
            let known = history.as_deref().unwrap_or_default();

            match self
                .timed(
                    self.filter
                        .check(&candidate.text, known, self.settings.similarity_threshold),
                    BotError::Filter,
                )
                .await
            {
                Ok(verdict) if verdict.is_duplicate => {
                    log::info!(
                        "Candidate is a near-duplicate (similarity {:.3} > {}), skipping",
                        verdict.max_similarity,
                        self.settings.similarity_threshold
                    );
                    last_duplicate = Some((candidate.text, verdict.max_similarity));
                    continue;
                }
                Ok(verdict) => {
                    log::debug!(
                        "Candidate accepted (max similarity {:.3})",
                        verdict.max_similarity
                    );
                }
                Err(e) => match self.settings.on_filter_error {
                    FilterErrorPolicy::Skip => return Self::fail(Stage::Filtering, e),
                    FilterErrorPolicy::Post => {
                        log::warn!("Duplicate check failed ({}); posting unchecked", e);
                    }
                },
            }

            // Publishing
            let receipt = match self
                .timed(self.publisher.publish(&candidate.text), BotError::publish_transport)
                .await
            {
                Ok(r) => r,
                Err(e) => return Self::fail(Stage::Publishing, e),
            };

            // Recording
            return match self
                .timed(
                    self.store.append(&candidate.text, Utc::now()),
                    BotError::Store,
                )
                .await
            {
                Ok(()) => {
                    log::info!("Post {} published and recorded", receipt.post_id);
                    IterationOutcome::Posted {
                        receipt,
                        topic: candidate.topic,
                        attempts: attempt,
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Post {} is live but was NOT recorded in history ({}); \
                        future duplicate checks will not see it",
                        receipt.post_id,
                        e
                    );
                    IterationOutcome::PostedNotRecorded { receipt, error: e }
                }
            };
        }

        let (text, max_similarity) = last_duplicate.unwrap_or_default();
        log::info!("All {} attempts were duplicates; nothing posted", bound);
        IterationOutcome::SkippedDuplicate {
            text,
            max_similarity,
            attempts: bound,
        }
    }
}
