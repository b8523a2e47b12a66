/// Posting history module with PostgreSQL + pgvector
///
/// This module handles:
/// - The append-only log of published text (one row per post)
/// - Reading the whole log back in insertion order for duplicate checks
/// - A side table caching history embeddings so short-lived runs skip re-embedding
/// - An in-memory log with the same contract for local runs and tests

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::BotError;
use crate::similarity::EmbeddingCache;

/// One published post; never edited once appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

/// Append-only history of published text
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// All historical texts in insertion order
    async fn load_all(&self) -> Result<Vec<String>, BotError>;

    /// Append one record; visible to the next `load_all`
    async fn append(&self, text: &str, posted_at: DateTime<Utc>) -> Result<(), BotError>;
}

/// Open a pool, disabling statement timeouts behind pgBouncer-style poolers
pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    // Check if using connection pooler (pgBouncer)
    let use_pooler = database_url.contains(":6543") || database_url.contains("pgbouncer=true");

    let mut pool_options = sqlx::postgres::PgPoolOptions::new().max_connections(max_connections);

    if use_pooler {
        log::info!("Using connection pooler - disabling statement timeout");
        pool_options = pool_options.after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET statement_timeout = 0")
                    .execute(conn)
                    .await?;
                Ok(())
            })
        });
    }

    pool_options
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")
}

/// Table names are interpolated into SQL, so only plain identifiers pass
fn check_table_name(table: &str) -> anyhow::Result<()> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("Invalid history table name: {:?}", table);
    }
    Ok(())
}

/// History log stored in a Postgres table
#[derive(Clone)]
pub struct PgHistoryStore {
    db_pool: PgPool,
    table: String,
}

impl PgHistoryStore {
    pub async fn connect(database_url: &str, table: &str) -> anyhow::Result<Self> {
        check_table_name(table)?;
        let db_pool = connect_pool(database_url, 5).await?;
        Ok(Self {
            db_pool,
            table: table.to_string(),
        })
    }

    /// Create the history and embedding tables if they don't exist
    pub async fn initialize(&self) -> anyhow::Result<()> {
        log::info!("Initializing history table {}...", self.table);

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.db_pool)
            .await
            .context("Failed to create vector extension")?;

        let create_history = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                text TEXT NOT NULL,
                posted_at TIMESTAMPTZ NOT NULL
            )
            "#,
            self.table
        );

        sqlx::query(&create_history)
            .execute(&self.db_pool)
            .await
            .context("Failed to create history table")?;

        let create_embeddings = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {}_embedding_cache (
                model TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding vector NOT NULL,
                PRIMARY KEY (model, text)
            )
            "#,
            self.table
        );

        sqlx::query(&create_embeddings)
            .execute(&self.db_pool)
            .await
            .context("Failed to create embeddings table")?;

        log::info!("History tables ready");
        Ok(())
    }

    /// Embedding cache sharing this store's pool
    pub fn embedding_cache(&self) -> PgEmbeddingCache {
        PgEmbeddingCache {
            db_pool: self.db_pool.clone(),
            table: format!("{}_embedding_cache", self.table),
        }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn load_all(&self) -> Result<Vec<String>, BotError> {
        let query = format!("SELECT text FROM {} ORDER BY id", self.table);

        let rows = sqlx::query(&query)
            .fetch_all(&self.db_pool)
            .await
            .map_err(|e| BotError::StoreUnavailable(e.to_string()))?;

        let texts: Vec<String> = rows
            .into_iter()
            .map(|row| row.get::<String, _>("text"))
            .collect();

        log::info!("Loaded {} history entries", texts.len());
        Ok(texts)
    }

    async fn append(&self, text: &str, posted_at: DateTime<Utc>) -> Result<(), BotError> {
        if text.trim().is_empty() {
            return Err(BotError::Store("refusing to record empty text".to_string()));
        }

        let insert_query = format!(
            "INSERT INTO {} (text, posted_at) VALUES ($1, $2)",
            self.table
        );

        sqlx::query(&insert_query)
            .bind(text)
            .bind(posted_at)
            .execute(&self.db_pool)
            .await
            .map_err(|e| BotError::Store(e.to_string()))?;

        log::debug!("Recorded post made at {}", posted_at.to_rfc3339());
        Ok(())
    }
}

/// Embeddings keyed by model and exact history text, stored as pgvector columns
pub struct PgEmbeddingCache {
    db_pool: PgPool,
    table: String,
}

#[async_trait]
impl EmbeddingCache for PgEmbeddingCache {
    async fn lookup(
        &self,
        model: &str,
        texts: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<f32>>> {
        let query = format!(
            "SELECT text, embedding FROM {} WHERE model = $1 AND text = ANY($2)",
            self.table
        );

        let rows = sqlx::query(&query)
            .bind(model)
            .bind(texts.to_vec())
            .fetch_all(&self.db_pool)
            .await
            .context("Failed to read cached embeddings")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let embedding: Vector = row.get("embedding");
                (row.get::<String, _>("text"), embedding.to_vec())
            })
            .collect())
    }

    async fn store(&self, model: &str, entries: &[(String, Vec<f32>)]) -> anyhow::Result<()> {
        let insert_query = format!(
            "INSERT INTO {} (model, text, embedding) VALUES ($1, $2, $3) \
            ON CONFLICT (model, text) DO UPDATE SET embedding = EXCLUDED.embedding",
            self.table
        );

        for (text, embedding) in entries {
            sqlx::query(&insert_query)
                .bind(model)
                .bind(text)
                .bind(Vector::from(embedding.clone()))
                .execute(&self.db_pool)
                .await
                .context("Failed to cache embedding")?;
        }
        Ok(())
    }
}

/// Process-local history log
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<Vec<PostRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with already-published texts
    pub fn with_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        let records = texts
            .into_iter()
            .map(|t| PostRecord {
                text: t.into(),
                posted_at: now,
            })
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }

    /// Snapshot of every record
    pub fn records(&self) -> Vec<PostRecord> {
        self.records
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn load_all(&self) -> Result<Vec<String>, BotError> {
        let records = self
            .records
            .read()
            .map_err(|_| BotError::StoreUnavailable("history lock poisoned".to_string()))?;
        Ok(records.iter().map(|r| r.text.clone()).collect())
    }

    async fn append(&self, text: &str, posted_at: DateTime<Utc>) -> Result<(), BotError> {
        if text.trim().is_empty() {
            return Err(BotError::Store("refusing to record empty text".to_string()));
        }
        let mut records = self
            .records
            .write()
            .map_err(|_| BotError::Store("history lock poisoned".to_string()))?;
        records.push(PostRecord {
            text: text.to_string(),
            posted_at,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_plain_identifiers() {
        assert!(check_table_name("posted_tweets").is_ok());
        assert!(check_table_name("posts2").is_ok());
        assert!(check_table_name("").is_err());
        assert!(check_table_name("2posts").is_err());
        assert!(check_table_name("posts; DROP TABLE x").is_err());
    }

    #[tokio::test]
    async fn appended_text_is_visible_to_next_load() {
        let store = InMemoryHistoryStore::with_texts(["first"]);
        let ts = Utc::now();

        store.append("second", ts).await.unwrap();

        assert_eq!(store.load_all().await.unwrap(), vec!["first", "second"]);
        assert_eq!(store.records()[1].posted_at, ts);
    }

    #[tokio::test]
    async fn exact_duplicates_are_kept_in_order() {
        let store = InMemoryHistoryStore::new();
        store.append("same", Utc::now()).await.unwrap();
        store.append("other", Utc::now()).await.unwrap();
        store.append("same", Utc::now()).await.unwrap();

        assert_eq!(store.load_all().await.unwrap(), vec!["same", "other", "same"]);
    }

    #[tokio::test]
    async fn empty_text_is_not_recorded() {
        let store = InMemoryHistoryStore::new();
        let err = store.append("  ", Utc::now()).await.unwrap_err();
        assert!(matches!(err, BotError::Store(_)));
        assert!(store.records().is_empty());
    }
}
