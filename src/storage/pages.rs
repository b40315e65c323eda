use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::PageStoreSettings;
use crate::crawler::task::{JobId, PageRecord};

/// Outcome of offering a page: stored fresh, or a body-level duplicate of an
/// already indexed page. Duplicates are recorded as references, never
/// indexed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageInsert {
    Inserted,
    Duplicate { original_job: JobId },
}

/// Persistent home of accepted [`PageRecord`]s. A record outlives its job.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Store a page, deduplicating on content fingerprint.
    async fn insert_page(&self, record: &PageRecord) -> Result<PageInsert>;

    async fn get_page(&self, job_id: JobId) -> Result<Option<PageRecord>>;

    async fn page_count(&self) -> Result<u64>;
}

/// Factory selecting a page store backend from configuration.
pub struct PageStoreFactory;

impl PageStoreFactory {
    pub async fn create(settings: &PageStoreSettings) -> Result<Arc<dyn PageStore>> {
        match settings.backend.as_str() {
            "postgres" => {
                let store = PostgresPageStore::new(&settings.connection_string).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryPageStore::default())),
            other => anyhow::bail!("unsupported page store backend: {other}"),
        }
    }
}

/// PostgreSQL-backed store: one `pages` row per unique body, plus a
/// `page_duplicates` reference row for every fingerprint collision.
pub struct PostgresPageStore {
    pool: Pool<Postgres>,
}

impl PostgresPageStore {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await
            .context("Failed to connect to PostgreSQL page store")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        debug!("Connected page store to PostgreSQL");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pages (
                job_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                url TEXT NOT NULL,
                content_fingerprint TEXT NOT NULL UNIQUE,
                content_text TEXT NOT NULL,
                links JSONB NOT NULL,
                fetched_at TIMESTAMPTZ NOT NULL,
                relevance REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create pages table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS page_duplicates (
                job_id TEXT PRIMARY KEY,
                duplicate_of TEXT NOT NULL,
                url TEXT NOT NULL,
                fetched_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create page_duplicates table")?;

        Ok(())
    }
}

#[async_trait]
impl PageStore for PostgresPageStore {
    async fn insert_page(&self, record: &PageRecord) -> Result<PageInsert> {
        let inserted = sqlx::query(
            "INSERT INTO pages
                (job_id, task_id, url, content_fingerprint, content_text, links, fetched_at, relevance)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (content_fingerprint) DO NOTHING",
        )
        .bind(record.job_id.to_string())
        .bind(record.task_id.to_string())
        .bind(record.url.as_str())
        .bind(&record.content_fingerprint.0)
        .bind(&record.text)
        .bind(Json(&record.links))
        .bind(record.fetched_at)
        .bind(record.relevance)
        .execute(&self.pool)
        .await
        .context("Failed to insert page")?;

        if inserted.rows_affected() > 0 {
            return Ok(PageInsert::Inserted);
        }

        // Fingerprint collision: record a reference to the original.
        let original: String = sqlx::query_scalar(
            "SELECT job_id FROM pages WHERE content_fingerprint = $1",
        )
        .bind(&record.content_fingerprint.0)
        .fetch_one(&self.pool)
        .await
        .context("Failed to look up original page for duplicate")?;

        sqlx::query(
            "INSERT INTO page_duplicates (job_id, duplicate_of, url, fetched_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(record.job_id.to_string())
        .bind(&original)
        .bind(record.url.as_str())
        .bind(record.fetched_at)
        .execute(&self.pool)
        .await
        .context("Failed to record duplicate reference")?;

        let original_job = JobId(
            original
                .parse()
                .context("Malformed job id in pages table")?,
        );
        Ok(PageInsert::Duplicate { original_job })
    }

    async fn get_page(&self, job_id: JobId) -> Result<Option<PageRecord>> {
        let row = sqlx::query(
            "SELECT job_id, task_id, url, content_fingerprint, content_text, links, fetched_at, relevance
             FROM pages WHERE job_id = $1",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query page")?;

        let Some(row) = row else { return Ok(None) };

        let job_id: String = row.try_get("job_id")?;
        let task_id: String = row.try_get("task_id")?;
        let url: String = row.try_get("url")?;
        let links: Json<Vec<String>> = row.try_get("links")?;

        Ok(Some(PageRecord {
            job_id: JobId(job_id.parse().context("Malformed job id")?),
            task_id: crate::crawler::task::TaskId(task_id.parse().context("Malformed task id")?),
            url: url::Url::parse(&url).context("Malformed url in pages table")?,
            content_fingerprint: crate::crawler::task::ContentFingerprint(
                row.try_get("content_fingerprint")?,
            ),
            text: row.try_get("content_text")?,
            links: links.0,
            fetched_at: row.try_get("fetched_at")?,
            relevance: row.try_get("relevance")?,
        }))
    }

    async fn page_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count pages")?;
        Ok(count as u64)
    }
}

/// In-process store for tests and single-shot runs.
#[derive(Default)]
pub struct MemoryPageStore {
    by_fingerprint: Mutex<HashMap<String, PageRecord>>,
    duplicates: Mutex<HashMap<JobId, JobId>>,
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn insert_page(&self, record: &PageRecord) -> Result<PageInsert> {
        let mut pages = self.by_fingerprint.lock().await;
        if let Some(original) = pages.get(&record.content_fingerprint.0) {
            let original_job = original.job_id;
            self.duplicates.lock().await.insert(record.job_id, original_job);
            return Ok(PageInsert::Duplicate { original_job });
        }
        pages.insert(record.content_fingerprint.0.clone(), record.clone());
        Ok(PageInsert::Inserted)
    }

    async fn get_page(&self, job_id: JobId) -> Result<Option<PageRecord>> {
        let pages = self.by_fingerprint.lock().await;
        Ok(pages.values().find(|p| p.job_id == job_id).cloned())
    }

    async fn page_count(&self) -> Result<u64> {
        Ok(self.by_fingerprint.lock().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::TaskId;
    use crate::crawler::url;

    fn record(path: &str, body: &str) -> PageRecord {
        PageRecord {
            job_id: JobId::new(),
            task_id: TaskId::new(),
            url: url::normalize(&format!("https://example.com{path}")).unwrap(),
            content_fingerprint: url::content_fingerprint(body),
            text: body.to_string(),
            links: Vec::new(),
            fetched_at: chrono::Utc::now(),
            relevance: 0.5,
        }
    }

    #[tokio::test]
    async fn identical_bodies_dedup_to_one_page() {
        let store = MemoryPageStore::default();

        let first = record("/a", "same body");
        let second = record("/b", "same  body"); // volatile whitespace collides

        assert_eq!(store.insert_page(&first).await.unwrap(), PageInsert::Inserted);
        match store.insert_page(&second).await.unwrap() {
            PageInsert::Duplicate { original_job } => assert_eq!(original_job, first.job_id),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(store.page_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn distinct_bodies_both_stored() {
        let store = MemoryPageStore::default();
        store.insert_page(&record("/a", "body one")).await.unwrap();
        store.insert_page(&record("/b", "body two")).await.unwrap();
        assert_eq!(store.page_count().await.unwrap(), 2);
    }
}
