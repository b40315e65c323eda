use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::FrontierStoreSettings;
use crate::crawler::limiter::DomainStateRow;
use crate::crawler::task::{CrawlTask, FetchJob, TaskId, UrlFingerprint};

const JOBS_KEY: &str = "frontier:jobs";
const TASKS_KEY: &str = "frontier:tasks";
const DOMAINS_KEY: &str = "frontier:domains";

/// Durable backing table for the frontier: live job rows keyed by
/// `(task id, url fingerprint)`, task snapshots, and domain breaker rows.
/// Every frontier mutation is written here before it is acknowledged, so a
/// restart can rebuild the exact live set.
#[async_trait]
pub trait FrontierStore: Send + Sync {
    /// Insert or update a live job row.
    async fn put_job(&self, job: &FetchJob) -> Result<()>;

    /// Drop the row for a job that reached a terminal state.
    async fn remove_job(&self, task_id: TaskId, fingerprint: &UrlFingerprint) -> Result<()>;

    /// All live job rows, for crash recovery.
    async fn load_jobs(&self) -> Result<Vec<FetchJob>>;

    async fn put_task(&self, task: &CrawlTask) -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<Option<CrawlTask>>;

    async fn list_tasks(&self) -> Result<Vec<CrawlTask>>;

    async fn put_domains(&self, rows: &[DomainStateRow]) -> Result<()>;

    async fn load_domains(&self) -> Result<Vec<DomainStateRow>>;
}

/// Factory selecting a store backend from configuration.
pub struct FrontierStoreFactory;

impl FrontierStoreFactory {
    pub async fn create(settings: &FrontierStoreSettings) -> Result<Arc<dyn FrontierStore>> {
        match settings.backend.as_str() {
            "redis" => {
                let store = RedisFrontierStore::new(&settings.redis_url).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryFrontierStore::default())),
            other => anyhow::bail!("unsupported frontier store backend: {other}"),
        }
    }
}

fn job_field(task_id: TaskId, fingerprint: &UrlFingerprint) -> String {
    format!("{task_id}:{fingerprint}")
}

/// Redis-backed store. Job, task and domain rows live in three hashes so a
/// single `HGETALL` per hash rebuilds the world on restart.
pub struct RedisFrontierStore {
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisFrontierStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url.to_string())
            .context(format!("Failed to open Redis client for {redis_url}"))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        debug!("Connected frontier store to Redis");

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn hash_put(&self, key: &str, field: &str, value: String) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to write {key}/{field} to Redis"))?;
        Ok(())
    }

    async fn hash_values(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let values: Vec<String> = redis::cmd("HVALS")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .context(format!("Failed to read {key} from Redis"))?;
        Ok(values)
    }
}

#[async_trait]
impl FrontierStore for RedisFrontierStore {
    async fn put_job(&self, job: &FetchJob) -> Result<()> {
        let value = serde_json::to_string(job).context("Failed to serialize job")?;
        self.hash_put(JOBS_KEY, &job_field(job.task_id, &job.fingerprint), value).await
    }

    async fn remove_job(&self, task_id: TaskId, fingerprint: &UrlFingerprint) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("HDEL")
            .arg(JOBS_KEY)
            .arg(job_field(task_id, fingerprint))
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to remove job row from Redis")?;
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<FetchJob>> {
        let values = self.hash_values(JOBS_KEY).await?;
        values
            .iter()
            .map(|v| serde_json::from_str(v).context("Failed to deserialize job row"))
            .collect()
    }

    async fn put_task(&self, task: &CrawlTask) -> Result<()> {
        let value = serde_json::to_string(task).context("Failed to serialize task")?;
        self.hash_put(TASKS_KEY, &task.id.to_string(), value).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<CrawlTask>> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = redis::cmd("HGET")
            .arg(TASKS_KEY)
            .arg(id.to_string())
            .query_async(&mut *conn)
            .await
            .context("Failed to read task row from Redis")?;

        value
            .map(|v| serde_json::from_str(&v).context("Failed to deserialize task row"))
            .transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<CrawlTask>> {
        let values = self.hash_values(TASKS_KEY).await?;
        values
            .iter()
            .map(|v| serde_json::from_str(v).context("Failed to deserialize task row"))
            .collect()
    }

    async fn put_domains(&self, rows: &[DomainStateRow]) -> Result<()> {
        for row in rows {
            let value = serde_json::to_string(row).context("Failed to serialize domain row")?;
            self.hash_put(DOMAINS_KEY, &row.domain, value).await?;
        }
        Ok(())
    }

    async fn load_domains(&self) -> Result<Vec<DomainStateRow>> {
        let values = self.hash_values(DOMAINS_KEY).await?;
        values
            .iter()
            .map(|v| serde_json::from_str(v).context("Failed to deserialize domain row"))
            .collect()
    }
}

/// In-process store for tests and single-shot runs. Same contract, no
/// durability across processes.
#[derive(Default)]
pub struct MemoryFrontierStore {
    jobs: Mutex<HashMap<String, FetchJob>>,
    tasks: Mutex<HashMap<TaskId, CrawlTask>>,
    domains: Mutex<HashMap<String, DomainStateRow>>,
}

#[async_trait]
impl FrontierStore for MemoryFrontierStore {
    async fn put_job(&self, job: &FetchJob) -> Result<()> {
        self.jobs
            .lock()
            .await
            .insert(job_field(job.task_id, &job.fingerprint), job.clone());
        Ok(())
    }

    async fn remove_job(&self, task_id: TaskId, fingerprint: &UrlFingerprint) -> Result<()> {
        self.jobs.lock().await.remove(&job_field(task_id, fingerprint));
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<FetchJob>> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn put_task(&self, task: &CrawlTask) -> Result<()> {
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<CrawlTask>> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<CrawlTask>> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }

    async fn put_domains(&self, rows: &[DomainStateRow]) -> Result<()> {
        let mut domains = self.domains.lock().await;
        for row in rows {
            domains.insert(row.domain.clone(), row.clone());
        }
        Ok(())
    }

    async fn load_domains(&self) -> Result<Vec<DomainStateRow>> {
        Ok(self.domains.lock().await.values().cloned().collect())
    }
}
