use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use url::Url;

use crate::cli::config::CrawlerConfig;
use crate::crawler::agent::{DecisionGate, KeywordJudge, PageJudge};
use crate::crawler::dispatcher::Dispatcher;
use crate::crawler::fetch::{FetchEngine, HttpFetchEngine};
use crate::crawler::frontier::{Frontier, PushOutcome, UrlFilter};
use crate::crawler::lifecycle::{LifecycleManager, RetryPolicy};
use crate::crawler::limiter::DomainRateLimiter;
use crate::crawler::task::{CrawlTask, FetchJob, TaskId, TaskStatus};
use crate::crawler::url::{fingerprint, normalize};
use crate::index::{Index, IndexingPipeline, MemoryIndex, SearchHit, SearchMode};
use crate::storage::frontier_store::{FrontierStore, FrontierStoreFactory};
use crate::storage::pages::{PageStore, PageStoreFactory};
use crate::utils::metrics::{CrawlMetrics, MetricsCollector};

/// The task submission surface of the engine: everything an HTTP layer or
/// the CLI needs, and nothing else.
pub struct Orchestrator {
    config: CrawlerConfig,
    frontier: Arc<Frontier>,
    lifecycle: Arc<LifecycleManager>,
    limiter: Arc<DomainRateLimiter>,
    pipeline: Arc<IndexingPipeline>,
    pages: Arc<dyn PageStore>,
    dispatcher: Dispatcher,
    metrics: Arc<MetricsCollector>,
    store: Arc<dyn FrontierStore>,
}

impl Orchestrator {
    /// Build from configuration with the stock collaborators: HTTP fetch
    /// engine, keyword judge, in-memory lexical index.
    pub async fn from_config(config: CrawlerConfig) -> Result<Self> {
        let store = FrontierStoreFactory::create(&config.storage.frontier).await?;
        let pages = PageStoreFactory::create(&config.storage.pages).await?;
        let engine = Arc::new(HttpFetchEngine::new(&config.fetch)?);
        let judge = Arc::new(KeywordJudge::new(&config.agent));
        let indexes: Vec<Arc<dyn Index>> = vec![Arc::new(MemoryIndex::default())];
        Ok(Self::assemble(config, store, pages, engine, judge, indexes))
    }

    /// Wire the engine from explicit parts. Tests and embedders use this to
    /// swap any collaborator.
    pub fn assemble(
        config: CrawlerConfig,
        store: Arc<dyn FrontierStore>,
        pages: Arc<dyn PageStore>,
        engine: Arc<dyn FetchEngine>,
        judge: Arc<dyn PageJudge>,
        indexes: Vec<Arc<dyn Index>>,
    ) -> Self {
        let limiter = Arc::new(DomainRateLimiter::new(&config.rate_limit));
        let frontier = Arc::new(Frontier::new(store.clone(), UrlFilter::new(&config.crawler)));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            RetryPolicy::from_settings(&config.retry),
            &config.crawler,
        ));
        let gate = Arc::new(DecisionGate::new(judge, &config.agent));
        let pipeline = Arc::new(IndexingPipeline::spawn(
            indexes,
            pages.clone(),
            RetryPolicy::from_settings(&config.index_retry),
        ));
        let metrics = Arc::new(MetricsCollector::new());

        let dispatcher = Dispatcher::new(
            frontier.clone(),
            lifecycle.clone(),
            limiter.clone(),
            gate,
            engine,
            pipeline.clone(),
            metrics.clone(),
            Duration::from_millis(config.crawler.fetch_timeout_ms),
            Duration::from_millis(config.crawler.poll_interval_ms),
        );

        Self {
            config,
            frontier,
            lifecycle,
            limiter,
            pipeline,
            pages,
            dispatcher,
            metrics,
            store,
        }
    }

    /// Launch the worker pool.
    pub async fn start(&self) {
        self.dispatcher.start(self.config.crawler.worker_count).await;
    }

    /// Stop workers, drain the indexing pipeline, persist domain state.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.pipeline.shutdown().await;
        if let Err(e) = self.store.put_domains(&self.limiter.snapshot()).await {
            error!(error = %e, "failed to persist domain state");
        }
    }

    /// Rebuild tasks, live jobs and domain breaker state after a restart.
    /// Returns the number of recovered jobs.
    pub async fn recover(&self) -> Result<usize> {
        let active = self.lifecycle.recover().await?;
        for task in &active {
            self.frontier.register_task(task).await;
        }
        let jobs = self.frontier.recover().await?;
        self.limiter.restore(self.store.load_domains().await?);
        if jobs > 0 {
            info!(tasks = active.len(), jobs, "recovered crawl state");
        }
        Ok(jobs)
    }

    /// Submit a crawl: one task over one or more seed URLs. Invalid URLs are
    /// rejected here and never retried.
    pub async fn submit(
        &self,
        seeds: Vec<String>,
        max_depth: Option<u32>,
        max_pages: Option<u32>,
    ) -> Result<TaskId> {
        if seeds.is_empty() {
            anyhow::bail!("a crawl task needs at least one seed URL");
        }

        let mut normalized: Vec<Url> = Vec::with_capacity(seeds.len());
        for raw in &seeds {
            normalized.push(normalize(raw).context("rejected seed URL")?);
        }

        let max_depth = max_depth.unwrap_or(self.config.crawler.default_max_depth);
        let max_pages = max_pages.unwrap_or(self.config.crawler.default_max_pages);

        let task = self.lifecycle.create_task(normalized.clone(), max_depth, max_pages).await?;
        self.frontier.register_task(&task).await;

        let mut accepted = 0u64;
        let mut skipped = 0u64;
        for seed in normalized {
            let fp = fingerprint(&seed);
            let job = FetchJob::new(task.id, seed, fp, 0, 0);
            match self.frontier.push(job).await? {
                PushOutcome::Accepted => accepted += 1,
                PushOutcome::Duplicate => {}
                PushOutcome::LimitExceeded | PushOutcome::Filtered => skipped += 1,
                PushOutcome::TaskInactive => {}
            }
        }

        if accepted > 0 {
            self.lifecycle.note_queued(task.id, accepted).await?;
        }
        self.lifecycle.note_skipped(task.id, skipped).await?;
        self.lifecycle.mark_running(task.id).await?;

        // A submission whose seeds were all rejected settles right away.
        let live = self.frontier.live_count(task.id).await;
        self.lifecycle.try_settle(task.id, live).await?;

        Ok(task.id)
    }

    /// Cancel a task: no new jobs dispatch or queue once this returns;
    /// in-flight jobs settle normally.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        let cancelled = self.lifecycle.cancel(task_id).await?;
        if cancelled {
            let drained = self.frontier.cancel_task(task_id).await?;
            self.lifecycle.note_skipped(task_id, drained.len() as u64).await?;
        }
        Ok(cancelled)
    }

    /// Latest known snapshot, counters included, even while jobs fly.
    pub async fn status(&self, task_id: TaskId) -> Option<CrawlTask> {
        self.lifecycle.snapshot(task_id).await
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        offset: usize,
        limit: usize,
    ) -> Vec<CrawlTask> {
        self.lifecycle.list(status, offset, limit).await
    }

    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        self.pipeline
            .search(query, mode, limit)
            .await
            .map_err(|e| anyhow::anyhow!("search failed: {e}"))
    }

    pub async fn metrics(&self) -> CrawlMetrics {
        self.metrics.snapshot().await
    }

    pub async fn page_count(&self) -> Result<u64> {
        self.pages.page_count().await
    }

    /// Block until the task is terminal and its last in-flight job settled.
    pub async fn wait_until_settled(&self, task_id: TaskId, poll: Duration) -> Result<CrawlTask> {
        loop {
            let Some(task) = self.lifecycle.snapshot(task_id).await else {
                anyhow::bail!("unknown task: {task_id}");
            };
            if task.status.is_terminal() && self.frontier.live_count(task_id).await == 0 {
                return Ok(task);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
