use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use url::Url;

use crate::crawler::agent::DecisionGate;
use crate::crawler::fetch::{FetchEngine, FetchedPage};
use crate::crawler::frontier::{Frontier, PushOutcome};
use crate::crawler::lifecycle::{FailureAction, LifecycleManager};
use crate::crawler::limiter::DomainRateLimiter;
use crate::crawler::task::{FetchErrorKind, FetchJob, JobState, PageRecord, TaskId};
use crate::crawler::url::{content_fingerprint, fingerprint, resolve_link};
use crate::index::IndexingPipeline;
use crate::utils::metrics::MetricsCollector;

/// Shared context cloned into every worker.
#[derive(Clone)]
struct WorkerCtx {
    frontier: Arc<Frontier>,
    lifecycle: Arc<LifecycleManager>,
    limiter: Arc<DomainRateLimiter>,
    gate: Arc<DecisionGate>,
    engine: Arc<dyn FetchEngine>,
    pipeline: Arc<IndexingPipeline>,
    metrics: Arc<MetricsCollector>,
    fetch_timeout: Duration,
    poll_interval: Duration,
}

/// Fixed-size worker pool draining ready jobs from the frontier. Workers
/// block only on the fetch collaborator or while waiting for admission;
/// every fetch is raced against a hard deadline so a hung collaborator
/// costs one timeout, not a worker.
pub struct Dispatcher {
    ctx: WorkerCtx,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frontier: Arc<Frontier>,
        lifecycle: Arc<LifecycleManager>,
        limiter: Arc<DomainRateLimiter>,
        gate: Arc<DecisionGate>,
        engine: Arc<dyn FetchEngine>,
        pipeline: Arc<IndexingPipeline>,
        metrics: Arc<MetricsCollector>,
        fetch_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx: WorkerCtx {
                frontier,
                lifecycle,
                limiter,
                gate,
                engine,
                pipeline,
                metrics,
                fetch_timeout,
                poll_interval,
            },
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Launch `count` workers.
    pub async fn start(&self, count: usize) {
        let mut workers = self.workers.lock().await;
        for i in 0..count.max(1) {
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                debug!(worker = i, "worker started");
                // The flag is only checked between jobs: an in-flight fetch
                // always settles (or times out) normally before the worker
                // exits.
                while !*shutdown.borrow() {
                    worker_tick(&ctx).await;
                }
                debug!(worker = i, "worker stopped");
            }));
        }
        info!(workers = workers.len(), "dispatcher running");
    }

    /// Stop all workers after their current job.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "worker panicked");
            }
        }
    }
}

/// One scheduling round for one worker: find a ready job, get admission,
/// run it. Idles briefly when nothing is dispatchable.
async fn worker_tick(ctx: &WorkerCtx) {
    let domains = ctx.frontier.active_domains().await;
    let ready = ctx.limiter.filter_ready(domains);

    let job = if ready.is_empty() {
        None
    } else {
        match ctx.frontier.pop(&ready).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "frontier pop failed");
                None
            }
        }
    };

    let Some(job) = job else {
        ctx.limiter.wait_for_change(ctx.poll_interval).await;
        return;
    };

    // Readiness was checked before pop; a concurrent worker may still take
    // the slot in between. The job goes back untouched, still live.
    match ctx.limiter.try_acquire(&job.domain) {
        Ok(token) => execute_job(ctx, job, token).await,
        Err(denied) => {
            debug!(domain = %job.domain, ?denied, "lost admission race, reinstating job");
            let task_id = job.task_id;
            match ctx.frontier.reinstate(job).await {
                Ok(true) => {}
                Ok(false) => {
                    // Task cancelled while the job was in hand.
                    if let Err(e) = ctx.lifecycle.note_skipped(task_id, 1).await {
                        error!(error = %e, "failed to count skipped job");
                    }
                    maybe_settle_task(ctx, task_id).await;
                }
                Err(e) => error!(error = %e, "failed to reinstate job"),
            }
        }
    }
}

/// Fetch one job under the hard timeout and route the outcome. The domain
/// slot is returned the moment the fetch settles; gate and indexing work
/// happen outside it.
async fn execute_job(ctx: &WorkerCtx, mut job: FetchJob, token: crate::crawler::limiter::DomainToken) {
    let started = Instant::now();
    let outcome = tokio::time::timeout(ctx.fetch_timeout, ctx.engine.fetch(&job.url)).await;
    ctx.limiter.release(token);

    match outcome {
        Ok(Ok(page)) => {
            ctx.limiter.record_success(&job.domain);
            ctx.metrics
                .record_fetch(true, None, started.elapsed(), page.html.len())
                .await;
            handle_fetched(ctx, &mut job, page).await;
        }
        Ok(Err(failure)) => {
            let kind = failure.kind();
            debug!(url = %job.url, error = %failure, "fetch failed");
            handle_failure(ctx, job, kind, started).await;
        }
        Err(_elapsed) => {
            debug!(
                url = %job.url,
                timeout_ms = ctx.fetch_timeout.as_millis() as u64,
                "fetch timed out, reclaiming worker"
            );
            handle_failure(ctx, job, FetchErrorKind::Timeout, started).await;
        }
    }
}

async fn handle_failure(ctx: &WorkerCtx, mut job: FetchJob, kind: FetchErrorKind, started: Instant) {
    ctx.limiter.record_failure(&job.domain);
    ctx.metrics.record_fetch(false, Some(kind), started.elapsed(), 0).await;

    match ctx.lifecycle.record_failure(&mut job, kind).await {
        Ok(FailureAction::Retry { not_before }) => {
            if let Err(e) = ctx.frontier.schedule_retry(job, not_before).await {
                error!(error = %e, "failed to schedule retry");
            }
        }
        Ok(FailureAction::DeadLetter) => {
            let task_id = job.task_id;
            if let Err(e) = ctx.frontier.settle(job.task_id, &job.fingerprint).await {
                error!(error = %e, "failed to settle dead-lettered job");
            }
            maybe_settle_task(ctx, task_id).await;
        }
        Err(e) => error!(error = %e, "failed to record job failure"),
    }
}

/// Successful fetch: build the page record, run the decision gate, seed
/// accepted links back into the frontier and ship kept content to indexing.
async fn handle_fetched(ctx: &WorkerCtx, job: &mut FetchJob, page: FetchedPage) {
    let mut record = PageRecord {
        job_id: job.id,
        task_id: job.task_id,
        url: job.url.clone(),
        content_fingerprint: content_fingerprint(&page.text),
        text: page.text,
        links: page.links.clone(),
        fetched_at: Utc::now(),
        relevance: 0.0,
    };

    let discovered: Vec<Url> = page
        .links
        .iter()
        .filter_map(|raw| resolve_link(&job.url, raw).ok())
        .collect();
    let discovered_count = discovered.len() as u64;

    let verdict = ctx.gate.evaluate(&record, discovered).await;
    record.relevance = verdict.relevance;

    // Links the agent declined never become jobs: skipped without ever
    // consuming a fetch attempt.
    let mut skipped = discovered_count.saturating_sub(verdict.follow.len() as u64);
    let mut accepted = 0u64;

    for (link, priority) in verdict.follow {
        let fp = fingerprint(&link);
        let child = FetchJob::new(job.task_id, link, fp, job.depth + 1, priority);
        match ctx.frontier.push(child).await {
            Ok(PushOutcome::Accepted) => accepted += 1,
            Ok(PushOutcome::Duplicate) => {}
            Ok(PushOutcome::LimitExceeded) | Ok(PushOutcome::Filtered) => skipped += 1,
            Ok(PushOutcome::TaskInactive) => {}
            Err(e) => error!(error = %e, "failed to push discovered link"),
        }
    }

    if accepted > 0 {
        if let Err(e) = ctx.lifecycle.note_queued(job.task_id, accepted).await {
            error!(error = %e, "failed to count queued jobs");
        }
    }
    if let Err(e) = ctx.lifecycle.note_skipped(job.task_id, skipped).await {
        error!(error = %e, "failed to count skipped links");
    }

    if verdict.keep {
        if let Err(e) = ctx.pipeline.submit(record).await {
            error!(error = %e, "failed to submit page for indexing");
        }
    } else {
        debug!(url = %job.url, relevance = verdict.relevance, "agent discarded page content");
    }

    job.state = JobState::Succeeded;
    if let Err(e) = ctx.lifecycle.record_success(job).await {
        error!(error = %e, "failed to record job success");
    }
    let task_id = job.task_id;
    if let Err(e) = ctx.frontier.settle(job.task_id, &job.fingerprint).await {
        error!(error = %e, "failed to settle job");
    }
    maybe_settle_task(ctx, task_id).await;
}

async fn maybe_settle_task(ctx: &WorkerCtx, task_id: TaskId) {
    let live = ctx.frontier.live_count(task_id).await;
    if let Err(e) = ctx.lifecycle.try_settle(task_id, live).await {
        error!(error = %e, "failed to settle task");
    }
}
