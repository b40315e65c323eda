use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::config::{CrawlSettings, RetrySettings};
use crate::crawler::task::{
    CrawlTask, FetchErrorKind, FetchJob, JobState, TaskId, TaskStatus,
};
use crate::storage::frontier_store::FrontierStore;

/// Exponential backoff with jitter: `base * 2^attempt +/- jitter`, capped.
/// A job's retry schedule is fully described by its attempt count and
/// not-before timestamp, so it survives a crash as plain data.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base: Duration::from_millis(settings.base_delay_ms),
            cap: Duration::from_millis(settings.max_delay_ms.max(settings.base_delay_ms)),
            jitter: Duration::from_millis(settings.jitter_ms),
        }
    }

    /// Delay before the given (1-based) retry attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.min(20));
        let millis = (self.base.as_millis() as u64).saturating_mul(exp);
        let capped = millis.min(self.cap.as_millis() as u64);

        let jitter_range = self.jitter.as_millis() as i64;
        let jittered = if jitter_range > 0 {
            let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped as i64 + offset).max(0) as u64
        } else {
            capped
        };

        Duration::from_millis(jittered.min(self.cap.as_millis() as u64))
    }
}

/// What to do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Back off and re-queue; the frontier holds the job until `not_before`.
    Retry { not_before: DateTime<Utc> },
    /// Attempts exhausted (or the task was cancelled): terminal failure.
    DeadLetter,
}

/// Owns the task state machines and every counter mutation. All task rows
/// are written through to the store so status reads are crash-consistent
/// snapshots.
pub struct LifecycleManager {
    tasks: Mutex<HashMap<TaskId, CrawlTask>>,
    store: Arc<dyn FrontierStore>,
    policy: RetryPolicy,
    failure_ratio_threshold: f64,
    count_external_failures: bool,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn FrontierStore>, policy: RetryPolicy, settings: &CrawlSettings) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            store,
            policy,
            failure_ratio_threshold: settings.failure_ratio_threshold,
            count_external_failures: settings.count_external_failures,
        }
    }

    /// Create and persist a new task in `Pending`.
    pub async fn create_task(&self, seeds: Vec<Url>, max_depth: u32, max_pages: u32) -> Result<CrawlTask> {
        let task = CrawlTask::new(seeds, max_depth, max_pages);
        self.store.put_task(&task).await.context("Failed to persist new task")?;
        self.tasks.lock().await.insert(task.id, task.clone());
        info!(task = %task.id, seeds = task.seeds.len(), "created crawl task");
        Ok(task)
    }

    /// `Pending -> Running` once seeding is done.
    pub async fn mark_running(&self, task_id: TaskId) -> Result<()> {
        self.advance(task_id, TaskStatus::Running).await
    }

    /// Count jobs admitted to the frontier.
    pub async fn note_queued(&self, task_id: TaskId, n: u64) -> Result<()> {
        self.mutate(task_id, |task| task.counters.queued += n).await
    }

    /// Count links rejected before dispatch.
    pub async fn note_skipped(&self, task_id: TaskId, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.mutate(task_id, |task| task.counters.skipped += n).await
    }

    /// A job settled successfully.
    pub async fn record_success(&self, job: &FetchJob) -> Result<()> {
        self.mutate(job.task_id, |task| task.counters.succeeded += 1).await
    }

    /// A job attempt failed. Decides retry versus dead-letter, updates the
    /// job in place and the task counters on dead-letter. Atomic per task:
    /// concurrent workers serialize on the task map.
    pub async fn record_failure(&self, job: &mut FetchJob, kind: FetchErrorKind) -> Result<FailureAction> {
        job.attempts += 1;
        job.last_error = Some(kind);

        let cancelled = {
            let tasks = self.tasks.lock().await;
            tasks
                .get(&job.task_id)
                .map(|t| t.status == TaskStatus::Cancelled)
                .unwrap_or(false)
        };

        // Cancelled tasks get no further attempts; otherwise retry up to the cap.
        if !cancelled && job.attempts < self.policy.max_attempts {
            let delay = self.policy.backoff(job.attempts);
            let not_before = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            job.state = JobState::Retrying;
            debug!(
                job = %job.id,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %kind,
                "scheduling retry"
            );
            return Ok(FailureAction::Retry { not_before });
        }

        job.state = JobState::DeadLettered;
        self.mutate(job.task_id, |task| {
            task.counters.failed += 1;
            *task.failure_kinds.entry(kind).or_insert(0) += 1;
        })
        .await?;
        warn!(job = %job.id, url = %job.url, attempts = job.attempts, error = %kind, "dead-lettered job");
        Ok(FailureAction::DeadLetter)
    }

    /// Called when a task may have run dry. With no live jobs left, a
    /// running task settles to `Completed`, or `Failed` when the dead-letter
    /// ratio among attempted jobs exceeds the configured threshold.
    pub async fn try_settle(&self, task_id: TaskId, live_jobs: u64) -> Result<Option<TaskStatus>> {
        if live_jobs > 0 {
            return Ok(None);
        }

        let outcome = {
            let tasks = self.tasks.lock().await;
            let Some(task) = tasks.get(&task_id) else {
                return Ok(None);
            };
            if task.status != TaskStatus::Running {
                return Ok(None);
            }

            let excluded: u64 = if self.count_external_failures {
                0
            } else {
                task.failure_kinds
                    .iter()
                    .filter(|(kind, _)| kind.is_external())
                    .map(|(_, count)| *count)
                    .sum()
            };
            let counted_failures = task.counters.failed.saturating_sub(excluded);
            let attempted = task.attempted();
            let ratio = if attempted == 0 {
                0.0
            } else {
                counted_failures as f64 / attempted as f64
            };

            if ratio > self.failure_ratio_threshold {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            }
        };

        self.advance(task_id, outcome).await?;
        info!(task = %task_id, status = %outcome, "task settled");
        Ok(Some(outcome))
    }

    /// Externally triggered cancellation. Returns false when the task was
    /// already terminal.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if !task.status.can_advance(TaskStatus::Cancelled) {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        self.store.put_task(task).await.context("Failed to persist cancellation")?;
        info!(task = %task_id, "cancelled task");
        Ok(true)
    }

    /// Eventually consistent snapshot of a task, live counters included.
    pub async fn snapshot(&self, task_id: TaskId) -> Option<CrawlTask> {
        self.tasks.lock().await.get(&task_id).cloned()
    }

    /// Tasks sorted newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<TaskStatus>, offset: usize, limit: usize) -> Vec<CrawlTask> {
        let tasks = self.tasks.lock().await;
        let mut all: Vec<CrawlTask> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.into_iter().skip(offset).take(limit).collect()
    }

    /// Load persisted tasks after a restart. Returns the non-terminal ones
    /// so the caller can re-register them with the frontier.
    pub async fn recover(&self) -> Result<Vec<CrawlTask>> {
        let rows = self.store.list_tasks().await?;
        let mut tasks = self.tasks.lock().await;
        let mut active = Vec::new();
        for task in rows {
            if !task.status.is_terminal() {
                active.push(task.clone());
            }
            tasks.insert(task.id, task);
        }
        Ok(active)
    }

    async fn advance(&self, task_id: TaskId, next: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            anyhow::bail!("unknown task: {task_id}");
        };
        if !task.status.can_advance(next) {
            warn!(task = %task_id, from = %task.status, to = %next, "illegal status transition ignored");
            return Ok(());
        }
        task.status = next;
        task.updated_at = Utc::now();
        self.store.put_task(task).await.context("Failed to persist task status")
    }

    async fn mutate<F>(&self, task_id: TaskId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut CrawlTask),
    {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            anyhow::bail!("unknown task: {task_id}");
        };
        apply(task);
        task.updated_at = Utc::now();
        self.store.put_task(task).await.context("Failed to persist task counters")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::url;
    use crate::storage::frontier_store::MemoryFrontierStore;

    fn policy(max_attempts: u32, base_ms: u64, cap_ms: u64, jitter_ms: u64) -> RetryPolicy {
        RetryPolicy::from_settings(&RetrySettings {
            max_attempts,
            base_delay_ms: base_ms,
            max_delay_ms: cap_ms,
            jitter_ms,
        })
    }

    fn manager(max_attempts: u32, threshold: f64, count_external: bool) -> LifecycleManager {
        let settings = CrawlSettings {
            failure_ratio_threshold: threshold,
            count_external_failures: count_external,
            ..CrawlSettings::default()
        };
        LifecycleManager::new(
            Arc::new(MemoryFrontierStore::default()),
            policy(max_attempts, 10, 10_000, 0),
            &settings,
        )
    }

    fn job(task_id: TaskId, raw: &str) -> FetchJob {
        let normalized = url::normalize(raw).unwrap();
        let fp = url::fingerprint(&normalized);
        FetchJob::new(task_id, normalized, fp, 0, 0)
    }

    fn seed() -> Vec<Url> {
        vec![url::normalize("https://example.com/").unwrap()]
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(5, 100, 1_000, 0);
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000), "capped");
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_jitter_stays_in_bounds() {
        let policy = policy(5, 100, 10_000, 50);
        for _ in 0..100 {
            let d = policy.backoff(2).as_millis() as i64;
            assert!((350..=450).contains(&d), "jittered delay out of bounds: {d}");
        }
    }

    #[tokio::test]
    async fn five_timeouts_dead_letter_exactly_once() {
        let manager = manager(5, 0.9, false);
        let task = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(task.id).await.unwrap();

        let mut job = job(task.id, "https://example.com/slow");
        for attempt in 1..=4 {
            let action = manager.record_failure(&mut job, FetchErrorKind::Timeout).await.unwrap();
            assert!(
                matches!(action, FailureAction::Retry { .. }),
                "attempt {attempt} should retry"
            );
            assert_eq!(job.state, JobState::Retrying);
        }

        let action = manager.record_failure(&mut job, FetchErrorKind::Timeout).await.unwrap();
        assert_eq!(action, FailureAction::DeadLetter);
        assert_eq!(job.state, JobState::DeadLettered);

        let snapshot = manager.snapshot(task.id).await.unwrap();
        assert_eq!(snapshot.counters.failed, 1, "failed counter incremented exactly once");
        assert_eq!(snapshot.failure_kinds.get(&FetchErrorKind::Timeout), Some(&1));
    }

    #[tokio::test]
    async fn retry_sets_a_future_not_before() {
        let manager = manager(3, 0.9, false);
        let task = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(task.id).await.unwrap();

        let mut job = job(task.id, "https://example.com/x");
        let before = Utc::now();
        match manager.record_failure(&mut job, FetchErrorKind::Network).await.unwrap() {
            FailureAction::Retry { not_before } => assert!(not_before > before),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_task_dead_letters_in_flight_failures_immediately() {
        let manager = manager(5, 0.9, false);
        let task = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(task.id).await.unwrap();
        assert!(manager.cancel(task.id).await.unwrap());

        let mut job = job(task.id, "https://example.com/x");
        let action = manager.record_failure(&mut job, FetchErrorKind::Network).await.unwrap();
        assert_eq!(action, FailureAction::DeadLetter, "no retries after cancellation");
    }

    #[tokio::test]
    async fn settle_completes_or_fails_by_ratio() {
        let manager = manager(1, 0.5, false);
        let task = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(task.id).await.unwrap();

        // 1 success, 2 network dead-letters: ratio 2/3 > 0.5.
        let ok = job(task.id, "https://example.com/ok");
        manager.record_success(&ok).await.unwrap();
        for path in ["https://example.com/a", "https://example.com/b"] {
            let mut j = job(task.id, path);
            let action = manager.record_failure(&mut j, FetchErrorKind::Network).await.unwrap();
            assert_eq!(action, FailureAction::DeadLetter);
        }

        assert_eq!(manager.try_settle(task.id, 1).await.unwrap(), None, "live jobs remain");
        let status = manager.try_settle(task.id, 0).await.unwrap();
        assert_eq!(status, Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn external_failures_are_excluded_from_the_ratio_by_default() {
        let manager = manager(1, 0.5, false);
        let task = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(task.id).await.unwrap();

        let ok = job(task.id, "https://example.com/ok");
        manager.record_success(&ok).await.unwrap();
        for path in ["https://example.com/a", "https://example.com/b"] {
            let mut j = job(task.id, path);
            manager.record_failure(&mut j, FetchErrorKind::RateLimited).await.unwrap();
        }

        let status = manager.try_settle(task.id, 0).await.unwrap();
        assert_eq!(status, Some(TaskStatus::Completed), "rate limiting is not crawl quality");
    }

    #[tokio::test]
    async fn external_failures_count_when_configured() {
        let manager = manager(1, 0.5, true);
        let task = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(task.id).await.unwrap();

        for path in ["https://example.com/a", "https://example.com/b"] {
            let mut j = job(task.id, path);
            manager.record_failure(&mut j, FetchErrorKind::Blocked).await.unwrap();
        }

        let status = manager.try_settle(task.id, 0).await.unwrap();
        assert_eq!(status, Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn terminal_statuses_are_immutable() {
        let manager = manager(1, 0.9, false);
        let task = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(task.id).await.unwrap();
        manager.try_settle(task.id, 0).await.unwrap();

        assert!(!manager.cancel(task.id).await.unwrap(), "completed task cannot be cancelled");
        let snapshot = manager.snapshot(task.id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_paginates() {
        let manager = manager(1, 0.9, false);
        let running = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(running.id).await.unwrap();
        let pending = manager.create_task(seed(), 1, 10).await.unwrap();

        let all = manager.list(None, 0, 10).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, pending.id, "newest first");

        let only_running = manager.list(Some(TaskStatus::Running), 0, 10).await;
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, running.id);

        assert_eq!(manager.list(None, 1, 10).await.len(), 1);
        assert_eq!(manager.list(None, 0, 1).await.len(), 1);
    }

    #[tokio::test]
    async fn counters_are_monotonic_snapshots() {
        let manager = manager(3, 0.9, false);
        let task = manager.create_task(seed(), 1, 10).await.unwrap();
        manager.mark_running(task.id).await.unwrap();

        manager.note_queued(task.id, 3).await.unwrap();
        manager.note_skipped(task.id, 1).await.unwrap();

        let snapshot = manager.snapshot(task.id).await.unwrap();
        assert_eq!(snapshot.counters.queued, 3);
        assert_eq!(snapshot.counters.skipped, 1);
        assert_eq!(snapshot.status, TaskStatus::Running, "snapshot readable mid-flight");
    }
}
