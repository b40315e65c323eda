use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::CrawlSettings;
use crate::crawler::task::{CrawlTask, FetchJob, JobState, TaskId, UrlFingerprint};
use crate::crawler::url::is_static_resource;
use crate::storage::frontier_store::FrontierStore;

/// Result of offering a job to the frontier. Only `Accepted` queues work;
/// the rest are normal outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The task already saw this fingerprint.
    Duplicate,
    /// Beyond max depth, or the task's page budget is spent.
    LimitExceeded,
    /// Rejected by URL patterns, domain allow-list, or the static-asset filter.
    Filtered,
    /// The task is cancelled or unknown; nothing is queued after cancellation
    /// is observed here.
    TaskInactive,
}

/// URL admission rules applied at push time, compiled once from settings.
pub struct UrlFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    allowed_domains: HashSet<String>,
    skip_static: bool,
}

impl UrlFilter {
    pub fn new(settings: &CrawlSettings) -> Self {
        let compile = |patterns: &[String], kind: &str| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|pattern| match Regex::new(pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!("Invalid {kind} pattern '{pattern}': {e}");
                        None
                    }
                })
                .collect()
        };

        Self {
            include: compile(&settings.url_patterns.include, "include"),
            exclude: compile(&settings.url_patterns.exclude, "exclude"),
            allowed_domains: settings.allowed_domains.iter().map(|d| d.to_lowercase()).collect(),
            skip_static: settings.skip_static_resources,
        }
    }

    pub fn allows(&self, candidate: &Url) -> bool {
        if self.skip_static && is_static_resource(candidate) {
            return false;
        }

        if !self.allowed_domains.is_empty() {
            let Some(host) = candidate.host_str().map(|h| h.to_lowercase()) else {
                return false;
            };
            let permitted = self
                .allowed_domains
                .iter()
                .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")));
            if !permitted {
                return false;
            }
        }

        let text = candidate.as_str();
        if self.exclude.iter().any(|p| p.is_match(text)) {
            return false;
        }
        if !self.include.is_empty() && !self.include.iter().any(|p| p.is_match(text)) {
            return false;
        }
        true
    }
}

/// Heap entry: higher priority first, then earliest admission (FIFO within a
/// tier) so old low-priority jobs are not starved.
struct Prioritized(FetchJob);

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.seq == other.0.seq
    }
}

impl Eq for Prioritized {}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

struct TaskEntry {
    max_depth: u32,
    max_pages: u32,
    active: bool,
    /// Jobs ever admitted; the page budget is charged here at push time.
    admitted: u64,
    /// Fingerprints this task has seen, live or settled.
    seen: HashSet<UrlFingerprint>,
    /// Jobs not yet in a terminal state (queued, delayed, or in flight).
    live: u64,
}

#[derive(Default)]
struct FrontierState {
    queues: HashMap<String, BinaryHeap<Prioritized>>,
    /// Backing-off jobs keyed by (not-before, seq); promoted on pop.
    delayed: BTreeMap<(DateTime<Utc>, u64), FetchJob>,
    tasks: HashMap<TaskId, TaskEntry>,
    /// URLs currently handed to workers, across all tasks. The fetch
    /// collaborator is never called concurrently for the same URL.
    in_flight_urls: HashMap<UrlFingerprint, u32>,
    next_seq: u64,
}

impl FrontierState {
    fn enqueue(&mut self, job: FetchJob, now: DateTime<Utc>) {
        if !job.is_ready(now) {
            let key = (job.not_before.unwrap_or(now), job.seq);
            self.delayed.insert(key, job);
        } else {
            self.queues.entry(job.domain.clone()).or_default().push(Prioritized(job));
        }
    }

    fn url_returned(&mut self, fingerprint: &UrlFingerprint) {
        if let Some(count) = self.in_flight_urls.get_mut(fingerprint) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight_urls.remove(fingerprint);
            }
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<(DateTime<Utc>, u64)> = self
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            if let Some(job) = self.delayed.remove(&key) {
                self.queues.entry(job.domain.clone()).or_default().push(Prioritized(job));
            }
        }
    }
}

/// Prioritized, deduplicated, multi-task work queue. A single serialized
/// actor internally; durability is write-through to the [`FrontierStore`]
/// before any push/pop/settle is acknowledged.
pub struct Frontier {
    state: tokio::sync::Mutex<FrontierState>,
    store: Arc<dyn FrontierStore>,
    filter: UrlFilter,
}

impl Frontier {
    pub fn new(store: Arc<dyn FrontierStore>, filter: UrlFilter) -> Self {
        Self {
            state: tokio::sync::Mutex::new(FrontierState::default()),
            store,
            filter,
        }
    }

    /// Make the frontier aware of a task and its limits. Idempotent.
    pub async fn register_task(&self, task: &CrawlTask) {
        let mut state = self.state.lock().await;
        state.tasks.entry(task.id).or_insert_with(|| TaskEntry {
            max_depth: task.max_depth,
            max_pages: task.max_pages,
            active: !task.status.is_terminal(),
            admitted: task.counters.queued,
            seen: HashSet::new(),
            live: 0,
        });
    }

    /// Offer a job. Depth, page budget, dedup and URL filters are all
    /// enforced here; an accepted job is durable before this returns.
    pub async fn push(&self, mut job: FetchJob) -> Result<PushOutcome> {
        let mut state = self.state.lock().await;

        let Some(entry) = state.tasks.get(&job.task_id) else {
            return Ok(PushOutcome::TaskInactive);
        };
        if !entry.active {
            return Ok(PushOutcome::TaskInactive);
        }
        if job.depth > entry.max_depth {
            return Ok(PushOutcome::LimitExceeded);
        }
        if entry.seen.contains(&job.fingerprint) {
            return Ok(PushOutcome::Duplicate);
        }
        if entry.admitted >= entry.max_pages as u64 {
            return Ok(PushOutcome::LimitExceeded);
        }
        if !self.filter.allows(&job.url) {
            return Ok(PushOutcome::Filtered);
        }

        job.seq = state.next_seq;
        state.next_seq += 1;
        job.state = JobState::Queued;

        // Durable before acknowledged.
        self.store.put_job(&job).await?;

        let entry = state
            .tasks
            .get_mut(&job.task_id)
            .expect("task entry checked above");
        entry.seen.insert(job.fingerprint.clone());
        entry.admitted += 1;
        entry.live += 1;

        debug!(task = %job.task_id, url = %job.url, depth = job.depth, "queued job");
        state.enqueue(job, Utc::now());
        Ok(PushOutcome::Accepted)
    }

    /// Take the best ready job: highest priority whose not-before has
    /// elapsed, among domains in `ready`, FIFO within a priority tier. The
    /// returned job is marked in flight and persisted as such.
    pub async fn pop(&self, ready: &HashSet<String>) -> Result<Option<FetchJob>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.promote_due(now);

        let mut best: Option<&str> = None;
        for (domain, heap) in &state.queues {
            if !ready.contains(domain) {
                continue;
            }
            let Some(top) = heap.peek() else { continue };
            // Another task may have the same URL out already; never fetch
            // one URL concurrently.
            if state.in_flight_urls.contains_key(&top.0.fingerprint) {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    let current_top = state.queues[current].peek().expect("non-empty heap");
                    top > current_top
                }
            };
            if better {
                best = Some(domain.as_str());
            }
        }

        let Some(domain) = best.map(str::to_string) else {
            return Ok(None);
        };

        let heap = state.queues.get_mut(&domain).expect("chosen heap exists");
        let mut job = heap.pop().expect("peeked job still present").0;
        if heap.is_empty() {
            state.queues.remove(&domain);
        }

        job.state = JobState::InFlight;
        if let Err(e) = self.store.put_job(&job).await {
            // Not handed out; put it back so nothing is lost.
            job.state = JobState::Queued;
            state.enqueue(job, now);
            return Err(e);
        }

        *state.in_flight_urls.entry(job.fingerprint.clone()).or_insert(0) += 1;
        Ok(Some(job))
    }

    /// Return a popped job whose admission was lost to a concurrent worker.
    /// Not a duplicate: its fingerprint is still live. If the task was
    /// cancelled in the meantime the job is dropped instead, and `false`
    /// comes back so the caller can count it as skipped.
    pub async fn reinstate(&self, mut job: FetchJob) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.url_returned(&job.fingerprint);

        let active = state.tasks.get(&job.task_id).map(|e| e.active).unwrap_or(false);
        if !active {
            self.store.remove_job(job.task_id, &job.fingerprint).await?;
            if let Some(entry) = state.tasks.get_mut(&job.task_id) {
                entry.live = entry.live.saturating_sub(1);
            }
            return Ok(false);
        }

        job.state = JobState::Queued;
        self.store.put_job(&job).await?;
        state.enqueue(job, Utc::now());
        Ok(true)
    }

    /// Re-queue a failed job for a later attempt. The retry schedule is
    /// plain data: attempt count plus not-before, nothing to replay on
    /// recovery.
    pub async fn schedule_retry(&self, mut job: FetchJob, not_before: DateTime<Utc>) -> Result<()> {
        job.state = JobState::Queued;
        job.not_before = Some(not_before);
        self.store.put_job(&job).await?;
        let mut state = self.state.lock().await;
        state.url_returned(&job.fingerprint);
        state.enqueue(job, Utc::now());
        Ok(())
    }

    /// A job reached a terminal state: drop its durable row and its live
    /// accounting. The fingerprint stays seen so the task never refetches it.
    pub async fn settle(&self, task_id: TaskId, fingerprint: &UrlFingerprint) -> Result<()> {
        self.store.remove_job(task_id, fingerprint).await?;
        let mut state = self.state.lock().await;
        state.url_returned(fingerprint);
        if let Some(entry) = state.tasks.get_mut(&task_id) {
            entry.live = entry.live.saturating_sub(1);
        }
        Ok(())
    }

    /// Stop accepting and dispatching work for a task. Queued and delayed
    /// jobs are drained and returned (the caller records them as skipped);
    /// in-flight jobs are untouched and settle normally.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<Vec<FetchJob>> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state.tasks.get_mut(&task_id) {
            entry.active = false;
        }

        let mut drained = Vec::new();
        for heap in state.queues.values_mut() {
            let kept = std::mem::take(heap)
                .into_iter()
                .filter_map(|Prioritized(job)| {
                    if job.task_id == task_id {
                        drained.push(job);
                        None
                    } else {
                        Some(Prioritized(job))
                    }
                })
                .collect();
            *heap = kept;
        }
        state.queues.retain(|_, heap| !heap.is_empty());

        let delayed_keys: Vec<(DateTime<Utc>, u64)> = state
            .delayed
            .iter()
            .filter(|(_, job)| job.task_id == task_id)
            .map(|(key, _)| *key)
            .collect();
        for key in delayed_keys {
            if let Some(job) = state.delayed.remove(&key) {
                drained.push(job);
            }
        }

        for job in &mut drained {
            job.state = JobState::Skipped;
            self.store.remove_job(task_id, &job.fingerprint).await?;
        }
        if let Some(entry) = state.tasks.get_mut(&task_id) {
            entry.live = entry.live.saturating_sub(drained.len() as u64);
        }

        debug!(task = %task_id, drained = drained.len(), "cancelled task in frontier");
        Ok(drained)
    }

    /// Jobs not yet terminal for a task (queued, delayed, or in flight).
    pub async fn live_count(&self, task_id: TaskId) -> u64 {
        let state = self.state.lock().await;
        state.tasks.get(&task_id).map(|e| e.live).unwrap_or(0)
    }

    /// Domains with at least one queued job, the input to ready filtering.
    pub async fn active_domains(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.queues.keys().cloned().collect()
    }

    /// Queued plus delayed jobs across all tasks.
    pub async fn pending_count(&self) -> usize {
        let state = self.state.lock().await;
        state.queues.values().map(|h| h.len()).sum::<usize>() + state.delayed.len()
    }

    /// Rebuild live jobs from the store after a restart. Tasks must be
    /// registered first. In-flight rows are re-queued: the fetch outcome was
    /// never recorded, so the work is not lost and not duplicated.
    pub async fn recover(&self) -> Result<usize> {
        let rows = self.store.load_jobs().await?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut recovered = 0;

        for mut job in rows {
            let Some(entry) = state.tasks.get_mut(&job.task_id) else {
                warn!(task = %job.task_id, "dropping job row for unknown task");
                self.store.remove_job(job.task_id, &job.fingerprint).await?;
                continue;
            };
            if !entry.active {
                self.store.remove_job(job.task_id, &job.fingerprint).await?;
                continue;
            }

            entry.seen.insert(job.fingerprint.clone());
            entry.live += 1;
            state.next_seq = state.next_seq.max(job.seq + 1);

            job.state = JobState::Queued;
            state.enqueue(job, now);
            recovered += 1;
        }

        debug!(recovered, "rebuilt frontier from store");
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::CrawlSettings;
    use crate::crawler::task::CrawlTask;
    use crate::crawler::url::{fingerprint, normalize};
    use crate::storage::frontier_store::MemoryFrontierStore;

    fn frontier() -> Frontier {
        let settings = CrawlSettings::default();
        Frontier::new(Arc::new(MemoryFrontierStore::default()), UrlFilter::new(&settings))
    }

    fn frontier_with(settings: &CrawlSettings) -> Frontier {
        Frontier::new(Arc::new(MemoryFrontierStore::default()), UrlFilter::new(settings))
    }

    fn task(max_depth: u32, max_pages: u32) -> CrawlTask {
        let seed = normalize("https://example.com/").unwrap();
        CrawlTask::new(vec![seed], max_depth, max_pages)
    }

    fn job_for(task_id: TaskId, raw: &str, depth: u32, priority: i32) -> FetchJob {
        let normalized = normalize(raw).unwrap();
        let fp = fingerprint(&normalized);
        FetchJob::new(task_id, normalized, fp, depth, priority)
    }

    fn ready(domains: &[&str]) -> HashSet<String> {
        domains.iter().map(|d| d.to_string()).collect()
    }

    #[tokio::test]
    async fn duplicate_push_is_rejected_without_side_effects() {
        let frontier = frontier();
        let task = task(3, 100);
        frontier.register_task(&task).await;

        let a = job_for(task.id, "https://example.com/a", 0, 0);
        let same = job_for(task.id, "https://EXAMPLE.com/a#frag", 0, 0);

        assert_eq!(frontier.push(a).await.unwrap(), PushOutcome::Accepted);
        let live_before = frontier.live_count(task.id).await;
        assert_eq!(frontier.push(same).await.unwrap(), PushOutcome::Duplicate);
        assert_eq!(frontier.live_count(task.id).await, live_before);
        assert_eq!(frontier.pending_count().await, 1);
    }

    #[tokio::test]
    async fn depth_and_page_limits_reject_at_push_time() {
        let frontier = frontier();
        let task = task(1, 2);
        frontier.register_task(&task).await;

        let too_deep = job_for(task.id, "https://example.com/deep", 2, 0);
        assert_eq!(frontier.push(too_deep).await.unwrap(), PushOutcome::LimitExceeded);

        let a = job_for(task.id, "https://example.com/a", 0, 0);
        let b = job_for(task.id, "https://example.com/b", 1, 0);
        assert_eq!(frontier.push(a).await.unwrap(), PushOutcome::Accepted);
        assert_eq!(frontier.push(b).await.unwrap(), PushOutcome::Accepted);

        let over_budget = job_for(task.id, "https://example.com/c", 1, 0);
        assert_eq!(frontier.push(over_budget).await.unwrap(), PushOutcome::LimitExceeded);
    }

    #[tokio::test]
    async fn pop_orders_by_priority_then_fifo() {
        let frontier = frontier();
        let task = task(3, 100);
        frontier.register_task(&task).await;

        frontier.push(job_for(task.id, "https://example.com/old-low", 0, 1)).await.unwrap();
        frontier.push(job_for(task.id, "https://example.com/new-low", 0, 1)).await.unwrap();
        frontier.push(job_for(task.id, "https://example.com/high", 0, 5)).await.unwrap();

        let ready = ready(&["example.com"]);
        let first = frontier.pop(&ready).await.unwrap().unwrap();
        assert_eq!(first.url.path(), "/high");

        let second = frontier.pop(&ready).await.unwrap().unwrap();
        assert_eq!(second.url.path(), "/old-low", "FIFO within a priority tier");

        let third = frontier.pop(&ready).await.unwrap().unwrap();
        assert_eq!(third.url.path(), "/new-low");

        assert!(frontier.pop(&ready).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_respects_ready_domains() {
        let frontier = frontier();
        let task = task(3, 100);
        frontier.register_task(&task).await;

        frontier.push(job_for(task.id, "https://a.com/x", 0, 9)).await.unwrap();
        frontier.push(job_for(task.id, "https://b.com/y", 0, 1)).await.unwrap();

        // a.com is busy: only b.com's job may come back.
        let popped = frontier.pop(&ready(&["b.com"])).await.unwrap().unwrap();
        assert_eq!(popped.domain, "b.com");

        assert!(frontier.pop(&ready(&["b.com"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_stay_hidden_until_due() {
        let frontier = frontier();
        let task = task(3, 100);
        frontier.register_task(&task).await;

        let mut job = job_for(task.id, "https://example.com/later", 0, 0);
        job.not_before = Some(Utc::now() + chrono::Duration::milliseconds(40));
        frontier.push(job).await.unwrap();

        let ready = ready(&["example.com"]);
        assert!(frontier.pop(&ready).await.unwrap().is_none());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(frontier.pop(&ready).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dedup_is_scoped_per_task() {
        let frontier = frontier();
        let task_a = task(3, 100);
        let task_b = task(3, 100);
        frontier.register_task(&task_a).await;
        frontier.register_task(&task_b).await;

        let a = job_for(task_a.id, "https://example.com/shared", 0, 0);
        let b = job_for(task_b.id, "https://example.com/shared", 0, 0);

        assert_eq!(frontier.push(a).await.unwrap(), PushOutcome::Accepted);
        assert_eq!(frontier.push(b).await.unwrap(), PushOutcome::Accepted);
        assert_eq!(frontier.pending_count().await, 2);
    }

    #[tokio::test]
    async fn one_url_is_never_in_flight_twice() {
        let frontier = frontier();
        let task_a = task(3, 100);
        let task_b = task(3, 100);
        frontier.register_task(&task_a).await;
        frontier.register_task(&task_b).await;

        frontier.push(job_for(task_a.id, "https://example.com/shared", 0, 0)).await.unwrap();
        frontier.push(job_for(task_b.id, "https://example.com/shared", 0, 0)).await.unwrap();

        let ready = ready(&["example.com"]);
        let first = frontier.pop(&ready).await.unwrap().unwrap();

        // The other task's copy of the same URL is held back.
        assert!(frontier.pop(&ready).await.unwrap().is_none());

        frontier.settle(first.task_id, &first.fingerprint).await.unwrap();
        let second = frontier.pop(&ready).await.unwrap().unwrap();
        assert_ne!(second.task_id, first.task_id);
    }

    #[tokio::test]
    async fn cancel_drains_queued_and_blocks_new_pushes() {
        let frontier = frontier();
        let task = task(3, 100);
        frontier.register_task(&task).await;

        frontier.push(job_for(task.id, "https://example.com/a", 0, 0)).await.unwrap();
        frontier.push(job_for(task.id, "https://example.com/b", 0, 0)).await.unwrap();

        // One job is in flight when the cancel lands.
        let in_flight = frontier.pop(&ready(&["example.com"])).await.unwrap().unwrap();

        let drained = frontier.cancel_task(task.id).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(drained.iter().all(|j| j.state == JobState::Skipped));

        // Nothing further dispatches or queues.
        assert!(frontier.pop(&ready(&["example.com"])).await.unwrap().is_none());
        let late = job_for(task.id, "https://example.com/c", 0, 0);
        assert_eq!(frontier.push(late).await.unwrap(), PushOutcome::TaskInactive);

        // The in-flight job settles normally; live accounting reaches zero.
        assert_eq!(frontier.live_count(task.id).await, 1);
        frontier.settle(in_flight.task_id, &in_flight.fingerprint).await.unwrap();
        assert_eq!(frontier.live_count(task.id).await, 0);
    }

    #[tokio::test]
    async fn reinstate_drops_jobs_of_cancelled_tasks() {
        let frontier = frontier();
        let task = task(3, 100);
        frontier.register_task(&task).await;

        frontier.push(job_for(task.id, "https://example.com/a", 0, 0)).await.unwrap();
        let popped = frontier.pop(&ready(&["example.com"])).await.unwrap().unwrap();

        frontier.cancel_task(task.id).await.unwrap();

        assert!(!frontier.reinstate(popped).await.unwrap());
        assert_eq!(frontier.live_count(task.id).await, 0);
        assert!(frontier.pop(&ready(&["example.com"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn url_filters_reject_at_push() {
        let settings = CrawlSettings {
            allowed_domains: vec!["example.com".to_string()],
            ..CrawlSettings::default()
        };
        let frontier = frontier_with(&settings);
        let task = task(3, 100);
        frontier.register_task(&task).await;

        let off_domain = job_for(task.id, "https://other.org/page", 0, 0);
        assert_eq!(frontier.push(off_domain).await.unwrap(), PushOutcome::Filtered);

        let asset = job_for(task.id, "https://example.com/style.css", 0, 0);
        assert_eq!(frontier.push(asset).await.unwrap(), PushOutcome::Filtered);

        let page = job_for(task.id, "https://example.com/page", 0, 0);
        assert_eq!(frontier.push(page).await.unwrap(), PushOutcome::Accepted);
    }

    #[tokio::test]
    async fn recovery_rebuilds_live_jobs_without_loss_or_duplication() {
        let store = Arc::new(MemoryFrontierStore::default());
        let settings = CrawlSettings::default();
        let frontier = Frontier::new(store.clone(), UrlFilter::new(&settings));

        let mut task = task(3, 100);
        frontier.register_task(&task).await;
        frontier.push(job_for(task.id, "https://example.com/a", 0, 0)).await.unwrap();
        frontier.push(job_for(task.id, "https://example.com/b", 0, 0)).await.unwrap();

        // One job is mid-flight at crash time.
        let ready = ready(&["example.com"]);
        let in_flight = frontier.pop(&ready).await.unwrap().unwrap();
        task.counters.queued = 2;

        // Process restart: fresh frontier over the same store.
        let revived = Frontier::new(store, UrlFilter::new(&settings));
        revived.register_task(&task).await;
        let recovered = revived.recover().await.unwrap();
        assert_eq!(recovered, 2, "in-flight row is re-queued, not lost");
        assert_eq!(revived.live_count(task.id).await, 2);

        // The recovered frontier still dedups against restored rows.
        let again = job_for(task.id, in_flight.url.as_str(), 0, 0);
        assert_eq!(revived.push(again).await.unwrap(), PushOutcome::Duplicate);

        let first = revived.pop(&ready).await.unwrap();
        let second = revived.pop(&ready).await.unwrap();
        assert!(first.is_some() && second.is_some());
        assert!(revived.pop(&ready).await.unwrap().is_none());
    }
}
