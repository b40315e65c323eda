use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Identifier of a crawl task submitted by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a single fetch job inside a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task state machine: `Pending -> Running -> {Completed, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal (monotonic) transition.
    pub fn can_advance(self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Aggregate per-task counters. Monotonic: they only ever increase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    /// Jobs ever admitted to the frontier for this task.
    pub queued: u64,
    pub succeeded: u64,
    /// Dead-lettered jobs.
    pub failed: u64,
    /// Links rejected before dispatch (agent, filters, limits, cancellation).
    pub skipped: u64,
}

/// A user-submitted crawl: one or more seed URLs plus bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    pub id: TaskId,
    /// Seed URLs in submission order.
    pub seeds: Vec<Url>,
    pub max_depth: u32,
    pub max_pages: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub counters: TaskCounters,
    /// Dead-letter totals broken down by final error kind.
    #[serde(default)]
    pub failure_kinds: BTreeMap<FetchErrorKind, u64>,
}

impl CrawlTask {
    pub fn new(seeds: Vec<Url>, max_depth: u32, max_pages: u32) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            seeds,
            max_depth,
            max_pages,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            counters: TaskCounters::default(),
            failure_kinds: BTreeMap::new(),
        }
    }

    /// Jobs that consumed at least one fetch attempt and reached a terminal
    /// state, the denominator of the failure ratio.
    pub fn attempted(&self) -> u64 {
        self.counters.succeeded + self.counters.failed
    }
}

/// Fetch-job state machine: `Queued -> InFlight -> {Succeeded, Retrying,
/// Skipped, DeadLettered}`, with `Retrying` looping back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InFlight,
    Succeeded,
    Retrying,
    Skipped,
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::DeadLettered)
    }
}

/// Job-level failure taxonomy surfaced by the fetch collaborator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, thiserror::Error,
)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    #[error("network error")]
    Network,
    #[error("timeout")]
    Timeout,
    /// robots.txt denial or a 4xx-forbidden class response.
    #[error("blocked")]
    Blocked,
    #[error("rate limited")]
    RateLimited,
    #[error("parse error")]
    Parse,
}

impl FetchErrorKind {
    /// Failures imposed by the remote side rather than by crawl quality.
    /// These back off like any other failure, but the task-level failure
    /// ratio may be configured to ignore them.
    pub fn is_external(self) -> bool {
        matches!(self, Self::Blocked | Self::RateLimited)
    }
}

/// One URL to fetch, owned by exactly one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchJob {
    pub id: JobId,
    pub task_id: TaskId,
    /// Normalized URL; the fingerprint is derived from it.
    pub url: Url,
    pub fingerprint: UrlFingerprint,
    /// Host key used for rate limiting.
    pub domain: String,
    pub depth: u32,
    /// Higher values dispatch first.
    pub priority: i32,
    pub attempts: u32,
    pub state: JobState,
    pub last_error: Option<FetchErrorKind>,
    /// Set while backing off or held by an open circuit breaker.
    pub not_before: Option<DateTime<Utc>>,
    /// Frontier admission order, the FIFO tie-breaker within a priority tier.
    #[serde(default)]
    pub seq: u64,
}

impl FetchJob {
    pub fn new(
        task_id: TaskId,
        url: Url,
        fingerprint: UrlFingerprint,
        depth: u32,
        priority: i32,
    ) -> Self {
        let domain = url.host_str().unwrap_or_default().to_lowercase();
        Self {
            id: JobId::new(),
            task_id,
            url,
            fingerprint,
            domain,
            depth,
            priority,
            attempts: 0,
            state: JobState::Queued,
            last_error: None,
            not_before: None,
            seq: 0,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |nb| nb <= now)
    }
}

/// Fixed-width digest of a normalized URL, the dedup key within a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UrlFingerprint(pub String);

impl fmt::Display for UrlFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-width digest of whitespace-collapsed page text, the body dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(pub String);

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful fetch, handed to the indexing pipeline once the
/// decision gate accepts it. Independent of its job after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub url: Url,
    pub content_fingerprint: ContentFingerprint,
    pub text: String,
    /// Raw link targets as found on the page.
    pub links: Vec<String>,
    pub fetched_at: DateTime<Utc>,
    /// Agent relevance score in `[0, 1]`.
    pub relevance: f32,
}
