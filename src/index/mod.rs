use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::crawler::lifecycle::RetryPolicy;
use crate::crawler::task::{JobId, PageRecord};
use crate::storage::pages::{PageInsert, PageStore};

/// Which index collaborator a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Semantic,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lexical => f.write_str("lexical"),
            Self::Semantic => f.write_str("semantic"),
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lexical" => Ok(Self::Lexical),
            "semantic" => Ok(Self::Semantic),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    /// Transient: retried with the pipeline's own backoff.
    #[error("index unavailable: {0}")]
    Unavailable(String),
    /// Permanent for this record; logged and dropped.
    #[error("index rejected record: {0}")]
    Rejected(String),
}

/// Reference to an indexed page in ranked search output.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub job_id: JobId,
    pub url: String,
    pub score: f32,
}

/// An index collaborator. The engine only produces input for it and relays
/// queries; ranking internals live on the other side of this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Index: Send + Sync {
    fn mode(&self) -> SearchMode;

    async fn index(&self, record: &PageRecord) -> Result<(), IndexError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError>;
}

/// Background consumer of accepted pages. Dedups bodies through the page
/// store, then offers each fresh record to every registered index, retrying
/// `Unavailable` with its own backoff. A page is fetched once but may be
/// indexed several times; indexing failures never fail the crawl task.
pub struct IndexingPipeline {
    tx: Mutex<Option<mpsc::Sender<PageRecord>>>,
    indexes: Vec<Arc<dyn Index>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndexingPipeline {
    pub fn spawn(
        indexes: Vec<Arc<dyn Index>>,
        pages: Arc<dyn PageStore>,
        policy: RetryPolicy,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<PageRecord>(256);
        let worker_indexes = indexes.clone();

        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match pages.insert_page(&record).await {
                    Ok(PageInsert::Inserted) => {
                        for index in &worker_indexes {
                            index_with_retry(index.as_ref(), &record, &policy).await;
                        }
                    }
                    Ok(PageInsert::Duplicate { original_job }) => {
                        debug!(
                            url = %record.url,
                            original = %original_job,
                            "duplicate body, recorded reference only"
                        );
                    }
                    Err(e) => error!(url = %record.url, error = %e, "failed to store page"),
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            indexes,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Hand an accepted page to the pipeline. Never blocks the crawl on
    /// index health; only a closed pipeline is an error.
    pub async fn submit(&self, record: PageRecord) -> Result<()> {
        let tx = self.tx.lock().await;
        let Some(tx) = tx.as_ref() else {
            anyhow::bail!("indexing pipeline is shut down");
        };
        tx.send(record).await.map_err(|_| anyhow::anyhow!("indexing pipeline is gone"))
    }

    /// Relay a query to the collaborator serving `mode`.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let Some(index) = self.indexes.iter().find(|i| i.mode() == mode) else {
            return Err(IndexError::Unavailable(format!("no {mode} index registered")));
        };
        index.search(query, limit).await
    }

    /// Drain queued records and stop the worker.
    pub async fn shutdown(&self) {
        self.tx.lock().await.take();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "indexing worker panicked");
            }
        }
    }
}

async fn index_with_retry(index: &dyn Index, record: &PageRecord, policy: &RetryPolicy) {
    let mut attempt = 0u32;
    loop {
        match index.index(record).await {
            Ok(()) => return,
            Err(IndexError::Unavailable(reason)) if attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                debug!(url = %record.url, attempt, reason, "index unavailable, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(url = %record.url, error = %e, "giving up on indexing record");
                return;
            }
        }
    }
}

/// Token-overlap lexical index kept in memory. The default collaborator for
/// tests and single-process runs; real ranking lives elsewhere.
#[derive(Default)]
pub struct MemoryIndex {
    docs: Mutex<Vec<(JobId, String, String)>>,
}

#[async_trait]
impl Index for MemoryIndex {
    fn mode(&self) -> SearchMode {
        SearchMode::Lexical
    }

    async fn index(&self, record: &PageRecord) -> Result<(), IndexError> {
        let mut docs = self.docs.lock().await;
        docs.push((record.job_id, record.url.to_string(), record.text.to_lowercase()));
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let terms: Vec<String> = query.to_lowercase().split_whitespace().map(str::to_string).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self.docs.lock().await;
        let mut hits: Vec<SearchHit> = docs
            .iter()
            .filter_map(|(job_id, url, text)| {
                let matched = terms.iter().filter(|t| text.contains(t.as_str())).count();
                if matched == 0 {
                    return None;
                }
                Some(SearchHit {
                    job_id: *job_id,
                    url: url.clone(),
                    score: matched as f32 / terms.len() as f32,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}
