use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crawler::task::FetchErrorKind;

/// Crawl-wide fetch metrics, readable as an eventually consistent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlMetrics {
    pub started_at: DateTime<Utc>,
    pub fetches_total: u64,
    pub fetches_succeeded: u64,
    pub fetches_failed: u64,
    /// Failed fetch attempts broken down by error kind.
    pub failures_by_kind: BTreeMap<FetchErrorKind, u64>,
    pub bytes_fetched: u64,
    total_fetch_millis: u64,
    pub current_rps: f64,
    pub peak_rps: f64,
}

impl CrawlMetrics {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            fetches_total: 0,
            fetches_succeeded: 0,
            fetches_failed: 0,
            failures_by_kind: BTreeMap::new(),
            bytes_fetched: 0,
            total_fetch_millis: 0,
            current_rps: 0.0,
            peak_rps: 0.0,
        }
    }

    pub fn avg_fetch_millis(&self) -> u64 {
        if self.fetches_total == 0 {
            0
        } else {
            self.total_fetch_millis / self.fetches_total
        }
    }
}

/// Shared collector the dispatcher reports every fetch attempt into.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<CrawlMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(CrawlMetrics::new())) }
    }

    pub async fn record_fetch(
        &self,
        success: bool,
        error: Option<FetchErrorKind>,
        duration: Duration,
        bytes: usize,
    ) {
        let mut metrics = self.inner.lock().await;

        metrics.fetches_total += 1;
        if success {
            metrics.fetches_succeeded += 1;
        } else {
            metrics.fetches_failed += 1;
        }
        if let Some(kind) = error {
            *metrics.failures_by_kind.entry(kind).or_insert(0) += 1;
        }
        metrics.bytes_fetched += bytes as u64;
        metrics.total_fetch_millis += duration.as_millis() as u64;

        let elapsed = (Utc::now() - metrics.started_at).num_seconds().max(1) as f64;
        metrics.current_rps = metrics.fetches_total as f64 / elapsed;
        if metrics.current_rps > metrics.peak_rps {
            metrics.peak_rps = metrics.current_rps;
        }
    }

    pub async fn snapshot(&self) -> CrawlMetrics {
        self.inner.lock().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_are_tallied_by_kind() {
        let collector = MetricsCollector::new();

        collector.record_fetch(true, None, Duration::from_millis(10), 512).await;
        collector
            .record_fetch(false, Some(FetchErrorKind::Timeout), Duration::from_millis(30), 0)
            .await;
        collector
            .record_fetch(false, Some(FetchErrorKind::Timeout), Duration::from_millis(30), 0)
            .await;

        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.fetches_total, 3);
        assert_eq!(snapshot.fetches_succeeded, 1);
        assert_eq!(snapshot.fetches_failed, 2);
        assert_eq!(snapshot.failures_by_kind.get(&FetchErrorKind::Timeout), Some(&2));
        assert_eq!(snapshot.bytes_fetched, 512);
        assert!(snapshot.avg_fetch_millis() > 0);
    }
}
