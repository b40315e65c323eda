use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::AgentSettings;
use crate::crawler::task::PageRecord;

/// Relevance score used when the judge is unavailable.
const NEUTRAL_RELEVANCE: f32 = 0.5;

/// The judge's answer for one fetched page: keep it or not, how relevant it
/// is, and which discovered links deserve a follow at what priority.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub keep: bool,
    pub relevance: f32,
    pub follow: Vec<(Url, i32)>,
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge failed: {0}")]
    Failed(String),
}

/// Pluggable scoring function over fetched pages. A language-model-backed
/// implementation drops in here; the engine only relies on the bounded
/// latency the gate enforces, never on what happens inside.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageJudge: Send + Sync {
    async fn evaluate(&self, page: &PageRecord, links: &[Url]) -> Result<Verdict, JudgeError>;
}

/// Wraps the judge with a deadline and deterministic link-limit enforcement.
/// A judge that times out or errors never stalls the pipeline: the page is
/// kept at a neutral score and every link follows at the default priority.
pub struct DecisionGate {
    judge: std::sync::Arc<dyn PageJudge>,
    timeout: Duration,
    max_links: usize,
    default_priority: i32,
}

impl DecisionGate {
    pub fn new(judge: std::sync::Arc<dyn PageJudge>, settings: &AgentSettings) -> Self {
        Self {
            judge,
            timeout: Duration::from_millis(settings.timeout_ms),
            max_links: settings.max_links_per_page,
            default_priority: settings.default_priority,
        }
    }

    pub async fn evaluate(&self, page: &PageRecord, links: Vec<Url>) -> Verdict {
        let mut verdict =
            match tokio::time::timeout(self.timeout, self.judge.evaluate(page, &links)).await {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(e)) => {
                    warn!(url = %page.url, error = %e, "judge failed, using neutral verdict");
                    self.fallback(links)
                }
                Err(_) => {
                    warn!(url = %page.url, timeout_ms = self.timeout.as_millis() as u64,
                        "judge timed out, using neutral verdict");
                    self.fallback(links)
                }
            };

        // Deterministic cap: best priority first, submission order on ties.
        if verdict.follow.len() > self.max_links {
            verdict.follow.sort_by(|a, b| b.1.cmp(&a.1));
            verdict.follow.truncate(self.max_links);
            debug!(url = %page.url, kept = self.max_links, "capped links to follow");
        }
        verdict.relevance = verdict.relevance.clamp(0.0, 1.0);
        verdict
    }

    fn fallback(&self, links: Vec<Url>) -> Verdict {
        Verdict {
            keep: true,
            relevance: NEUTRAL_RELEVANCE,
            follow: links.into_iter().map(|l| (l, self.default_priority)).collect(),
        }
    }
}

/// Built-in keyword heuristic: scores pages by how many configured keywords
/// their text contains and boosts links whose URL mentions one. With no
/// keywords configured everything is kept at a neutral score.
pub struct KeywordJudge {
    keywords: Vec<String>,
    keep_threshold: f32,
    default_priority: i32,
}

impl KeywordJudge {
    pub fn new(settings: &AgentSettings) -> Self {
        Self {
            keywords: settings.keywords.iter().map(|k| k.to_lowercase()).collect(),
            keep_threshold: settings.keep_threshold,
            default_priority: settings.default_priority,
        }
    }

    fn score_text(&self, text: &str) -> f32 {
        if self.keywords.is_empty() {
            return NEUTRAL_RELEVANCE;
        }
        let haystack = text.to_lowercase();
        let hits = self.keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
        hits as f32 / self.keywords.len() as f32
    }

    fn link_priority(&self, link: &Url) -> i32 {
        let candidate = link.as_str().to_lowercase();
        if self.keywords.iter().any(|k| candidate.contains(k.as_str())) {
            self.default_priority + 10
        } else {
            self.default_priority
        }
    }
}

#[async_trait]
impl PageJudge for KeywordJudge {
    async fn evaluate(&self, page: &PageRecord, links: &[Url]) -> Result<Verdict, JudgeError> {
        let relevance = self.score_text(&page.text);
        let keep = self.keywords.is_empty() || relevance >= self.keep_threshold;

        let follow = links
            .iter()
            .map(|link| (link.clone(), self.link_priority(link)))
            .collect();

        Ok(Verdict { keep, relevance, follow })
    }
}
