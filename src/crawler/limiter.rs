use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::cli::config::RateLimitSettings;

/// Why an admission request was turned down. Non-blocking by contract:
/// callers poll or wait on [`DomainRateLimiter::wait_for_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenied {
    /// The domain is at its in-flight cap.
    AtCapacity,
    /// The politeness interval since the last request start has not elapsed.
    TooSoon,
    /// The domain's circuit breaker is open (or its half-open probe is out).
    BreakerOpen,
}

/// Proof of admission for one request to one domain. Must be given back via
/// [`DomainRateLimiter::release`] when the request settles.
#[derive(Debug)]
pub struct DomainToken {
    domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Breaker {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct DomainState {
    in_flight: u32,
    last_request: Option<Instant>,
    consecutive_failures: u32,
    breaker: Breaker,
}

impl Default for DomainState {
    fn default() -> Self {
        Self {
            in_flight: 0,
            last_request: None,
            consecutive_failures: 0,
            breaker: Breaker::Closed,
        }
    }
}

/// Serializable view of a domain's breaker state, persisted with the
/// frontier so a restart does not hammer a domain that was tripping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStateRow {
    pub domain: String,
    pub consecutive_failures: u32,
    pub breaker_open_until: Option<DateTime<Utc>>,
}

/// Per-domain admission gate: concurrency cap, politeness spacing between
/// request starts, and a consecutive-failure circuit breaker. Each domain
/// lives in its own map entry; unrelated domains never contend.
pub struct DomainRateLimiter {
    domains: DashMap<String, DomainState>,
    max_in_flight: u32,
    politeness: Duration,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
    notify: Notify,
}

impl DomainRateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            domains: DashMap::new(),
            max_in_flight: settings.max_concurrent_per_domain.max(1),
            politeness: Duration::from_millis(settings.politeness_delay_ms),
            breaker_threshold: settings.breaker_failure_threshold.max(1),
            breaker_cooldown: Duration::from_millis(settings.breaker_cooldown_ms),
            notify: Notify::new(),
        }
    }

    /// Non-blocking admission check. On success the in-flight count is
    /// incremented and the politeness clock restarted atomically with
    /// respect to concurrent callers for the same domain.
    pub fn try_acquire(&self, domain: &str) -> Result<DomainToken, AdmissionDenied> {
        let now = Instant::now();
        let mut state = self.domains.entry(domain.to_string()).or_default();

        match state.breaker {
            Breaker::Open { until } if now < until => return Err(AdmissionDenied::BreakerOpen),
            Breaker::Open { .. } => {
                debug!(domain, "circuit breaker cooled down, moving to half-open");
                state.breaker = Breaker::HalfOpen { probe_in_flight: false };
            }
            Breaker::HalfOpen { probe_in_flight: true } => {
                return Err(AdmissionDenied::BreakerOpen)
            }
            _ => {}
        }

        if state.in_flight >= self.max_in_flight {
            return Err(AdmissionDenied::AtCapacity);
        }

        if let Some(last) = state.last_request {
            if now.duration_since(last) < self.politeness {
                return Err(AdmissionDenied::TooSoon);
            }
        }

        state.in_flight += 1;
        state.last_request = Some(now);
        if let Breaker::HalfOpen { ref mut probe_in_flight } = state.breaker {
            *probe_in_flight = true;
        }

        Ok(DomainToken { domain: domain.to_string() })
    }

    /// Return a slot. Wakes anyone parked in [`wait_for_change`].
    pub fn release(&self, token: DomainToken) {
        if let Some(mut state) = self.domains.get_mut(&token.domain) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// A request to the domain settled successfully. Closes a half-open
    /// breaker and clears the failure streak.
    pub fn record_success(&self, domain: &str) {
        if let Some(mut state) = self.domains.get_mut(domain) {
            state.consecutive_failures = 0;
            if matches!(state.breaker, Breaker::HalfOpen { .. }) {
                debug!(domain, "half-open probe succeeded, closing breaker");
                state.breaker = Breaker::Closed;
            }
        }
        self.notify.notify_waiters();
    }

    /// A request to the domain failed. Above the threshold the breaker
    /// opens; a failed half-open probe reopens it immediately.
    pub fn record_failure(&self, domain: &str) {
        let mut state = self.domains.entry(domain.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let reopen = matches!(state.breaker, Breaker::HalfOpen { .. });
        let trip = matches!(state.breaker, Breaker::Closed)
            && state.consecutive_failures >= self.breaker_threshold;
        if reopen || trip {
            let until = Instant::now() + self.breaker_cooldown;
            debug!(
                domain,
                failures = state.consecutive_failures,
                cooldown_ms = self.breaker_cooldown.as_millis() as u64,
                "opening circuit breaker"
            );
            state.breaker = Breaker::Open { until };
        }
    }

    /// Whether a job for this domain could be admitted right now. Domains
    /// the limiter has never seen are ready by definition.
    pub fn is_ready(&self, domain: &str) -> bool {
        let Some(state) = self.domains.get(domain) else {
            return true;
        };
        let now = Instant::now();

        match state.breaker {
            Breaker::Open { until } if now < until => return false,
            Breaker::HalfOpen { probe_in_flight: true } => return false,
            _ => {}
        }
        if state.in_flight >= self.max_in_flight {
            return false;
        }
        if let Some(last) = state.last_request {
            if now.duration_since(last) < self.politeness {
                return false;
            }
        }
        true
    }

    /// Subset of `domains` currently admissible, as the frontier's
    /// ready-domain input.
    pub fn filter_ready(&self, domains: impl IntoIterator<Item = String>) -> HashSet<String> {
        domains.into_iter().filter(|d| self.is_ready(d)).collect()
    }

    /// Park until a slot is released, a breaker changes, or `timeout`.
    pub async fn wait_for_change(&self, timeout: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }

    pub fn in_flight(&self, domain: &str) -> u32 {
        self.domains.get(domain).map(|s| s.in_flight).unwrap_or(0)
    }

    /// Breaker state for persistence alongside the frontier.
    pub fn snapshot(&self) -> Vec<DomainStateRow> {
        let now = Instant::now();
        self.domains
            .iter()
            .map(|entry| {
                let breaker_open_until = match entry.value().breaker {
                    Breaker::Open { until } if until > now => {
                        let remaining = chrono::Duration::from_std(until - now)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        Some(Utc::now() + remaining)
                    }
                    _ => None,
                };
                DomainStateRow {
                    domain: entry.key().clone(),
                    consecutive_failures: entry.value().consecutive_failures,
                    breaker_open_until,
                }
            })
            .collect()
    }

    /// Rebuild breaker state after a restart. Expired cooldowns are dropped.
    pub fn restore(&self, rows: Vec<DomainStateRow>) {
        let now = Utc::now();
        for row in rows {
            let mut state = self.domains.entry(row.domain).or_default();
            state.consecutive_failures = row.consecutive_failures;
            if let Some(until) = row.breaker_open_until {
                if until > now {
                    let remaining = (until - now).to_std().unwrap_or_default();
                    state.breaker = Breaker::Open { until: Instant::now() + remaining };
                }
            }
        }
    }
}
