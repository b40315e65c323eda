use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

use crate::cli::config::FetchSettings;
use crate::crawler::task::FetchErrorKind;

/// A fetched, rendered page as the engine collaborator hands it back.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub html: String,
    /// Visible text with markup stripped.
    pub text: String,
    pub title: Option<String>,
    /// Raw link targets exactly as found; resolution happens downstream.
    pub links: Vec<String>,
}

/// Collaborator failure, mapped onto the job-level error taxonomy.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("network error: {0}")]
    Network(String),
    #[error("fetch timed out")]
    Timeout,
    #[error("blocked with status {0}")]
    Blocked(u16),
    #[error("rate limited by remote")]
    RateLimited,
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl FetchFailure {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Network(_) => FetchErrorKind::Network,
            Self::Timeout => FetchErrorKind::Timeout,
            Self::Blocked(_) => FetchErrorKind::Blocked,
            Self::RateLimited => FetchErrorKind::RateLimited,
            Self::Parse(_) => FetchErrorKind::Parse,
        }
    }
}

/// The external fetch/render engine. Called once per dispatched job; the
/// dispatcher enforces its own deadline around every call, so an
/// implementation that hangs still costs at most the configured timeout.
#[async_trait]
pub trait FetchEngine: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchFailure>;
}

/// Plain HTTP implementation over reqwest + scraper. Stands in for the
/// AI-rendering engine, which drops into the same trait.
pub struct HttpFetchEngine {
    client: reqwest::Client,
}

impl HttpFetchEngine {
    pub fn new(settings: &FetchSettings) -> Result<Self, FetchFailure> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| FetchFailure::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchEngine for HttpFetchEngine {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchFailure> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchFailure::Timeout
            } else {
                FetchFailure::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            429 => return Err(FetchFailure::RateLimited),
            401 | 403 | 451 => return Err(FetchFailure::Blocked(status)),
            408 => return Err(FetchFailure::Timeout),
            _ => return Err(FetchFailure::Network(format!("status {status}"))),
        }

        let html = response
            .text()
            .await
            .map_err(|e| FetchFailure::Parse(e.to_string()))?;

        let (text, title, links) = extract(&html)?;
        Ok(FetchedPage { status, html, text, title, links })
    }
}

/// Pull text, title and raw hrefs out of an HTML document. Synchronous on
/// purpose: the parsed DOM is not `Send` and must not live across an await.
fn extract(html: &str) -> Result<(String, Option<String>, Vec<String>), FetchFailure> {
    let document = Html::parse_document(html);

    let anchors = Selector::parse("a[href]").map_err(|e| FetchFailure::Parse(e.to_string()))?;
    let title_sel = Selector::parse("title").map_err(|e| FetchFailure::Parse(e.to_string()))?;

    let links = document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect();

    let title = document
        .select(&title_sel)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let text = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    Ok((text, title, links))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> FetchSettings {
        FetchSettings {
            timeout_ms: 2_000,
            user_agent: "agentic-crawler-test/0.1".to_string(),
        }
    }

    const PAGE: &str = r#"<html><head><title>Docs</title></head>
        <body><h1>Hello</h1><p>world</p>
        <a href="/a">A</a><a href="https://other.org/b">B</a></body></html>"#;

    #[tokio::test]
    async fn fetches_and_extracts_a_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .mount(&server)
            .await;

        let engine = HttpFetchEngine::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/page", server.uri())).unwrap();
        let page = engine.fetch(&url).await.unwrap();

        assert_eq!(page.status, 200);
        assert_eq!(page.title.as_deref(), Some("Docs"));
        assert_eq!(page.links, vec!["/a", "https://other.org/b"]);
        assert!(page.text.contains("Hello world"));
    }

    #[tokio::test]
    async fn forbidden_maps_to_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let engine = HttpFetchEngine::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/x", server.uri())).unwrap();
        let err = engine.fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Blocked);
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let engine = HttpFetchEngine::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/x", server.uri())).unwrap();
        let err = engine.fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn server_errors_map_to_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let engine = HttpFetchEngine::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/x", server.uri())).unwrap();
        let err = engine.fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Network);
    }

    #[test]
    fn extract_collapses_whitespace() {
        let (text, title, links) = extract("<html><body><p>a\n\n  b</p></body></html>").unwrap();
        assert_eq!(text, "a b");
        assert!(title.is_none());
        assert!(links.is_empty());
    }
}
