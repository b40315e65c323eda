use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::crawler::task::{ContentFingerprint, UrlFingerprint};

/// A URL rejected at submission time. Never retried.
#[derive(Debug, Error)]
#[error("invalid url '{url}': {reason}")]
pub struct InvalidUrl {
    pub url: String,
    pub reason: String,
}

/// File extensions treated as static resources and never queued.
const STATIC_EXTENSIONS: &[&str] = &[
    "css", "js", "jpg", "jpeg", "png", "gif", "svg", "ico", "woff", "woff2", "ttf", "pdf", "zip",
    "gz", "tar", "mp3", "mp4", "avi", "mov", "webm",
];

/// Canonicalize a raw URL so that trivially different spellings of the same
/// resource collide: lower-case scheme and host, default ports stripped,
/// query parameters sorted, fragment removed, `.`/`..` path segments
/// resolved. Idempotent: normalizing an already-normalized URL is a no-op.
pub fn normalize(raw: &str) -> Result<Url, InvalidUrl> {
    let mut url = Url::parse(raw.trim()).map_err(|e| InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    // The url crate already lower-cases scheme/host, strips default ports and
    // resolves dot segments on parse; fragment and query order are ours.
    url.set_fragment(None);

    match url.query() {
        Some("") | None => url.set_query(None),
        Some(_) => {
            let mut pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.sort();
            let sorted = pairs
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{k}={v}")
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&sorted));
        }
    }

    Ok(url)
}

/// Digest of a normalized URL. Fixed width, hex encoded.
pub fn fingerprint(url: &Url) -> UrlFingerprint {
    let digest = Sha256::digest(url.as_str().as_bytes());
    UrlFingerprint(hex::encode(digest))
}

/// Digest of extracted page text with whitespace collapsed, so near-identical
/// pages with volatile markup still collide.
pub fn content_fingerprint(text: &str) -> ContentFingerprint {
    let mut hasher = Sha256::new();
    for token in text.split_whitespace() {
        hasher.update(token.as_bytes());
        hasher.update(b" ");
    }
    ContentFingerprint(hex::encode(hasher.finalize()))
}

/// Whether the URL points at a static asset rather than a document.
pub fn is_static_resource(url: &Url) -> bool {
    let path = url.path();
    match path.rsplit_once('.') {
        Some((_, ext)) => STATIC_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => false,
    }
}

/// Resolve a raw link against the page it was found on, then normalize it.
pub fn resolve_link(base: &Url, raw: &str) -> Result<Url, InvalidUrl> {
    match normalize(raw) {
        Ok(url) => Ok(url),
        Err(_) => {
            let joined = base.join(raw).map_err(|e| InvalidUrl {
                url: raw.to_string(),
                reason: e.to_string(),
            })?;
            normalize(joined.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_fragment_and_default_port() {
        let a = normalize("https://EXAMPLE.com:443/path#section").unwrap();
        assert_eq!(a.as_str(), "https://example.com/path");

        let b = normalize("http://example.com:80/").unwrap();
        assert_eq!(b.as_str(), "http://example.com/");
    }

    #[test]
    fn normalize_sorts_query_parameters() {
        let a = normalize("https://example.com/search?b=2&a=1").unwrap();
        let b = normalize("https://example.com/search?a=1&b=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.query(), Some("a=1&b=2"));
    }

    #[test]
    fn normalize_resolves_dot_segments() {
        let a = normalize("https://example.com/a/b/../c/./d").unwrap();
        assert_eq!(a.path(), "/a/c/d");
    }

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "https://Example.COM:443/a/../b?z=1&a=2#frag",
            "http://example.com/page?q",
            "https://example.com/",
        ];
        for raw in inputs {
            let once = normalize(raw).unwrap();
            let twice = normalize(once.as_str()).unwrap();
            assert_eq!(once, twice, "normalize must be idempotent for {raw}");
        }
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize("not a url").is_err());
        assert!(normalize("ftp://example.com/file").is_err());
        assert!(normalize("mailto:someone@example.com").is_err());
    }

    #[test]
    fn equivalent_urls_share_a_fingerprint() {
        let a = normalize("https://example.com/p?x=1&y=2#top").unwrap();
        let b = normalize("https://EXAMPLE.com:443/p?y=2&x=1").unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = normalize("https://example.com/other").unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn content_fingerprint_collapses_whitespace() {
        let a = content_fingerprint("hello   world\n\tfoo");
        let b = content_fingerprint("hello world foo");
        assert_eq!(a, b);

        let c = content_fingerprint("hello worldfoo");
        assert_ne!(a, c);
    }

    #[test]
    fn static_resources_are_detected() {
        let img = normalize("https://example.com/logo.PNG").unwrap();
        assert!(is_static_resource(&img));

        let page = normalize("https://example.com/about").unwrap();
        assert!(!is_static_resource(&page));
    }

    #[test]
    fn relative_links_resolve_against_base() {
        let base = normalize("https://example.com/docs/intro").unwrap();
        let abs = resolve_link(&base, "../api/reference").unwrap();
        assert_eq!(abs.as_str(), "https://example.com/api/reference");

        let already_abs = resolve_link(&base, "https://other.org/x").unwrap();
        assert_eq!(already_abs.as_str(), "https://other.org/x");
    }
}
