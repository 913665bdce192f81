//! Search-result filtering.
//!
//! Reduces raw search hits to canonical discussion-thread URLs and thread ids.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

const THREAD_DOMAINS: &[&str] = &[
    "www.reddit.com",
    "reddit.com",
    "old.reddit.com",
    "np.reddit.com",
    "ssl.reddit.com",
];

static THREAD_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/comments/([a-z0-9]+)/")
        .unwrap_or_else(|err| panic!("invalid thread id regex: {err}"))
});

/// One organic search hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

impl SearchResult {
    pub fn from_link(link: impl Into<String>) -> Self {
        Self {
            link: Some(link.into()),
            ..Default::default()
        }
    }
}

fn canonical_thread_url(link: &str) -> Option<String> {
    let parsed = Url::parse(link).ok()?;
    let host = parsed.host_str()?;
    if !THREAD_DOMAINS.contains(&host) {
        return None;
    }
    Some(format!("https://{}{}", host, parsed.path()))
}

/// Links on an allowed platform domain, normalised to `https://host/path`.
pub fn extract_thread_urls(results: &[SearchResult]) -> Vec<String> {
    results
        .iter()
        .filter_map(|result| result.link.as_deref())
        .filter_map(canonical_thread_url)
        .collect()
}

/// Thread id of a single URL, if it points at a thread.
pub fn thread_id(url: &str) -> Option<String> {
    THREAD_ID_RE
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}

/// Thread ids for every URL that names one; other URLs are dropped.
pub fn extract_thread_ids<S: AsRef<str>>(urls: &[S]) -> Vec<String> {
    urls.iter().filter_map(|url| thread_id(url.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_thread_urls_and_ids() {
        let results = vec![SearchResult::from_link(
            "https://www.reddit.com/r/test/comments/abc123/title/",
        )];
        let urls = extract_thread_urls(&results);
        assert_eq!(urls, ["https://www.reddit.com/r/test/comments/abc123/title/"]);
        assert_eq!(extract_thread_ids(&urls), ["abc123"]);
    }

    #[test]
    fn foreign_domains_yield_nothing() {
        let results = vec![SearchResult::from_link(
            "https://example.com/r/test/comments/abc123/title/",
        )];
        assert!(extract_thread_urls(&results).is_empty());
    }

    #[test]
    fn strips_tracking_and_normalises_scheme() {
        let results = vec![
            SearchResult::from_link("http://old.reddit.com/r/deals/comments/z9y8x7/post/?utm_source=x"),
            SearchResult::default(),
            SearchResult::from_link("not a url"),
        ];
        assert_eq!(
            extract_thread_urls(&results),
            ["https://old.reddit.com/r/deals/comments/z9y8x7/post/"]
        );
    }

    #[test]
    fn non_thread_urls_have_no_id() {
        assert_eq!(thread_id("https://www.reddit.com/r/test/"), None);
        assert!(extract_thread_ids(&["https://reddit.com/r/test/wiki/index"]).is_empty());
    }

    #[test]
    fn deserializes_provider_payload() {
        let raw = r#"[{"title": "t", "link": "https://reddit.com/r/a/comments/q1/x/", "position": 1}]"#;
        let results: Vec<SearchResult> = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_thread_ids(&extract_thread_urls(&results)), ["q1"]);
    }
}
