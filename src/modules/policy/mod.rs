//! Community policy detection.
//!
//! Classifies published rules and wiki pages into an affiliate-link verdict
//! using ordered regex groups, caches the result per community, and keeps an
//! in-memory deny list of communities found to prohibit the action.

pub mod cache;

pub use cache::{PolicyCache, PolicyCacheEntry};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use html_escape::decode_html_entities;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use super::clock::{Clock, system_clock};

/// Affiliate-link policy of a community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyVerdict {
    Prohibited,
    Allowed,
    /// Allowed with conditions (disclosure, flair, approval).
    Restricted,
    Unknown,
}

impl PolicyVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyVerdict::Prohibited => "PROHIBITED",
            PolicyVerdict::Allowed => "ALLOWED",
            PolicyVerdict::Restricted => "RESTRICTED",
            PolicyVerdict::Unknown => "UNKNOWN",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, PolicyVerdict::Unknown)
    }

    pub fn permits(&self, allow_unknown: bool) -> bool {
        match self {
            PolicyVerdict::Allowed | PolicyVerdict::Restricted => true,
            PolicyVerdict::Unknown => allow_unknown,
            PolicyVerdict::Prohibited => false,
        }
    }
}

impl fmt::Display for PolicyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which text a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySourceKind {
    Rules,
    Wiki,
}

impl fmt::Display for PolicySourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicySourceKind::Rules => f.write_str("rules"),
            PolicySourceKind::Wiki => f.write_str("wiki"),
        }
    }
}

#[derive(Debug, Clone)]
struct PatternGroup {
    verdict: PolicyVerdict,
    patterns: Vec<Regex>,
}

impl PatternGroup {
    fn new(verdict: PolicyVerdict, raw_patterns: &[&str]) -> Self {
        Self {
            verdict,
            patterns: raw_patterns.iter().map(|pattern| build_regex(pattern)).collect(),
        }
    }
}

/// Evaluated in order; the first group with any match decides.
static PATTERN_GROUPS: Lazy<Vec<PatternGroup>> = Lazy::new(|| {
    vec![
        PatternGroup::new(
            PolicyVerdict::Allowed,
            &[
                r"affiliate\s+links\s+allowed",
                r"referral\s+links\s+ok",
                r"tracking\s+links\s+permitted",
                r"affiliate\s+policy",
            ],
        ),
        PatternGroup::new(
            PolicyVerdict::Restricted,
            &[
                r"only\s+approved\s+affiliates",
                r"must\s+be\s+disclosed",
                r"flair\s+required",
                r"mod\s+approval",
                r"restricted\s+links",
            ],
        ),
        PatternGroup::new(
            PolicyVerdict::Prohibited,
            &[
                r"no\s+affiliate\s+links",
                r"no\s+referral\s+links",
                r"no\s+tracking\s+links",
                r"prohibited\s+links",
                r"banned\s+links",
                r"no\s+promotion",
                r"no\s+self\s+promotion",
            ],
        ),
    ]
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"<[^>]+>"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"\s+"));

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid policy regex `{}`: {}", pattern, err))
}

/// Lower-case plain text with entities decoded and markup removed.
pub fn normalize_text(raw: &str) -> String {
    let decoded = decode_html_entities(raw);
    let stripped = TAG_RE.replace_all(&decoded, " ");
    WHITESPACE_RE
        .replace_all(stripped.trim(), " ")
        .to_lowercase()
}

/// Match result naming the phrase that decided the verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMatch {
    pub verdict: PolicyVerdict,
    pub pattern: String,
}

/// Pattern-group classifier shared by every text source.
#[derive(Debug, Clone)]
pub struct PolicyClassifier {
    groups: Vec<PatternGroup>,
}

impl Default for PolicyClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyClassifier {
    pub fn new() -> Self {
        Self {
            groups: PATTERN_GROUPS.clone(),
        }
    }

    pub fn classify(&self, text: &str) -> PolicyVerdict {
        self.explain(text)
            .map(|found| found.verdict)
            .unwrap_or(PolicyVerdict::Unknown)
    }

    /// Like [`classify`](Self::classify) but reports the deciding pattern.
    pub fn explain(&self, text: &str) -> Option<PolicyMatch> {
        let normalized = normalize_text(text);
        self.groups.iter().find_map(|group| {
            group
                .patterns
                .iter()
                .find(|regex| regex.is_match(&normalized))
                .map(|regex| PolicyMatch {
                    verdict: group.verdict,
                    pattern: regex.as_str().to_string(),
                })
        })
    }
}

/// Failure fetching a policy text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicySourceError {
    #[error("policy source unavailable: {0}")]
    Unavailable(String),
    #[error("policy page `{0}` not found")]
    NotFound(String),
}

/// Provider of the raw texts a community publishes.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch_rules(&self, community: &str) -> Result<String, PolicySourceError>;

    async fn fetch_wiki_page(&self, community: &str, page: &str)
    -> Result<String, PolicySourceError>;
}

/// Per-source verdicts plus the resolved overall verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDetection {
    pub community: String,
    pub rules: PolicyVerdict,
    pub wiki: PolicyVerdict,
    pub overall: PolicyVerdict,
    pub detected_at: DateTime<Utc>,
}

impl PolicyDetection {
    /// Rules win when they say anything; the wiki fills in otherwise.
    pub fn resolve(community: impl Into<String>, rules: PolicyVerdict, wiki: PolicyVerdict) -> Self {
        let overall = if rules.is_known() { rules } else { wiki };
        Self {
            community: community.into(),
            rules,
            wiki,
            overall,
            detected_at: Utc::now(),
        }
    }
}

/// Result of [`PolicyGate::permits_detailed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDecision {
    pub community: String,
    pub verdict: PolicyVerdict,
    pub permitted: bool,
    /// `None` when the deny list answered without a detection.
    pub detection: Option<PolicyDetection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DenyEntry {
    pub community: String,
    pub reason: String,
    pub added_on: DateTime<Utc>,
}

/// Communities known to refuse the action. Keys are lower-cased.
#[derive(Debug, Default)]
pub struct DenyList {
    entries: Mutex<HashMap<String, DenyEntry>>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DenyEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace.
    pub fn add(&self, community: &str, reason: impl Into<String>) {
        let key = community.to_lowercase();
        self.lock().insert(
            key.clone(),
            DenyEntry {
                community: key,
                reason: reason.into(),
                added_on: Utc::now(),
            },
        );
    }

    pub fn remove(&self, community: &str) -> bool {
        self.lock().remove(&community.to_lowercase()).is_some()
    }

    pub fn is_denied(&self, community: &str) -> bool {
        self.lock().contains_key(&community.to_lowercase())
    }

    pub fn all(&self) -> BTreeSet<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<DenyEntry> {
        let mut entries: Vec<_> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.community.cmp(&b.community));
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Settings for [`PolicyGate`].
#[derive(Debug, Clone)]
pub struct PolicyGateConfig {
    pub cache_ttl: Duration,
    /// Wiki pages consulted in order.
    pub wiki_pages: Vec<String>,
    /// Whether an `UNKNOWN` verdict lets the action through.
    pub allow_unknown: bool,
}

impl Default for PolicyGateConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(86_400),
            wiki_pages: ["rules", "faq", "policies", "affiliate"]
                .into_iter()
                .map(String::from)
                .collect(),
            allow_unknown: false,
        }
    }
}

/// Cached policy gate.
#[derive(Debug)]
pub struct PolicyGate {
    config: PolicyGateConfig,
    classifier: PolicyClassifier,
    cache: PolicyCache,
    deny_list: DenyList,
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::new(PolicyGateConfig::default())
    }
}

impl PolicyGate {
    pub fn new(config: PolicyGateConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: PolicyGateConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: PolicyCache::new(config.cache_ttl, clock),
            classifier: PolicyClassifier::new(),
            deny_list: DenyList::new(),
            config,
        }
    }

    pub fn cache(&self) -> &PolicyCache {
        &self.cache
    }

    pub fn deny_list(&self) -> &DenyList {
        &self.deny_list
    }

    pub fn classifier(&self) -> &PolicyClassifier {
        &self.classifier
    }

    pub fn config(&self) -> &PolicyGateConfig {
        &self.config
    }

    /// Overall verdict for `community`.
    pub async fn detect(&self, community: &str, source: &dyn PolicySource) -> PolicyVerdict {
        self.detect_detailed(community, source).await.overall
    }

    /// Per-source breakdown, served from cache while fresh.
    pub async fn detect_detailed(
        &self,
        community: &str,
        source: &dyn PolicySource,
    ) -> PolicyDetection {
        if let Some(cached) = self.cache.get(community) {
            debug!("policy cache hit for {community}: {}", cached.overall);
            return cached;
        }
        debug!("policy cache miss for {community}");

        let rules = self.check_rules(community, source).await;
        let wiki = self.check_wiki(community, source).await;
        let detection = PolicyDetection::resolve(community, rules, wiki);
        self.cache.insert(detection.clone());
        detection
    }

    /// Whether the action may proceed in `community`. Newly prohibited
    /// communities are added to the deny list.
    pub async fn permits(&self, community: &str, source: &dyn PolicySource) -> bool {
        self.permits_detailed(community, source).await.permitted
    }

    /// Permit decision together with the verdict it was based on. At most one
    /// detection runs per call.
    pub async fn permits_detailed(
        &self,
        community: &str,
        source: &dyn PolicySource,
    ) -> PolicyDecision {
        if self.deny_list.is_denied(community) {
            debug!("{community} is on the deny list");
            return PolicyDecision {
                community: community.to_string(),
                verdict: PolicyVerdict::Prohibited,
                permitted: false,
                detection: None,
            };
        }

        let detection = self.detect_detailed(community, source).await;
        let verdict = detection.overall;
        let permitted = if verdict == PolicyVerdict::Prohibited {
            let origin = if detection.rules.is_known() {
                PolicySourceKind::Rules
            } else {
                PolicySourceKind::Wiki
            };
            self.deny_list
                .add(community, format!("affiliate links prohibited by {origin}"));
            false
        } else {
            verdict.permits(self.config.allow_unknown)
        };

        PolicyDecision {
            community: community.to_string(),
            verdict,
            permitted,
            detection: Some(detection),
        }
    }

    async fn check_rules(&self, community: &str, source: &dyn PolicySource) -> PolicyVerdict {
        match source.fetch_rules(community).await {
            Ok(text) => self.classify_source(community, PolicySourceKind::Rules, &text),
            Err(err) => {
                warn!("failed to fetch rules for {community}: {err}");
                PolicyVerdict::Unknown
            }
        }
    }

    async fn check_wiki(&self, community: &str, source: &dyn PolicySource) -> PolicyVerdict {
        for page in &self.config.wiki_pages {
            match source.fetch_wiki_page(community, page).await {
                Ok(text) => {
                    let verdict = self.classify_source(community, PolicySourceKind::Wiki, &text);
                    if verdict.is_known() {
                        return verdict;
                    }
                }
                Err(err) => debug!("skipping wiki page {page} for {community}: {err}"),
            }
        }
        PolicyVerdict::Unknown
    }

    fn classify_source(&self, community: &str, kind: PolicySourceKind, text: &str) -> PolicyVerdict {
        match self.classifier.explain(text) {
            Some(found) => {
                info!(
                    "{community} {kind}: {} (matched `{}`)",
                    found.verdict, found.pattern
                );
                found.verdict
            }
            None => {
                debug!("no affiliate policy found in {community} {kind}");
                PolicyVerdict::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        rules: Option<String>,
        wiki: HashMap<String, String>,
        rule_fetches: AtomicUsize,
    }

    impl FakeSource {
        fn rules(text: &str) -> Self {
            Self {
                rules: Some(text.to_string()),
                ..Default::default()
            }
        }

        fn with_page(mut self, page: &str, text: &str) -> Self {
            self.wiki.insert(page.to_string(), text.to_string());
            self
        }

        fn fetches(&self) -> usize {
            self.rule_fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PolicySource for FakeSource {
        async fn fetch_rules(&self, _community: &str) -> Result<String, PolicySourceError> {
            self.rule_fetches.fetch_add(1, Ordering::SeqCst);
            self.rules
                .clone()
                .ok_or_else(|| PolicySourceError::Unavailable("403".into()))
        }

        async fn fetch_wiki_page(
            &self,
            _community: &str,
            page: &str,
        ) -> Result<String, PolicySourceError> {
            self.wiki
                .get(page)
                .cloned()
                .ok_or_else(|| PolicySourceError::NotFound(page.to_string()))
        }
    }

    #[test]
    fn approval_beats_denial() {
        let classifier = PolicyClassifier::new();
        let text = "Rule 4: No self promotion.\nAffiliate links allowed if relevant.";
        assert_eq!(classifier.classify(text), PolicyVerdict::Allowed);
    }

    #[test]
    fn restriction_beats_denial() {
        let classifier = PolicyClassifier::new();
        let text = "No promotion. Referral codes must be disclosed.";
        assert_eq!(classifier.classify(text), PolicyVerdict::Restricted);
    }

    #[test]
    fn classifies_denial_and_silence() {
        let classifier = PolicyClassifier::new();
        assert_eq!(classifier.classify("NO  AFFILIATE\nLINKS"), PolicyVerdict::Prohibited);
        assert_eq!(classifier.classify("Be civil."), PolicyVerdict::Unknown);
        assert_eq!(classifier.classify(""), PolicyVerdict::Unknown);
    }

    #[test]
    fn normalizes_markup_before_matching() {
        let classifier = PolicyClassifier::new();
        let html = "<p>No <strong>affiliate</strong>&nbsp;links &amp; spam</p>";
        assert_eq!(classifier.classify(html), PolicyVerdict::Prohibited);
        let found = classifier.explain(html).unwrap();
        assert_eq!(found.pattern, r"no\s+affiliate\s+links");
    }

    #[test]
    fn deny_list_is_case_insensitive() {
        let list = DenyList::new();
        list.add("Deals", "spam");
        assert!(list.is_denied("deals"));
        assert!(list.is_denied("DEALS"));
        assert_eq!(list.all().into_iter().collect::<Vec<_>>(), ["deals"]);
        assert!(list.remove("dEaLs"));
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn rules_take_precedence_over_wiki() {
        let gate = PolicyGate::default();
        let source = FakeSource::rules("mod approval needed")
            .with_page("faq", "affiliate links allowed");
        let detection = gate.detect_detailed("gadgets", &source).await;
        assert_eq!(detection.rules, PolicyVerdict::Restricted);
        assert_eq!(detection.wiki, PolicyVerdict::Allowed);
        assert_eq!(detection.overall, PolicyVerdict::Restricted);
    }

    #[tokio::test]
    async fn falls_back_to_wiki_when_rules_fail() {
        let gate = PolicyGate::default();
        let source = FakeSource::default()
            .with_page("rules", "Be nice")
            .with_page("policies", "No referral links");
        assert_eq!(gate.detect("gadgets", &source).await, PolicyVerdict::Prohibited);
    }

    #[tokio::test]
    async fn unreachable_sources_yield_unknown() {
        let gate = PolicyGate::default();
        let source = FakeSource::default();
        assert_eq!(gate.detect("void", &source).await, PolicyVerdict::Unknown);
    }

    #[tokio::test]
    async fn caches_until_ttl_elapses() {
        let clock = ManualClock::new();
        let gate = PolicyGate::with_clock(PolicyGateConfig::default(), Arc::new(clock.clone()));
        let source = FakeSource::rules("affiliate links allowed");

        assert_eq!(gate.detect("test", &source).await, PolicyVerdict::Allowed);
        clock.advance(Duration::from_secs(3600));
        assert_eq!(gate.detect("TEST", &source).await, PolicyVerdict::Allowed);
        assert_eq!(source.fetches(), 1);

        clock.advance(Duration::from_secs(86_400));
        assert_eq!(gate.detect("test", &source).await, PolicyVerdict::Allowed);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn prohibited_communities_are_denied_afterwards() {
        let gate = PolicyGate::default();
        let source = FakeSource::rules("No self promotion");
        assert!(!gate.permits("Frugal", &source).await);
        assert!(gate.deny_list().is_denied("frugal"));
        gate.cache().invalidate("frugal");
        assert!(!gate.permits("frugal", &source).await);
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn detailed_permit_runs_a_single_detection() {
        let gate = PolicyGate::new(PolicyGateConfig {
            cache_ttl: Duration::ZERO,
            ..Default::default()
        });
        let source = FakeSource::rules("Referral codes must be disclosed");

        let decision = gate.permits_detailed("deals", &source).await;
        assert_eq!(decision.verdict, PolicyVerdict::Restricted);
        assert!(decision.permitted);
        assert_eq!(
            decision.detection.map(|detection| detection.rules),
            Some(PolicyVerdict::Restricted)
        );
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn deny_listed_decision_skips_detection() {
        let gate = PolicyGate::default();
        gate.deny_list().add("frugal", "manual");
        let source = FakeSource::rules("affiliate links allowed");

        let decision = gate.permits_detailed("Frugal", &source).await;
        assert_eq!(decision.verdict, PolicyVerdict::Prohibited);
        assert!(!decision.permitted);
        assert!(decision.detection.is_none());
        assert_eq!(source.fetches(), 0);
    }

    #[tokio::test]
    async fn unknown_policy_respects_configuration() {
        let source = FakeSource::rules("Be civil");
        assert!(!PolicyGate::default().permits("a", &source).await);
        let lenient = PolicyGate::new(PolicyGateConfig {
            allow_unknown: true,
            ..Default::default()
        });
        assert!(lenient.permits("a", &source).await);
    }
}
