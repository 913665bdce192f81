//! Keyword work-item lifecycle.
//!
//! ```text
//! NEW --start--> PROCESSING --succeed--> COMPLETED
//!                    |  ^                    |
//!                  fail  \------retry--------/
//!                    v    \
//!                  FAILED -retry
//! ```

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;

use super::clock::{Clock, system_clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeywordState {
    New,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for KeywordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeywordState::New => "NEW",
            KeywordState::Processing => "PROCESSING",
            KeywordState::Completed => "COMPLETED",
            KeywordState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    Succeed,
    Fail,
    Retry,
}

impl Transition {
    /// Target state when `self` is legal from `from`.
    pub fn apply(self, from: KeywordState) -> Option<KeywordState> {
        use KeywordState::*;
        match (self, from) {
            (Transition::Start, New) => Some(Processing),
            (Transition::Succeed, Processing) => Some(Completed),
            (Transition::Fail, Processing) => Some(Failed),
            (Transition::Retry, Failed | Completed) => Some(Processing),
            _ => None,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Transition::Start => "start",
            Transition::Succeed => "succeed",
            Transition::Fail => "fail",
            Transition::Retry => "retry",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("cannot {transition} keyword `{keyword}` from {from}")]
    InvalidTransition {
        keyword: String,
        from: KeywordState,
        transition: Transition,
    },
    #[error("keyword `{0}` is not tracked")]
    UnknownKeyword(String),
}

/// One tracked keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordWorkItem {
    pub keyword: String,
    pub state: KeywordState,
    #[serde(skip)]
    pub last_processed: Option<Instant>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub processed_count: u64,
    pub failed_count: u64,
}

impl KeywordWorkItem {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            state: KeywordState::New,
            last_processed: None,
            last_processed_at: None,
            processed_count: 0,
            failed_count: 0,
        }
    }
}

/// Per-state item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub new: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct TrackerState {
    items: Vec<KeywordWorkItem>,
    index: HashMap<String, usize>,
}

impl TrackerState {
    fn insert(&mut self, item: KeywordWorkItem) -> bool {
        if self.index.contains_key(&item.keyword) {
            return false;
        }
        self.index.insert(item.keyword.clone(), self.items.len());
        self.items.push(item);
        true
    }
}

/// Move `item` along `transition`, stamping it and bumping the outcome
/// counters. Every state change goes through here.
fn advance(
    item: &mut KeywordWorkItem,
    transition: Transition,
    now: Instant,
) -> Result<(), TrackerError> {
    let Some(next) = transition.apply(item.state) else {
        warn!("rejected {transition} for `{}` in state {}", item.keyword, item.state);
        return Err(TrackerError::InvalidTransition {
            keyword: item.keyword.clone(),
            from: item.state,
            transition,
        });
    };

    debug!("keyword `{}`: {} -> {next}", item.keyword, item.state);
    item.state = next;
    item.last_processed = Some(now);
    item.last_processed_at = Some(Utc::now());
    match next {
        KeywordState::Completed => item.processed_count += 1,
        KeywordState::Failed => item.failed_count += 1,
        _ => {}
    }
    Ok(())
}

/// Thread-safe keyword state machine. Iteration follows insertion order.
#[derive(Debug)]
pub struct WorkItemTracker {
    clock: Arc<dyn Clock>,
    state: Mutex<TrackerState>,
}

impl Default for WorkItemTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkItemTracker {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `keyword`; already-tracked keywords are left untouched.
    pub fn add(&self, keyword: &str) -> bool {
        self.lock().insert(KeywordWorkItem::new(keyword))
    }

    /// Add a reloaded keyword list, returning how many were new.
    pub fn add_all<I, S>(&self, keywords: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.lock();
        keywords
            .into_iter()
            .filter(|keyword| {
                let keyword: &str = keyword.as_ref();
                state.insert(KeywordWorkItem::new(keyword))
            })
            .count()
    }

    /// Merge previously snapshotted items; keywords already tracked win.
    pub fn restore<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = KeywordWorkItem>,
    {
        let mut state = self.lock();
        items.into_iter().filter(|item| state.insert(item.clone())).count()
    }

    pub fn start(&self, keyword: &str) -> Result<KeywordWorkItem, TrackerError> {
        self.transition(keyword, Transition::Start)
    }

    pub fn succeed(&self, keyword: &str) -> Result<KeywordWorkItem, TrackerError> {
        self.transition(keyword, Transition::Succeed)
    }

    pub fn fail(&self, keyword: &str) -> Result<KeywordWorkItem, TrackerError> {
        self.transition(keyword, Transition::Fail)
    }

    pub fn retry(&self, keyword: &str) -> Result<KeywordWorkItem, TrackerError> {
        self.transition(keyword, Transition::Retry)
    }

    /// Apply `transition`, returning the updated item. Illegal transitions
    /// leave the item unchanged.
    pub fn transition(
        &self,
        keyword: &str,
        transition: Transition,
    ) -> Result<KeywordWorkItem, TrackerError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let position = *state
            .index
            .get(keyword)
            .ok_or_else(|| TrackerError::UnknownKeyword(keyword.to_string()))?;
        let item = &mut state.items[position];
        advance(item, transition, now)?;
        Ok(item.clone())
    }

    /// Earliest-inserted keyword still in `NEW`.
    pub fn next_unstarted(&self) -> Option<String> {
        self.lock()
            .items
            .iter()
            .find(|item| item.state == KeywordState::New)
            .map(|item| item.keyword.clone())
    }

    /// Atomically take the next startable keyword and move it to `PROCESSING`.
    pub fn claim_next(&self) -> Option<KeywordWorkItem> {
        let now = self.clock.now();
        let mut state = self.lock();
        let item = state
            .items
            .iter_mut()
            .find(|item| Transition::Start.apply(item.state).is_some())?;
        advance(item, Transition::Start, now).ok()?;
        Some(item.clone())
    }

    pub fn get(&self, keyword: &str) -> Option<KeywordWorkItem> {
        let state = self.lock();
        state
            .index
            .get(keyword)
            .map(|&position| state.items[position].clone())
    }

    pub fn items_in(&self, target: KeywordState) -> Vec<KeywordWorkItem> {
        self.lock()
            .items
            .iter()
            .filter(|item| item.state == target)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for item in &self.lock().items {
            match item.state {
                KeywordState::New => counts.new += 1,
                KeywordState::Processing => counts.processing += 1,
                KeywordState::Completed => counts.completed += 1,
                KeywordState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn snapshot(&self) -> Vec<KeywordWorkItem> {
        self.lock().items.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;

    #[test]
    fn re_adding_preserves_progress() {
        let tracker = WorkItemTracker::new();
        assert!(tracker.add("best budget headphones"));
        tracker.start("best budget headphones").unwrap();
        tracker.succeed("best budget headphones").unwrap();
        assert!(!tracker.add("best budget headphones"));

        let item = tracker.get("best budget headphones").unwrap();
        assert_eq!(item.state, KeywordState::Completed);
        assert_eq!(item.processed_count, 1);
        assert_eq!(item.failed_count, 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn retry_from_new_is_rejected_without_side_effects() {
        let tracker = WorkItemTracker::new();
        tracker.add("kw");
        let err = tracker.retry("kw").unwrap_err();
        assert_eq!(
            err,
            TrackerError::InvalidTransition {
                keyword: "kw".into(),
                from: KeywordState::New,
                transition: Transition::Retry,
            }
        );
        let item = tracker.get("kw").unwrap();
        assert_eq!(item.state, KeywordState::New);
        assert!(item.last_processed.is_none());
    }

    #[test]
    fn completed_and_failed_items_can_be_retried() {
        let tracker = WorkItemTracker::new();
        tracker.add_all(["a", "b"]);
        tracker.start("a").unwrap();
        tracker.succeed("a").unwrap();
        assert_eq!(tracker.retry("a").unwrap().state, KeywordState::Processing);

        tracker.start("b").unwrap();
        let failed = tracker.fail("b").unwrap();
        assert_eq!(failed.failed_count, 1);
        assert_eq!(tracker.retry("b").unwrap().state, KeywordState::Processing);
        let done = tracker.succeed("b").unwrap();
        assert_eq!((done.processed_count, done.failed_count), (1, 1));
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let tracker = WorkItemTracker::new();
        tracker.add("kw");
        assert!(tracker.succeed("kw").is_err());
        assert!(tracker.fail("kw").is_err());
        tracker.start("kw").unwrap();
        assert!(tracker.start("kw").is_err());
        assert!(tracker.retry("kw").is_err());
        assert_eq!(
            tracker.start("missing").unwrap_err(),
            TrackerError::UnknownKeyword("missing".into())
        );
    }

    #[test]
    fn claimed_items_follow_the_transition_table() {
        let clock = ManualClock::new();
        let tracker = WorkItemTracker::with_clock(Arc::new(clock.clone()));
        tracker.add_all(["a", "b"]);
        tracker.start("a").unwrap();
        tracker.fail("a").unwrap();

        // A failed keyword needs an explicit retry, so the claim skips it.
        let claimed = tracker.claim_next().unwrap();
        assert_eq!(claimed.keyword, "b");
        assert_eq!(claimed.state, KeywordState::Processing);
        assert_eq!(claimed.last_processed, Some(clock.now()));
        assert!(claimed.last_processed_at.is_some());
        assert!(tracker.claim_next().is_none());

        assert!(matches!(
            tracker.start("b"),
            Err(TrackerError::InvalidTransition {
                from: KeywordState::Processing,
                transition: Transition::Start,
                ..
            })
        ));
        assert_eq!(tracker.succeed("b").unwrap().processed_count, 1);
    }

    #[test]
    fn next_unstarted_follows_insertion_order() {
        let tracker = WorkItemTracker::new();
        assert!(tracker.next_unstarted().is_none());
        assert_eq!(tracker.add_all(["x", "y", "x", "z"]), 3);
        assert_eq!(tracker.next_unstarted().as_deref(), Some("x"));
        tracker.start("x").unwrap();
        assert_eq!(tracker.next_unstarted().as_deref(), Some("y"));
        assert_eq!(tracker.claim_next().unwrap().keyword, "y");
        assert_eq!(tracker.claim_next().unwrap().keyword, "z");
        assert!(tracker.claim_next().is_none());
        assert_eq!(
            tracker.counts(),
            StateCounts {
                new: 0,
                processing: 3,
                completed: 0,
                failed: 0
            }
        );
    }

    #[test]
    fn restore_merges_without_overwriting() {
        let tracker = WorkItemTracker::new();
        tracker.add("kept");
        let mut done = KeywordWorkItem::new("kept");
        done.state = KeywordState::Completed;
        let mut other = KeywordWorkItem::new("other");
        other.state = KeywordState::Failed;
        other.failed_count = 2;

        assert_eq!(tracker.restore([done, other]), 1);
        assert_eq!(tracker.get("kept").unwrap().state, KeywordState::New);
        assert_eq!(tracker.items_in(KeywordState::Failed)[0].failed_count, 2);
    }
}
