//! TTL cache of policy detections keyed by lower-cased community name.
//!
//! Expiry is lazy: stale entries are treated as absent on lookup and dropped
//! there. [`PolicyCache::purge_expired`] exists for callers that want to
//! reclaim memory eagerly.

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::PolicyDetection;
use crate::modules::clock::Clock;

#[derive(Debug, Clone)]
pub struct PolicyCacheEntry {
    pub detection: PolicyDetection,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl PolicyCacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug)]
pub struct PolicyCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, PolicyCacheEntry>>,
}

impl PolicyCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PolicyCacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh detection for `community`, if any.
    pub fn get(&self, community: &str) -> Option<PolicyDetection> {
        let key = community.to_lowercase();
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.detection.clone()),
            Some(_) => {
                debug!("policy cache entry for {key} expired");
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Store a detection, replacing whatever was cached for its community.
    pub fn insert(&self, detection: PolicyDetection) {
        let key = detection.community.to_lowercase();
        let entry = PolicyCacheEntry {
            detection,
            created_at: self.clock.now(),
            ttl: self.ttl,
        };
        self.lock().insert(key, entry);
    }

    pub fn invalidate(&self, community: &str) -> bool {
        self.lock().remove(&community.to_lowercase()).is_some()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
