//! Resource rotation engine.
//!
//! A [`ResourcePool`] hands out credentials or egress paths according to a
//! [`RotationStrategy`] while enforcing a per-window usage ceiling. All
//! mutable state lives behind one mutex so a quota check and the matching
//! counter bump can never interleave with another caller.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use rand::rngs::ThreadRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::clock::{Clock, system_clock};
use super::usage::UsageStats;

/// Anything a pool can rotate over.
pub trait PooledResource: Clone + Send + Sync + fmt::Debug {
    /// Stable identifier used for reporting outcomes.
    fn resource_id(&self) -> String;

    /// Whether the resource may be handed out at all.
    fn selectable(&self) -> bool {
        true
    }
}

/// Rotation policy requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
}

impl RotationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStrategy::RoundRobin => "round_robin",
            RotationStrategy::Random => "random",
            RotationStrategy::LeastUsed => "least_used",
        }
    }

    /// Strategy object implementing this policy.
    pub fn selector(&self) -> &'static dyn SelectionStrategy {
        match self {
            RotationStrategy::RoundRobin => &RoundRobin,
            RotationStrategy::Random => &RandomChoice,
            RotationStrategy::LeastUsed => &LeastUsed,
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationStrategy {
    type Err = PoolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(RotationStrategy::RoundRobin),
            "random" => Ok(RotationStrategy::Random),
            "least_used" => Ok(RotationStrategy::LeastUsed),
            other => Err(PoolError::Configuration(format!(
                "unknown rotation strategy `{other}`"
            ))),
        }
    }
}

/// Errors surfaced by resource pools.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no {0} available")]
    NoResourceAvailable(String),
}

/// Selectable resource as seen by a strategy; `position` is the index in
/// configured order.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub position: usize,
    pub stats: &'a UsageStats,
}

/// A pluggable selection rule.
///
/// `choose` returns an index into `candidates`. Candidates are always given
/// in configured order, so "first wins" tie-breaking falls out of taking the
/// first minimum.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn choose(&self, candidates: &[Candidate<'_>], ceiling: u32, rng: &mut ThreadRng)
    -> Option<usize>;

    /// Whether a pick counts against the quota window.
    fn records_use(&self) -> bool {
        true
    }
}

/// Oldest `last_used` first, falling back to the least-used resource once
/// the pick has exhausted its window.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn choose(
        &self,
        candidates: &[Candidate<'_>],
        ceiling: u32,
        _rng: &mut ThreadRng,
    ) -> Option<usize> {
        let oldest = candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, candidate)| candidate.stats.last_used)
            .map(|(idx, _)| idx)?;

        if candidates[oldest].stats.use_count < ceiling {
            return Some(oldest);
        }

        // The exhausted pick loses ties so traffic moves off it.
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(idx, candidate)| (candidate.stats.use_count, *idx == oldest))
            .map(|(idx, _)| idx)
    }
}

/// Uniform pick; does not count against quota.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomChoice;

impl SelectionStrategy for RandomChoice {
    fn name(&self) -> &'static str {
        "random"
    }

    fn choose(
        &self,
        candidates: &[Candidate<'_>],
        _ceiling: u32,
        rng: &mut ThreadRng,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rng.gen_range(0..candidates.len()))
    }

    fn records_use(&self) -> bool {
        false
    }
}

/// Smallest `use_count` in the current window.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastUsed;

impl SelectionStrategy for LeastUsed {
    fn name(&self) -> &'static str {
        "least_used"
    }

    fn choose(
        &self,
        candidates: &[Candidate<'_>],
        _ceiling: u32,
        _rng: &mut ThreadRng,
    ) -> Option<usize> {
        least_used_index(candidates)
    }
}

fn least_used_index(candidates: &[Candidate<'_>]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, candidate)| candidate.stats.use_count)
        .map(|(idx, _)| idx)
}

/// Quota settings for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub window: Duration,
    pub max_uses_per_window: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            max_uses_per_window: 10,
        }
    }
}

/// A selected resource together with the decision that produced it.
#[derive(Debug, Clone)]
pub struct ResourceHandle<R> {
    pub resource: R,
    pub resource_id: String,
    pub strategy: &'static str,
    /// `use_count` after this selection.
    pub use_count: u32,
    /// Usage recorded by this selection, kept so it can be rolled back.
    charge: Option<SelectionCharge>,
}

#[derive(Debug, Clone)]
struct SelectionCharge {
    selected_at: Instant,
    previous_last_used: Option<Instant>,
    previous_last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct PoolEntry<R> {
    resource: R,
    stats: UsageStats,
    enabled: bool,
}

#[derive(Debug)]
struct PoolState<R> {
    entries: Vec<PoolEntry<R>>,
    window_start: Instant,
}

impl<R> PoolState<R> {
    fn roll_window(&mut self, now: Instant, window: Duration) -> bool {
        if now.saturating_duration_since(self.window_start) <= window {
            return false;
        }
        for entry in &mut self.entries {
            entry.stats.reset_window();
        }
        self.window_start = now;
        true
    }

    fn entry_mut(&mut self, resource_id: &str) -> Option<&mut PoolEntry<R>> {
        self.entries
            .iter_mut()
            .find(|entry| entry.stats.resource_id == resource_id)
    }

    fn entry(&self, resource_id: &str) -> Option<&PoolEntry<R>> {
        self.entries
            .iter()
            .find(|entry| entry.stats.resource_id == resource_id)
    }
}

/// Thread-safe rotation pool over one kind of resource.
#[derive(Debug)]
pub struct ResourcePool<R> {
    kind: String,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState<R>>,
}

impl<R: PooledResource> ResourcePool<R> {
    /// Build a pool using the system clock.
    pub fn new(
        kind: impl Into<String>,
        resources: Vec<R>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        Self::with_clock(kind, resources, config, system_clock())
    }

    pub fn with_clock(
        kind: impl Into<String>,
        resources: Vec<R>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError> {
        let kind = kind.into();
        if resources.is_empty() {
            return Err(PoolError::Configuration(format!("no {kind} configured")));
        }

        let mut entries: Vec<PoolEntry<R>> = Vec::with_capacity(resources.len());
        for resource in resources {
            let id = resource.resource_id();
            if entries.iter().any(|entry| entry.stats.resource_id == id) {
                warn!("ignoring duplicate {kind} `{id}`");
                continue;
            }
            entries.push(PoolEntry {
                enabled: resource.selectable(),
                stats: UsageStats::new(id),
                resource,
            });
        }

        if !entries.iter().any(|entry| entry.enabled) {
            return Err(PoolError::Configuration(format!(
                "every configured {kind} is disabled"
            )));
        }

        info!("initialised {kind} pool with {} entries", entries.len());
        let window_start = clock.now();
        Ok(Self {
            kind,
            config,
            clock,
            state: Mutex::new(PoolState {
                entries,
                window_start,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Select the next resource under `strategy`.
    pub fn select(&self, strategy: RotationStrategy) -> Result<ResourceHandle<R>, PoolError> {
        self.select_with(strategy.selector())
    }

    /// Select with an arbitrary [`SelectionStrategy`].
    pub fn select_with(
        &self,
        strategy: &dyn SelectionStrategy,
    ) -> Result<ResourceHandle<R>, PoolError> {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.roll_window(now, self.config.window) {
            debug!("{} quota window rolled over", self.kind);
        }

        let picked = {
            let candidates: Vec<Candidate<'_>> = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.enabled)
                .map(|(position, entry)| Candidate {
                    position,
                    stats: &entry.stats,
                })
                .collect();
            let mut rng = rand::thread_rng();
            strategy
                .choose(&candidates, self.config.max_uses_per_window, &mut rng)
                .and_then(|idx| candidates.get(idx))
                .map(|candidate| candidate.position)
        };

        let position =
            picked.ok_or_else(|| PoolError::NoResourceAvailable(self.kind.clone()))?;
        let entry = &mut state.entries[position];
        let charge = strategy.records_use().then(|| {
            let charge = SelectionCharge {
                selected_at: now,
                previous_last_used: entry.stats.last_used,
                previous_last_used_at: entry.stats.last_used_at,
            };
            entry.stats.mark_used(now);
            charge
        });

        debug!(
            "{} `{}` selected via {} (uses this window: {})",
            self.kind,
            entry.stats.resource_id,
            strategy.name(),
            entry.stats.use_count
        );

        Ok(ResourceHandle {
            resource: entry.resource.clone(),
            resource_id: entry.stats.resource_id.clone(),
            strategy: strategy.name(),
            use_count: entry.stats.use_count,
            charge,
        })
    }

    /// Undo the usage recorded by `handle` when the action never happened.
    ///
    /// Returns `false` when there is nothing to undo: the strategy did not
    /// record usage, the window has rolled over since, or the resource has
    /// been selected again.
    pub fn cancel(&self, handle: &ResourceHandle<R>) -> bool {
        let Some(charge) = &handle.charge else {
            return false;
        };
        let mut state = self.lock();
        if charge.selected_at < state.window_start {
            return false;
        }
        let Some(entry) = state.entry_mut(&handle.resource_id) else {
            return false;
        };
        if entry.stats.last_used != Some(charge.selected_at) || entry.stats.use_count == 0 {
            return false;
        }
        entry.stats.use_count -= 1;
        entry.stats.last_used = charge.previous_last_used;
        entry.stats.last_used_at = charge.previous_last_used_at;
        debug!("{} `{}` selection cancelled", self.kind, handle.resource_id);
        true
    }

    /// Record the outcome of an action. Unknown ids are ignored.
    pub fn report(&self, resource_id: &str, success: bool) {
        let mut state = self.lock();
        match state.entry_mut(resource_id) {
            Some(entry) => entry.stats.record_outcome(success),
            None => warn!("outcome reported for unknown {} `{resource_id}`", self.kind),
        }
    }

    /// Record an outcome together with the observed latency.
    pub fn report_latency(&self, resource_id: &str, success: bool, latency: Duration) {
        let mut state = self.lock();
        match state.entry_mut(resource_id) {
            Some(entry) => {
                entry.stats.record_outcome(success);
                entry.stats.record_latency(latency);
            }
            None => warn!("outcome reported for unknown {} `{resource_id}`", self.kind),
        }
    }

    /// Exclude a resource from selection. Returns `true` if it was enabled.
    pub fn disable(&self, resource_id: &str) -> bool {
        let mut state = self.lock();
        match state.entry_mut(resource_id) {
            Some(entry) if entry.enabled => {
                entry.enabled = false;
                info!("{} `{resource_id}` disabled", self.kind);
                true
            }
            _ => false,
        }
    }

    /// Operator override bringing a disabled resource back.
    pub fn enable(&self, resource_id: &str) -> bool {
        let mut state = self.lock();
        match state.entry_mut(resource_id) {
            Some(entry) if !entry.enabled => {
                entry.enabled = true;
                info!("{} `{resource_id}` re-enabled", self.kind);
                true
            }
            _ => false,
        }
    }

    pub fn is_enabled(&self, resource_id: &str) -> bool {
        self.lock()
            .entry(resource_id)
            .is_some_and(|entry| entry.enabled)
    }

    pub fn stats(&self, resource_id: &str) -> Option<UsageStats> {
        self.lock().entry(resource_id).map(|entry| entry.stats.clone())
    }

    pub fn resource(&self, resource_id: &str) -> Option<R> {
        self.lock()
            .entry(resource_id)
            .map(|entry| entry.resource.clone())
    }

    /// Stats for every resource, disabled ones included, in configured order.
    pub fn snapshot(&self) -> Vec<UsageStats> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.stats.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of currently selectable resources.
    pub fn available(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.enabled)
            .count()
    }

    /// Highest-scoring enabled resource; ties go to the first configured.
    pub fn best_by<F>(&self, score: F) -> Option<(R, f64)>
    where
        F: Fn(&UsageStats) -> f64,
    {
        let state = self.lock();
        let mut best: Option<(&PoolEntry<R>, f64)> = None;
        for entry in state.entries.iter().filter(|entry| entry.enabled) {
            let value = score(&entry.stats);
            if best.as_ref().is_none_or(|(_, current)| value > *current) {
                best = Some((entry, value));
            }
        }
        best.map(|(entry, value)| (entry.resource.clone(), value))
    }
}
