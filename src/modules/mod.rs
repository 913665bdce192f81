//! Core services: rotation, health scoring, policy gating and work tracking.
//!
//! Every stateful service guards its data with a single mutex and performs
//! no I/O while holding it.

pub mod clock;
pub mod credentials;
pub mod events;
pub mod keywords;
pub mod pacing;
pub mod policy;
pub mod proxy;
pub mod rotation;
pub mod usage;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::Credential;
pub use events::{
    EngineEvent, EventDispatcher, EventHandler, KeywordEvent, LoggingHandler, OutcomeEvent,
    PathDisabledEvent, PolicyEvent, ResourceSelectedEvent,
};
pub use keywords::{KeywordState, KeywordWorkItem, StateCounts, TrackerError, Transition, WorkItemTracker};
pub use pacing::RequestPacer;
pub use policy::{
    DenyEntry, DenyList, PolicyCache, PolicyCacheEntry, PolicyClassifier, PolicyDecision,
    PolicyDetection, PolicyGate, PolicyGateConfig, PolicyMatch, PolicySource, PolicySourceError,
    PolicySourceKind, PolicyVerdict,
};
pub use proxy::{EgressPath, ProxyHealthReport, ProxyHealthScorer, ProxyManager, ProxyStats};
pub use rotation::{
    Candidate, LeastUsed, PoolConfig, PoolError, PooledResource, RandomChoice, ResourceHandle,
    ResourcePool, RotationStrategy, RoundRobin, SelectionStrategy,
};
pub use usage::UsageStats;
