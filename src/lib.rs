//! # reply-rotor
//!
//! Credential and egress-path rotation for reply automation on discussion
//! platforms, gated by each community's published self-promotion policy.
//!
//! The crate owns the decision making only. Talking to the platform is left to
//! a [`DiscussionClient`] implementation supplied by the caller.
//!
//! ## Features
//!
//! - Per-window usage quotas with round-robin, random and least-used rotation
//! - Egress-path health scoring with automatic disabling of failing paths
//! - Community policy detection from rules and wiki pages, with caching
//! - Keyword work tracking and request pacing
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reply_rotor::{ActionPayload, DiscussionClient, EngineConfig, ReplyEngine};
//!
//! async fn run(client: Arc<dyn DiscussionClient>) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_json_file("engine.json")?;
//!     let engine = ReplyEngine::from_config(config, client)?;
//!     let report = engine
//!         .dispatch(&ActionPayload::new("rust", "abc123", "Have a look at this"))
//!         .await?;
//!     println!("posted as {}", report.credential_id);
//!     Ok(())
//! }
//! ```

mod engine;

pub mod config;
pub mod external;
pub mod modules;

pub use crate::engine::{
    DispatchReport,
    EngineError,
    EngineResult,
    EngineSnapshot,
    HealthCheckReport,
    Lease,
    ReplyEngine,
    ReplyEngineBuilder,
};

pub use crate::config::{
    ConfigError,
    EngineConfig,
    HealthConfig,
    PacingConfig,
    PolicyConfig,
    QuotaConfig,
};

pub use crate::external::{
    ActionPayload,
    ClientError,
    DiscussionClient,
    SearchResult,
    extract_thread_ids,
    extract_thread_urls,
};

pub use crate::modules::{
    Clock,
    Credential,
    DenyList,
    EgressPath,
    EngineEvent,
    EventDispatcher,
    EventHandler,
    KeywordState,
    KeywordWorkItem,
    LoggingHandler,
    ManualClock,
    PolicyDecision,
    PolicyGate,
    PolicySource,
    PolicySourceError,
    PolicyVerdict,
    PoolError,
    ProxyHealthReport,
    ProxyManager,
    RequestPacer,
    ResourcePool,
    RotationStrategy,
    SystemClock,
    TrackerError,
    UsageStats,
    WorkItemTracker,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
