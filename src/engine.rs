//! High level engine orchestration.
//!
//! Wires the credential pool, egress-path manager, policy gate, request pacer
//! and keyword tracker together behind one handle, and drives a
//! [`DiscussionClient`] through the select -> act -> report cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::external::{ActionPayload, ClientError, DiscussionClient};
use crate::modules::clock::{Clock, system_clock};
use crate::modules::credentials::Credential;
use crate::modules::events::{
	EngineEvent, EventDispatcher, EventHandler, KeywordEvent, LoggingHandler, OutcomeEvent,
	PathDisabledEvent, PolicyEvent, ResourceSelectedEvent,
};
use crate::modules::keywords::{KeywordWorkItem, TrackerError, WorkItemTracker};
use crate::modules::pacing::RequestPacer;
use crate::modules::policy::{DenyEntry, PolicyGate, PolicyVerdict};
use crate::modules::proxy::{EgressPath, ProxyManager};
use crate::modules::rotation::{PoolError, ResourceHandle, ResourcePool, RotationStrategy};
use crate::modules::usage::UsageStats;

/// Result alias used across the orchestration layer.
pub type EngineResult<T> = Result<T, EngineError>;

/// High-level error surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Pool(#[from] PoolError),
	#[error(transparent)]
	Tracker(#[from] TrackerError),
	#[error("client error: {0}")]
	Client(#[from] ClientError),
	#[error("{community} does not permit the action (policy {verdict})")]
	PolicyDenied {
		community: String,
		verdict: PolicyVerdict,
	},
	#[error("unknown egress path `{0}`")]
	UnknownPath(String),
}

impl EngineError {
	/// Whether backing off and retrying later can help.
	pub fn is_recoverable(&self) -> bool {
		matches!(
			self,
			EngineError::Pool(PoolError::NoResourceAvailable(_)) | EngineError::Client(_)
		)
	}
}

/// Resources held for one action.
#[derive(Debug, Clone)]
pub struct Lease {
	pub credential: ResourceHandle<Credential>,
	pub egress: Option<ResourceHandle<EgressPath>>,
}

/// Outcome of a completed [`ReplyEngine::dispatch`].
#[derive(Debug, Clone)]
pub struct DispatchReport {
	pub credential_id: String,
	pub egress_id: Option<String>,
	pub verdict: PolicyVerdict,
	pub latency: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthCheckReport {
	pub path_id: String,
	pub success: bool,
	pub latency: Duration,
	pub disabled: bool,
}

/// Serializable view of all in-memory engine state.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
	pub taken_at: DateTime<Utc>,
	pub credentials: Vec<UsageStats>,
	pub egress_paths: Vec<UsageStats>,
	pub keywords: Vec<KeywordWorkItem>,
	pub denied_communities: Vec<DenyEntry>,
}

impl EngineSnapshot {
	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string_pretty(self)
	}
}

/// Fluent builder for [`ReplyEngine`].
pub struct ReplyEngineBuilder {
	config: EngineConfig,
	strategy: Option<RotationStrategy>,
	clock: Option<Arc<dyn Clock>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	log_events: bool,
}

impl ReplyEngineBuilder {
	pub fn new(credentials: Vec<Credential>) -> Self {
		Self::from_config(EngineConfig::new(credentials))
	}

	pub fn from_config(config: EngineConfig) -> Self {
		Self {
			config,
			strategy: None,
			clock: None,
			handlers: Vec::new(),
			log_events: true,
		}
	}

	pub fn with_strategy(mut self, strategy: RotationStrategy) -> Self {
		self.strategy = Some(strategy);
		self
	}

	pub fn with_egress_paths<I>(mut self, paths: I) -> Self
	where
		I: IntoIterator<Item = EgressPath>,
	{
		self.config.egress_paths = paths.into_iter().collect();
		self
	}

	pub fn with_quota(mut self, window: Duration, max_uses_per_window: u32) -> Self {
		self.config.quota.window_secs = window.as_secs_f64();
		self.config.quota.max_uses_per_window = max_uses_per_window;
		self
	}

	pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
		self.config.policy.cache_ttl_secs = ttl.as_secs_f64();
		self
	}

	pub fn with_wiki_pages<I, S>(mut self, pages: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.policy.wiki_pages = pages.into_iter().map(Into::into).collect();
		self
	}

	pub fn allow_unknown_policy(mut self, allow: bool) -> Self {
		self.config.policy.allow_unknown = allow;
		self
	}

	pub fn with_failure_margin(mut self, margin: u64) -> Self {
		self.config.health.failure_margin = margin;
		self
	}

	pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
		self.config.health.check_timeout_secs = timeout.as_secs_f64();
		self
	}

	pub fn with_min_interval(mut self, interval: Duration) -> Self {
		self.config.pacing.min_interval_secs = interval.as_secs_f64();
		self
	}

	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_event_logging(mut self) -> Self {
		self.log_events = false;
		self
	}

	pub fn build(self, client: Arc<dyn DiscussionClient>) -> EngineResult<ReplyEngine> {
		ReplyEngine::assemble(self, client)
	}
}

/// Main orchestrator.
pub struct ReplyEngine {
	strategy: RotationStrategy,
	client: Arc<dyn DiscussionClient>,
	credentials: ResourcePool<Credential>,
	proxies: Option<ProxyManager>,
	policy: PolicyGate,
	keywords: WorkItemTracker,
	pacer: RequestPacer,
	events: EventDispatcher,
	health_timeout: Duration,
}

impl ReplyEngine {
	pub fn builder(credentials: Vec<Credential>) -> ReplyEngineBuilder {
		ReplyEngineBuilder::new(credentials)
	}

	pub fn from_config(
		config: EngineConfig,
		client: Arc<dyn DiscussionClient>,
	) -> EngineResult<Self> {
		ReplyEngineBuilder::from_config(config).build(client)
	}

	fn assemble(builder: ReplyEngineBuilder, client: Arc<dyn DiscussionClient>) -> EngineResult<Self> {
		let config = builder.config;
		config.validate()?;
		let strategy = match builder.strategy {
			Some(strategy) => strategy,
			None => config.strategy()?,
		};
		let clock = builder.clock.unwrap_or_else(system_clock);
		let pool_config = config.quota.pool_config();

		let credentials = ResourcePool::with_clock(
			"credential",
			config.credentials.clone(),
			pool_config.clone(),
			clock.clone(),
		)?;

		let proxies = if config.egress_paths.is_empty() {
			None
		} else {
			Some(ProxyManager::with_clock(
				config.egress_paths.clone(),
				pool_config,
				config.health.scorer(),
				clock.clone(),
			)?)
		};

		let mut events = EventDispatcher::new();
		if builder.log_events {
			events.register_handler(Arc::new(LoggingHandler));
		}
		for handler in builder.handlers {
			events.register_handler(handler);
		}

		info!(
			"engine ready: {} credentials, {} egress paths, strategy {} (client {})",
			credentials.len(),
			proxies.as_ref().map_or(0, |manager| manager.pool().len()),
			strategy,
			client.name()
		);

		Ok(Self {
			strategy,
			policy: PolicyGate::with_clock(config.policy.gate_config(), clock.clone()),
			keywords: WorkItemTracker::with_clock(clock.clone()),
			pacer: RequestPacer::with_clock(config.pacing.min_interval(), clock),
			health_timeout: config.health.check_timeout(),
			client,
			credentials,
			proxies,
			events,
		})
	}

	pub fn strategy(&self) -> RotationStrategy {
		self.strategy
	}

	pub fn credentials(&self) -> &ResourcePool<Credential> {
		&self.credentials
	}

	pub fn proxies(&self) -> Option<&ProxyManager> {
		self.proxies.as_ref()
	}

	pub fn policy(&self) -> &PolicyGate {
		&self.policy
	}

	pub fn keywords(&self) -> &WorkItemTracker {
		&self.keywords
	}

	pub fn pacer(&self) -> &RequestPacer {
		&self.pacer
	}

	pub fn health_check_timeout(&self) -> Duration {
		self.health_timeout
	}

	/// Select a credential and, when paths are configured, an egress path.
	///
	/// If no egress path is available the credential selection is rolled
	/// back, so a failed acquire costs no quota.
	pub fn acquire(&self) -> EngineResult<Lease> {
		let credential = self.credentials.select(self.strategy)?;

		let egress = match &self.proxies {
			Some(manager) => match manager.next_proxy(self.strategy) {
				Ok(handle) => Some(handle),
				Err(err) => {
					self.credentials.cancel(&credential);
					debug!("released credential {}: {err}", credential.resource_id);
					return Err(err.into());
				}
			},
			None => None,
		};

		self.emit_selected(self.credentials.kind(), &credential.resource_id, credential.strategy, credential.use_count);
		if let (Some(manager), Some(handle)) = (&self.proxies, &egress) {
			self.emit_selected(manager.pool().kind(), &handle.resource_id, handle.strategy, handle.use_count);
		}

		Ok(Lease { credential, egress })
	}

	/// Report how the leased action went. Returns `true` if the egress path
	/// crossed its failure margin and was disabled.
	pub fn release(&self, lease: &Lease, success: bool, latency: Option<Duration>) -> bool {
		self.credentials.report(&lease.credential.resource_id, success);
		self.emit_outcome(self.credentials.kind(), &lease.credential.resource_id, success, None);

		let (Some(manager), Some(egress)) = (&self.proxies, &lease.egress) else {
			return false;
		};
		manager.report(&egress.resource_id, success, latency);
		self.emit_outcome(manager.pool().kind(), &egress.resource_id, success, latency);

		if !success && manager.should_disable(&egress.resource_id) {
			return self.retire_path(manager, &egress.resource_id);
		}
		false
	}

	/// Resolve the community policy, failing with `PolicyDenied` when it does
	/// not permit the action.
	pub async fn check_policy(&self, community: &str) -> EngineResult<PolicyVerdict> {
		let decision = self
			.policy
			.permits_detailed(community, self.client.as_ref())
			.await;
		let (verdict, permitted) = (decision.verdict, decision.permitted);

		self.events.dispatch(EngineEvent::PolicyResolved(PolicyEvent {
			community: community.to_string(),
			verdict,
			permitted,
			timestamp: Utc::now(),
		}));

		if permitted {
			Ok(verdict)
		} else {
			Err(EngineError::PolicyDenied {
				community: community.to_string(),
				verdict,
			})
		}
	}

	/// Run one action end to end: policy, pacing, selection, the client call
	/// and outcome reporting.
	pub async fn dispatch(&self, payload: &ActionPayload) -> EngineResult<DispatchReport> {
		let verdict = self.check_policy(&payload.community).await?;
		self.pacer.wait_turn().await;
		let lease = self.acquire()?;

		let started = Instant::now();
		let outcome = self
			.client
			.perform_action(
				&lease.credential.resource,
				lease.egress.as_ref().map(|handle| &handle.resource),
				payload,
			)
			.await;
		let latency = started.elapsed();

		self.release(&lease, outcome.is_ok(), Some(latency));
		if let Err(err) = outcome {
			warn!(
				"action in {} via {} failed: {err}",
				payload.community, lease.credential.resource_id
			);
			return Err(err.into());
		}

		debug!(
			"action in {} thread {} done in {:.2}s",
			payload.community,
			payload.thread_id,
			latency.as_secs_f64()
		);
		Ok(DispatchReport {
			credential_id: lease.credential.resource_id,
			egress_id: lease.egress.map(|handle| handle.resource_id),
			verdict,
			latency,
		})
	}

	/// Probe `path_id` through the client and feed the result into health
	/// tracking, disabling the path once it crosses its failure margin.
	pub async fn health_check(&self, path_id: &str) -> EngineResult<HealthCheckReport> {
		let manager = self
			.proxies
			.as_ref()
			.ok_or_else(|| EngineError::UnknownPath(path_id.to_string()))?;
		let path = manager
			.pool()
			.resource(path_id)
			.ok_or_else(|| EngineError::UnknownPath(path_id.to_string()))?;

		let started = Instant::now();
		let success = match tokio::time::timeout(self.health_timeout, self.client.probe(&path)).await {
			Ok(Ok(())) => true,
			Ok(Err(err)) => {
				debug!("health check for {path_id} failed: {err}");
				false
			}
			Err(_) => {
				debug!("health check for {path_id} timed out after {:?}", self.health_timeout);
				false
			}
		};
		let latency = started.elapsed();

		let over_margin = manager.record_health_check(path_id, success, latency);
		self.emit_outcome(manager.pool().kind(), path_id, success, Some(latency));
		let disabled = over_margin && self.retire_path(manager, path_id);

		Ok(HealthCheckReport {
			path_id: path_id.to_string(),
			success,
			latency,
			disabled,
		})
	}

	/// Track keywords from a (re)loaded list.
	pub fn add_keywords<I, S>(&self, keywords: I) -> usize
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		self.keywords.add_all(keywords)
	}

	/// Claim the next unstarted keyword.
	pub fn next_keyword(&self) -> Option<KeywordWorkItem> {
		let item = self.keywords.claim_next()?;
		self.emit_keyword(&item);
		Some(item)
	}

	pub fn finish_keyword(&self, keyword: &str, success: bool) -> EngineResult<KeywordWorkItem> {
		let item = if success {
			self.keywords.succeed(keyword)?
		} else {
			self.keywords.fail(keyword)?
		};
		self.emit_keyword(&item);
		Ok(item)
	}

	pub fn retry_keyword(&self, keyword: &str) -> EngineResult<KeywordWorkItem> {
		let item = self.keywords.retry(keyword)?;
		self.emit_keyword(&item);
		Ok(item)
	}

	pub fn snapshot(&self) -> EngineSnapshot {
		EngineSnapshot {
			taken_at: Utc::now(),
			credentials: self.credentials.snapshot(),
			egress_paths: self
				.proxies
				.as_ref()
				.map(|manager| manager.pool().snapshot())
				.unwrap_or_default(),
			keywords: self.keywords.snapshot(),
			denied_communities: self.policy.deny_list().entries(),
		}
	}

	fn retire_path(&self, manager: &ProxyManager, path_id: &str) -> bool {
		if !manager.disable(path_id) {
			return false;
		}
		let stats = manager.pool().stats(path_id);
		self.events.dispatch(EngineEvent::PathDisabled(PathDisabledEvent {
			path_id: path_id.to_string(),
			success_count: stats.as_ref().map_or(0, |stats| stats.success_count),
			error_count: stats.as_ref().map_or(0, |stats| stats.error_count),
			timestamp: Utc::now(),
		}));
		true
	}

	fn emit_selected(&self, kind: &str, resource_id: &str, strategy: &'static str, use_count: u32) {
		self.events.dispatch(EngineEvent::ResourceSelected(ResourceSelectedEvent {
			kind: kind.to_string(),
			resource_id: resource_id.to_string(),
			strategy,
			use_count,
			timestamp: Utc::now(),
		}));
	}

	fn emit_outcome(&self, kind: &str, resource_id: &str, success: bool, latency: Option<Duration>) {
		self.events.dispatch(EngineEvent::OutcomeReported(OutcomeEvent {
			kind: kind.to_string(),
			resource_id: resource_id.to_string(),
			success,
			latency,
			timestamp: Utc::now(),
		}));
	}

	fn emit_keyword(&self, item: &KeywordWorkItem) {
		self.events.dispatch(EngineEvent::KeywordTransition(KeywordEvent {
			keyword: item.keyword.clone(),
			state: item.state,
			timestamp: Utc::now(),
		}));
	}
}
