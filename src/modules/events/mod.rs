//! Engine event hooks.
//!
//! Lets callers observe rotation decisions, reported outcomes, policy
//! verdicts and keyword transitions without coupling to the engine.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::keywords::KeywordState;
use super::policy::PolicyVerdict;

#[derive(Debug, Clone)]
pub struct ResourceSelectedEvent {
    pub kind: String,
    pub resource_id: String,
    pub strategy: &'static str,
    pub use_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub kind: String,
    pub resource_id: String,
    pub success: bool,
    pub latency: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PolicyEvent {
    pub community: String,
    pub verdict: PolicyVerdict,
    pub permitted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PathDisabledEvent {
    pub path_id: String,
    pub success_count: u64,
    pub error_count: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct KeywordEvent {
    pub keyword: String,
    pub state: KeywordState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ResourceSelected(ResourceSelectedEvent),
    OutcomeReported(OutcomeEvent),
    PolicyResolved(PolicyEvent),
    PathDisabled(PathDisabledEvent),
    KeywordTransition(KeywordEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ResourceSelected(selected) => {
                log::debug!(
                    "{} {} via {} ({} uses this window)",
                    selected.kind,
                    selected.resource_id,
                    selected.strategy,
                    selected.use_count
                );
            }
            EngineEvent::OutcomeReported(outcome) => match outcome.latency {
                Some(latency) => log::debug!(
                    "{} {} success={} ({:.2}s)",
                    outcome.kind,
                    outcome.resource_id,
                    outcome.success,
                    latency.as_secs_f64()
                ),
                None => log::debug!(
                    "{} {} success={}",
                    outcome.kind,
                    outcome.resource_id,
                    outcome.success
                ),
            },
            EngineEvent::PolicyResolved(policy) => {
                log::info!(
                    "policy {} -> {} (permitted={})",
                    policy.community,
                    policy.verdict,
                    policy.permitted
                );
            }
            EngineEvent::PathDisabled(disabled) => {
                log::warn!(
                    "egress path {} disabled after {} errors / {} successes",
                    disabled.path_id,
                    disabled.error_count,
                    disabled.success_count
                );
            }
            EngineEvent::KeywordTransition(keyword) => {
                log::debug!("keyword `{}` -> {}", keyword.keyword, keyword.state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &EngineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(EngineEvent::KeywordTransition(KeywordEvent {
            keyword: "standing desk".into(),
            state: KeywordState::Processing,
            timestamp: Utc::now(),
        }));
        dispatcher.dispatch(EngineEvent::PolicyResolved(PolicyEvent {
            community: "deals".into(),
            verdict: PolicyVerdict::Prohibited,
            permitted: false,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 2);
        assert_eq!(dispatcher.len(), 2);
    }
}
