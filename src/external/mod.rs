//! Contracts with third-party collaborators.
//!
//! The engine never talks to the discussion platform itself. A
//! [`DiscussionClient`] implementation supplies rule and wiki texts, performs
//! actions with a given credential and egress path, and runs health probes.

pub mod search;

pub use search::{SearchResult, extract_thread_ids, extract_thread_urls, thread_id};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::modules::credentials::Credential;
use crate::modules::policy::PolicySource;
use crate::modules::proxy::EgressPath;

/// What to post and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub community: String,
    pub thread_id: String,
    pub body: String,
}

impl ActionPayload {
    pub fn new(
        community: impl Into<String>,
        thread_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            community: community.into(),
            thread_id: thread_id.into(),
            body: body.into(),
        }
    }
}

/// Errors surfaced by client implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("authentication failed for `{0}`")]
    Auth(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("action rejected: {0}")]
    Rejected(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Discussion-platform client.
#[async_trait]
pub trait DiscussionClient: PolicySource {
    fn name(&self) -> &'static str;

    async fn perform_action(
        &self,
        credential: &Credential,
        egress: Option<&EgressPath>,
        payload: &ActionPayload,
    ) -> Result<(), ClientError>;

    /// Lightweight round trip through `egress`.
    async fn probe(&self, egress: &EgressPath) -> Result<(), ClientError>;
}
