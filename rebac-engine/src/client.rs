//! Caller-side access to a relation service.
//!
//! [`RelationService`] is the boundary a transport adapter implements; the
//! engine implements it in-process. [`RelationClient`] waits for the service
//! to answer a version request before handing out the convenience helpers.

use crate::{
    engine::AuthorizationEngine,
    error::{RebacError, Result},
    models::*,
    query::RelationQuery,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelationService: Send + Sync {
    async fn check(&self, request: &CheckRequest) -> Result<CheckResponse>;

    async fn transact(&self, deltas: &[RelationTupleDelta]) -> Result<()>;

    /// Returns the number of tuples removed
    async fn delete_matching(&self, query: &RelationQuery) -> Result<usize>;

    async fn get_version(&self) -> Result<String>;
}

#[async_trait]
impl RelationService for AuthorizationEngine {
    async fn check(&self, request: &CheckRequest) -> Result<CheckResponse> {
        let allowed = self.check_request(request).await?;
        Ok(CheckResponse { allowed })
    }

    async fn transact(&self, deltas: &[RelationTupleDelta]) -> Result<()> {
        AuthorizationEngine::transact(self, deltas).await
    }

    async fn delete_matching(&self, query: &RelationQuery) -> Result<usize> {
        AuthorizationEngine::delete_matching(self, query).await
    }

    async fn get_version(&self) -> Result<String> {
        Ok(AuthorizationEngine::get_version(self).to_string())
    }
}

/// How often and how patiently [`RelationClient::connect`] polls the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

pub struct RelationClient {
    service: Arc<dyn RelationService>,
    version: String,
}

impl RelationClient {
    /// Call `get_version` until it answers or the policy gives up
    pub async fn connect(service: Arc<dyn RelationService>, policy: RetryPolicy) -> Result<Self> {
        let attempts = policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match service.get_version().await {
                Ok(version) => {
                    info!(%version, "Connected to relation service");
                    return Ok(Self { service, version });
                }
                Err(error) => {
                    warn!("Relation service not ready ({}/{}): {}", attempt, attempts, error);
                    last_error = Some(error);
                    if attempt < attempts {
                        tokio::time::sleep(policy.delay).await;
                    }
                }
            }
        }

        Err(RebacError::Transport(format!(
            "relation service unavailable after {} attempts: {}",
            attempts,
            last_error.map(|error| error.to_string()).unwrap_or_default()
        )))
    }

    /// Version reported by the service when the client connected
    pub fn version(&self) -> &str {
        &self.version
    }

    pub async fn create_relation(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        subject: SubjectRef,
    ) -> Result<()> {
        let tuple = RelationTuple::new(namespace, object, relation, subject);
        self.service
            .transact(&[RelationTupleDelta::insert(tuple)])
            .await
    }

    /// Remove one relation, returning how many tuples were deleted (0 or 1)
    pub async fn delete_relation(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        subject: SubjectRef,
    ) -> Result<usize> {
        let query = RelationQuery::new()
            .namespace(namespace)
            .object(object)
            .relation(relation)
            .subject(subject);
        self.service.delete_matching(&query).await
    }

    pub async fn check_object_permission(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        subject: SubjectRef,
    ) -> Result<bool> {
        let request = CheckRequest::new(namespace, object, relation, subject);
        Ok(self.service.check(&request).await?.allowed)
    }
}
