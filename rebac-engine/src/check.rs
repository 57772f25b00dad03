use crate::{
    error::Result,
    models::*,
    namespace::{NamespaceConfig, RewriteExpr},
    store::TupleStore,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Depth budget applied when the caller does not choose one
pub const DEFAULT_MAX_DEPTH: u32 = 5;

/// Outcome of resolving one permission question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Allowed,
    Denied,
    /// Some branch ran out of depth budget before reaching a decision
    DepthExhausted,
}

impl Resolution {
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }

    /// Merge two non-granting outcomes; exhaustion is sticky
    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Allowed, _) | (_, Self::Allowed) => Self::Allowed,
            (Self::DepthExhausted, _) | (_, Self::DepthExhausted) => Self::DepthExhausted,
            _ => Self::Denied,
        }
    }
}

type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<Resolution>> + Send + 'a>>;

/// Permission checker resolving relations through:
/// - directly stored tuples
/// - subject sets (e.g. "members of role:admin")
/// - namespace rewrite rules (e.g. "admins are editors")
///
/// Recursion is bounded by an integer depth budget that shrinks by one on
/// every subject-set expansion. Union branching does not consume budget since
/// rewrite rules are statically acyclic.
pub struct PermissionChecker {
    store: Arc<dyn TupleStore>,
    namespaces: Arc<NamespaceConfig>,
}

impl PermissionChecker {
    pub fn new(store: Arc<dyn TupleStore>, namespaces: Arc<NamespaceConfig>) -> Self {
        Self { store, namespaces }
    }

    /// Check if `subject` holds `relation` on `namespace:object`
    ///
    /// Running out of depth budget denies access instead of failing.
    pub async fn check(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        subject: &SubjectRef,
        depth_budget: u32,
    ) -> Result<bool> {
        let resolution = self
            .resolve(namespace, object, relation, subject, depth_budget)
            .await?;

        if resolution == Resolution::DepthExhausted {
            warn!(
                depth_budget,
                "Depth budget exhausted checking {}:{}#{}@{}, denying",
                namespace,
                object,
                relation,
                subject
            );
        }
        Ok(resolution.is_allowed())
    }

    /// Resolve a relation on an object, applying its rewrite rule
    pub fn resolve<'a>(
        &'a self,
        namespace: &'a str,
        object: &'a str,
        relation: &'a str,
        subject: &'a SubjectRef,
        depth_budget: u32,
    ) -> ResolveFuture<'a> {
        Box::pin(async move {
            if depth_budget == 0 {
                return Ok(Resolution::DepthExhausted);
            }

            debug!("Checking: {}:{}#{}@{} (budget {})", namespace, object, relation, subject, depth_budget);

            match self.namespaces.rewrite_for(namespace, relation) {
                Some(rewrite) => {
                    self.resolve_rewrite(rewrite, namespace, object, relation, subject, depth_budget)
                        .await
                }
                None => {
                    self.resolve_direct(namespace, object, relation, subject, depth_budget)
                        .await
                }
            }
        })
    }

    fn resolve_rewrite<'a>(
        &'a self,
        rewrite: &'a RewriteExpr,
        namespace: &'a str,
        object: &'a str,
        relation: &'a str,
        subject: &'a SubjectRef,
        depth_budget: u32,
    ) -> ResolveFuture<'a> {
        Box::pin(async move {
            match rewrite {
                RewriteExpr::This => {
                    self.resolve_direct(namespace, object, relation, subject, depth_budget)
                        .await
                }
                RewriteExpr::ComputedRelation(target) => {
                    self.resolve(namespace, object, target, subject, depth_budget)
                        .await
                }
                RewriteExpr::Union(children) => {
                    let mut outcome = Resolution::Denied;
                    for child in children {
                        let branch = self
                            .resolve_rewrite(child, namespace, object, relation, subject, depth_budget)
                            .await?;
                        if branch.is_allowed() {
                            return Ok(Resolution::Allowed);
                        }
                        outcome = outcome.merge(branch);
                    }
                    Ok(outcome)
                }
            }
        })
    }

    async fn resolve_direct(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        subject: &SubjectRef,
        depth_budget: u32,
    ) -> Result<Resolution> {
        let subjects = self.store.lookup_direct(namespace, object, relation).await?;

        if subjects.contains(subject) {
            debug!("Direct tuple found: {}:{}#{}@{}", namespace, object, relation, subject);
            return Ok(Resolution::Allowed);
        }

        let mut outcome = Resolution::Denied;
        for entry in &subjects {
            let SubjectRef::Set(set) = entry else {
                continue;
            };

            // Expansion is where a pathological graph spends its time, so give
            // the runtime a chance to cancel us here.
            tokio::task::yield_now().await;

            let branch = self
                .resolve(
                    &set.namespace,
                    &set.object,
                    &set.relation,
                    subject,
                    depth_budget.saturating_sub(1),
                )
                .await?;
            if branch.is_allowed() {
                return Ok(Resolution::Allowed);
            }
            outcome = outcome.merge(branch);
        }

        Ok(outcome)
    }
}
