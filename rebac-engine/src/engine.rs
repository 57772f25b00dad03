use crate::{
    check::{PermissionChecker, DEFAULT_MAX_DEPTH},
    error::{RebacError, Result},
    expand::{ExpandTree, SubjectExpander},
    models::*,
    namespace::NamespaceConfig,
    query::RelationQuery,
    settings::EngineSettings,
    store::{MemoryTupleStore, TupleStore},
    write::WriteCoordinator,
};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Cached check answers kept before the cache is cleared wholesale
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Unguarded evaluations tried before a read falls back to the shared gate
const OPTIMISTIC_ATTEMPTS: usize = 3;

/// Relationship-based authorization engine
///
/// Checks and expansions run without locks and are accepted only when the
/// store revision is the same before and after evaluation, so a slow check
/// never holds up writers or unrelated checks. A read that keeps losing to
/// writers retries under the shared commit gate, which writes hold
/// exclusively while they apply. Listings are single atomic store reads.
pub struct AuthorizationEngine {
    /// Storage for relation tuples
    store: Arc<dyn TupleStore>,

    /// Rewrite rules per namespace
    namespaces: Arc<NamespaceConfig>,

    checker: PermissionChecker,
    writer: WriteCoordinator,
    expander: SubjectExpander,

    commit_gate: RwLock<()>,

    /// Cache for permission checks (optional), tagged with the store revision
    cache: Option<DashMap<CheckRequest, (u64, bool)>>,
    cache_capacity: usize,

    max_depth: u32,
    check_timeout: Option<Duration>,
}

impl AuthorizationEngine {
    /// Create an engine over caller-owned store and namespace handles
    pub fn new(store: Arc<dyn TupleStore>, namespaces: Arc<NamespaceConfig>) -> Self {
        Self {
            checker: PermissionChecker::new(store.clone(), namespaces.clone()),
            writer: WriteCoordinator::new(store.clone(), namespaces.clone()),
            expander: SubjectExpander::new(store.clone(), namespaces.clone()),
            store,
            namespaces,
            commit_gate: RwLock::new(()),
            cache: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_depth: DEFAULT_MAX_DEPTH,
            check_timeout: None,
        }
    }

    /// Build an in-memory engine from loaded settings
    pub fn from_settings(settings: &EngineSettings, namespaces: NamespaceConfig) -> Result<Self> {
        settings.validate()?;

        let store = Arc::new(MemoryTupleStore::with_shards(settings.shard_count));
        let mut engine = Self::new(store, Arc::new(namespaces))
            .with_max_depth(settings.max_depth)
            .with_check_timeout(settings.check_timeout())
            .with_strict_namespaces(settings.reject_unknown_namespaces);
        if settings.cache_enabled {
            engine = engine.with_cache_capacity(settings.cache_capacity);
        }

        info!(
            max_depth = settings.max_depth,
            shards = settings.shard_count,
            cache = settings.cache_enabled,
            "Authorization engine ready"
        );
        Ok(engine)
    }

    /// Enable caching for permission checks
    pub fn with_cache(self) -> Self {
        self.with_cache_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Enable caching, clearing the cache once it holds `capacity` answers
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = Some(DashMap::new());
        self.cache_capacity = capacity.max(1);
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Fail checks running longer than `timeout` with `DeadlineExceeded`
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = Some(timeout);
        self
    }

    pub fn with_strict_namespaces(mut self, enabled: bool) -> Self {
        self.writer = WriteCoordinator::new(self.store.clone(), self.namespaces.clone())
            .with_strict_namespaces(enabled);
        self
    }

    pub fn namespaces(&self) -> Arc<NamespaceConfig> {
        self.namespaces.clone()
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check if `subject` holds `relation` on `namespace:object`
    pub async fn check(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        subject: &SubjectRef,
    ) -> Result<bool> {
        self.check_request(&CheckRequest::new(namespace, object, relation, subject.clone()))
            .await
    }

    pub async fn check_request(&self, request: &CheckRequest) -> Result<bool> {
        request.validate()?;

        if let Some(allowed) = self.cached(request) {
            debug!("Cache hit for permission check: {}", request);
            return Ok(allowed);
        }

        let checker = &self.checker;
        let max_depth = self.max_depth;
        let evaluation = self.read_consistent(move || {
            checker.check(
                &request.namespace,
                &request.object,
                &request.relation,
                &request.subject,
                max_depth,
            )
        });
        let (revision, allowed) = match self.check_timeout {
            Some(limit) => tokio::time::timeout(limit, evaluation)
                .await
                .map_err(|_| {
                    RebacError::DeadlineExceeded(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
                })??,
            None => evaluation.await?,
        };
        debug!("Check {} -> {} at revision {}", request, allowed, revision);

        self.remember(request, revision, allowed);
        Ok(allowed)
    }

    /// Batch check multiple permissions at once
    pub async fn batch_check(&self, requests: &[CheckRequest]) -> Result<Vec<CheckResponse>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let allowed = self.check_request(request).await?;
            responses.push(CheckResponse { allowed });
        }
        Ok(responses)
    }

    // =============================================================================
    // Tuple Management
    // =============================================================================

    /// Apply a batch of inserts and deletes atomically
    pub async fn transact(&self, deltas: &[RelationTupleDelta]) -> Result<()> {
        self.writer.validate_batch(deltas)?;

        let _commit = self.commit_gate.write().await;
        self.writer.commit(deltas).await?;
        self.invalidate_cache();
        Ok(())
    }

    /// Write a single relation tuple
    pub async fn write_tuple(&self, tuple: RelationTuple) -> Result<()> {
        self.transact(&[RelationTupleDelta::insert(tuple)]).await
    }

    /// Delete every tuple matching `query`, returning how many were removed
    pub async fn delete_matching(&self, query: &RelationQuery) -> Result<usize> {
        query.validate()?;

        let _commit = self.commit_gate.write().await;
        let removed = self.store.delete_matching(query).await?;
        self.invalidate_cache();

        info!("Deleted {} tuples matching {}", removed, query);
        Ok(removed)
    }

    /// Delete exactly one tuple; `NotFound` when it is not stored
    pub async fn delete_exact(&self, tuple: &RelationTuple) -> Result<()> {
        let _commit = self.commit_gate.write().await;
        self.writer.delete_exact(tuple).await?;
        self.invalidate_cache();
        Ok(())
    }

    /// Read tuples matching a pattern, sorted
    pub async fn list(&self, query: &RelationQuery) -> Result<Vec<RelationTuple>> {
        query.validate()?;
        self.store.read(query).await
    }

    /// Tuples in `namespace` whose subject is exactly `subject`
    pub async fn list_objects(&self, namespace: &str, subject: &SubjectRef) -> Result<Vec<RelationTuple>> {
        let targets = self.store.lookup_reverse(namespace, subject).await?;

        Ok(targets
            .into_iter()
            .map(|(object, relation)| RelationTuple::new(namespace, &object, &relation, subject.clone()))
            .collect())
    }

    // =============================================================================
    // Permission Expansion
    // =============================================================================

    /// Expand all subjects that have `relation` on `namespace:object`
    pub async fn expand(&self, namespace: &str, object: &str, relation: &str) -> Result<ExpandTree> {
        let expander = &self.expander;
        let max_depth = self.max_depth;
        let (_, tree) = self
            .read_consistent(move || expander.expand(namespace, object, relation, max_depth))
            .await?;
        Ok(tree)
    }

    /// Crate version string
    pub fn get_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Store revision, bumped on every state-changing write
    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    /// Run `evaluate` against a single committed state of the store
    ///
    /// Returns the revision the result was computed at.
    async fn read_consistent<T, F, Fut>(&self, mut evaluate: F) -> Result<(u64, T)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 1..=OPTIMISTIC_ATTEMPTS {
            let before = self.store.revision();
            let value = evaluate().await?;
            let after = self.store.revision();
            if before == after {
                return Ok((before, value));
            }
            debug!(attempt, before, after, "Store changed during read, retrying");
        }

        let _snapshot = self.commit_gate.read().await;
        let revision = self.store.revision();
        let value = evaluate().await?;
        Ok((revision, value))
    }

    fn cached(&self, request: &CheckRequest) -> Option<bool> {
        let cache = self.cache.as_ref()?;
        let entry = cache.get(request)?;
        let (revision, allowed) = *entry;
        (revision == self.store.revision()).then_some(allowed)
    }

    fn remember(&self, request: &CheckRequest, revision: u64, allowed: bool) {
        let Some(cache) = &self.cache else {
            return;
        };
        if revision != self.store.revision() {
            return;
        }
        if cache.len() >= self.cache_capacity && !cache.contains_key(request) {
            debug!(entries = cache.len(), "Check cache full, clearing");
            cache.clear();
        }
        cache.insert(request.clone(), (revision, allowed));
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(text: &str) -> RelationTuple {
        text.parse().unwrap()
    }

    fn engine() -> AuthorizationEngine {
        AuthorizationEngine::new(
            Arc::new(MemoryTupleStore::new()),
            Arc::new(NamespaceConfig::document_roles()),
        )
    }

    #[tokio::test]
    async fn test_write_then_check() {
        let engine = engine();
        let alice = SubjectRef::id("alice");

        engine.write_tuple(tuple("document:doc1#edit@alice")).await.unwrap();

        assert!(engine.check("document", "doc1", "view", &alice).await.unwrap());
        assert!(!engine.check("document", "doc1", "admin", &alice).await.unwrap());
        assert_eq!(engine.revision(), 1);
    }

    #[tokio::test]
    async fn test_cache_invalidated_by_writes() {
        let engine = engine().with_cache();
        let bob = SubjectRef::id("bob");
        let granted = tuple("document:doc1#view@bob");

        assert!(!engine.check("document", "doc1", "view", &bob).await.unwrap());
        engine.write_tuple(granted.clone()).await.unwrap();
        assert!(engine.check("document", "doc1", "view", &bob).await.unwrap());

        engine.delete_exact(&granted).await.unwrap();
        assert!(!engine.check("document", "doc1", "view", &bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_cached_answer_from_older_revision_is_ignored() {
        let store = Arc::new(MemoryTupleStore::new());
        let engine = AuthorizationEngine::new(store.clone(), Arc::new(NamespaceConfig::document_roles()))
            .with_cache();
        let bob = SubjectRef::id("bob");

        assert!(!engine.check("document", "doc1", "view", &bob).await.unwrap());

        // Written behind the engine's back, so nothing clears the cache
        store.insert(tuple("document:doc1#view@bob")).await.unwrap();
        assert!(engine.check("document", "doc1", "view", &bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_capacity_bounds_entries() {
        let engine = engine().with_cache_capacity(2);
        engine.write_tuple(tuple("document:doc1#view@alice")).await.unwrap();

        for user in ["alice", "bob", "carol", "dave", "erin"] {
            engine.check("document", "doc1", "view", &SubjectRef::id(user)).await.unwrap();
            assert!(engine.cache.as_ref().unwrap().len() <= 2);
        }
        assert!(engine.check("document", "doc1", "view", &SubjectRef::id("alice")).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_check() {
        let engine = engine();
        engine.write_tuple(tuple("document:doc1#admin@alice")).await.unwrap();

        let responses = engine
            .batch_check(&[
                CheckRequest::from(tuple("document:doc1#edit@alice")),
                CheckRequest::from(tuple("document:doc1#edit@bob")),
            ])
            .await
            .unwrap();

        assert_eq!(
            responses,
            vec![CheckResponse { allowed: true }, CheckResponse { allowed: false }]
        );
    }

    #[tokio::test]
    async fn test_invalid_check_request() {
        let engine = engine();
        let result = engine.check("", "doc1", "view", &SubjectRef::id("alice")).await;
        assert!(matches!(result, Err(RebacError::Validation(_))));

        let result = engine.check("document", "doc#1", "view", &SubjectRef::id("alice")).await;
        assert!(matches!(result, Err(RebacError::Validation(_))));
    }

    #[tokio::test]
    async fn test_list_and_list_objects() {
        let engine = engine();
        engine
            .transact(&RelationTupleDelta::from_tuples(
                [
                    tuple("document:doc1#view@alice"),
                    tuple("document:doc2#edit@alice"),
                    tuple("document:doc2#view@bob"),
                ],
                DeltaAction::Insert,
            ))
            .await
            .unwrap();

        let listed = engine
            .list(&RelationQuery::new().namespace("document").object("doc2"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);

        let mut objects = engine
            .list_objects("document", &SubjectRef::id("alice"))
            .await
            .unwrap();
        objects.sort();
        assert_eq!(
            objects,
            vec![tuple("document:doc1#view@alice"), tuple("document:doc2#edit@alice")]
        );

        assert!(engine.list(&RelationQuery::new().object("")).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_matching() {
        let engine = engine();
        engine.write_tuple(tuple("document:doc1#view@alice")).await.unwrap();
        engine.write_tuple(tuple("document:doc2#view@alice")).await.unwrap();
        engine.write_tuple(tuple("document:doc2#view@bob")).await.unwrap();

        let removed = engine
            .delete_matching(&RelationQuery::new().subject(SubjectRef::id("alice")))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(engine.list(&RelationQuery::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expand() {
        let engine = engine();
        engine.write_tuple(tuple("role:admin#member@alice")).await.unwrap();
        engine
            .write_tuple(tuple("document:doc1#admin@role:admin#member"))
            .await
            .unwrap();

        let tree = engine.expand("document", "doc1", "view").await.unwrap();
        assert_eq!(tree.subjects(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_from_settings() {
        let settings = EngineSettings {
            cache_enabled: true,
            reject_unknown_namespaces: true,
            ..EngineSettings::default()
        };
        let engine = AuthorizationEngine::from_settings(&settings, NamespaceConfig::document_roles()).unwrap();

        assert!(engine.write_tuple(tuple("folder:f1#view@alice")).await.is_err());
        assert!(engine.write_tuple(tuple("document:d1#view@alice")).await.is_ok());
        assert_eq!(engine.get_version(), env!("CARGO_PKG_VERSION"));

        let invalid = EngineSettings {
            max_depth: 0,
            ..EngineSettings::default()
        };
        assert!(AuthorizationEngine::from_settings(&invalid, NamespaceConfig::empty()).is_err());
    }
}
