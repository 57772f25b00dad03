use crate::{
    error::{RebacError, Result},
    models::*,
    namespace::NamespaceConfig,
    store::TupleStore,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Validates write batches and applies them to the store as one unit
pub struct WriteCoordinator {
    store: Arc<dyn TupleStore>,
    namespaces: Arc<NamespaceConfig>,
    reject_unknown_namespaces: bool,
}

impl WriteCoordinator {
    pub fn new(store: Arc<dyn TupleStore>, namespaces: Arc<NamespaceConfig>) -> Self {
        Self {
            store,
            namespaces,
            reject_unknown_namespaces: false,
        }
    }

    /// Refuse tuples whose namespace has no configuration
    pub fn with_strict_namespaces(mut self, enabled: bool) -> Self {
        self.reject_unknown_namespaces = enabled;
        self
    }

    /// Validate a single tuple
    pub fn validate(&self, tuple: &RelationTuple) -> Result<()> {
        tuple.validate()?;

        if tuple.is_self_referencing() {
            return Err(RebacError::validation(format!(
                "subject set of {} refers to its own relation",
                tuple
            )));
        }

        if self.reject_unknown_namespaces && !self.namespaces.has_namespace(&tuple.namespace) {
            return Err(RebacError::validation(format!(
                "namespace '{}' is not configured",
                tuple.namespace
            )));
        }

        Ok(())
    }

    /// Apply `deltas` in order, all or nothing
    ///
    /// Every delta is validated before the store is touched; deleting a tuple
    /// that is not stored is a no-op.
    pub async fn transact(&self, deltas: &[RelationTupleDelta]) -> Result<()> {
        self.validate_batch(deltas)?;
        self.commit(deltas).await
    }

    pub fn validate_batch(&self, deltas: &[RelationTupleDelta]) -> Result<()> {
        deltas.iter().try_for_each(|delta| self.validate(&delta.tuple))
    }

    /// Apply an already validated batch
    pub(crate) async fn commit(&self, deltas: &[RelationTupleDelta]) -> Result<()> {
        for delta in deltas {
            debug!("{:?} {}", delta.action, delta.tuple);
        }

        let changed = self.store.apply(deltas).await?;
        info!(
            deltas = deltas.len(),
            changed,
            "Applied write batch"
        );
        Ok(())
    }

    /// Delete one tuple, failing with `NotFound` if it is not stored
    pub async fn delete_exact(&self, tuple: &RelationTuple) -> Result<()> {
        self.validate(tuple)?;

        if self.store.delete(tuple).await? {
            info!("Deleted tuple: {}", tuple);
            Ok(())
        } else {
            Err(RebacError::NotFound(tuple.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTupleStore;

    fn tuple(text: &str) -> RelationTuple {
        text.parse().unwrap()
    }

    fn coordinator() -> (Arc<MemoryTupleStore>, WriteCoordinator) {
        let store = Arc::new(MemoryTupleStore::new());
        let writer = WriteCoordinator::new(store.clone(), Arc::new(NamespaceConfig::document_roles()));
        (store, writer)
    }

    #[tokio::test]
    async fn test_transact_applies_in_order() {
        let (store, writer) = coordinator();

        writer
            .transact(&[
                RelationTupleDelta::insert(tuple("document:d1#view@alice")),
                RelationTupleDelta::delete(tuple("document:d1#view@alice")),
                RelationTupleDelta::insert(tuple("document:d1#view@bob")),
            ])
            .await
            .unwrap();

        assert!(!store.contains(&tuple("document:d1#view@alice")).await.unwrap());
        assert!(store.contains(&tuple("document:d1#view@bob")).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_delta_rejects_whole_batch() {
        let (store, writer) = coordinator();

        let result = writer
            .transact(&[
                RelationTupleDelta::insert(tuple("document:d1#view@alice")),
                RelationTupleDelta::insert(RelationTuple::new("", "d1", "view", SubjectRef::id("bob"))),
            ])
            .await;

        assert!(matches!(result, Err(RebacError::Validation(_))));
        assert!(store.is_empty().await.unwrap());
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn test_self_referencing_set_rejected() {
        let (store, writer) = coordinator();

        let result = writer
            .transact(&[RelationTupleDelta::insert(tuple("group:eng#member@group:eng#member"))])
            .await;

        assert!(matches!(result, Err(RebacError::Validation(_))));
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_subject_fields_rejected() {
        let (_, writer) = coordinator();

        let empty_id = RelationTuple::new("document", "d1", "view", SubjectRef::id(""));
        assert!(writer.validate(&empty_id).is_err());

        let empty_set = RelationTuple::new("document", "d1", "view", SubjectRef::set("group", "", "member"));
        assert!(writer.validate(&empty_set).is_err());
    }

    #[tokio::test]
    async fn test_delimiters_in_names_rejected() {
        let (store, writer) = coordinator();

        let result = writer
            .transact(&[
                RelationTupleDelta::insert(tuple("document:d1#view@alice")),
                RelationTupleDelta::insert(RelationTuple::new(
                    "document",
                    "d1",
                    "view",
                    SubjectRef::set("group", "a#b", "member"),
                )),
            ])
            .await;

        assert!(matches!(result, Err(RebacError::Validation(_))));
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_absent_tuple_in_batch_is_noop() {
        let (store, writer) = coordinator();

        writer
            .transact(&[RelationTupleDelta::delete(tuple("document:d1#view@ghost"))])
            .await
            .unwrap();
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_strict_namespaces() {
        let store = Arc::new(MemoryTupleStore::new());
        let writer = WriteCoordinator::new(store, Arc::new(NamespaceConfig::document_roles()))
            .with_strict_namespaces(true);

        assert!(writer.validate(&tuple("document:d1#view@alice")).is_ok());
        assert!(matches!(
            writer.validate(&tuple("folder:f1#view@alice")),
            Err(RebacError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_exact() {
        let (_, writer) = coordinator();
        let granted = tuple("document:d1#view@alice");

        writer.transact(&[RelationTupleDelta::insert(granted.clone())]).await.unwrap();
        writer.delete_exact(&granted).await.unwrap();

        assert!(matches!(
            writer.delete_exact(&granted).await,
            Err(RebacError::NotFound(_))
        ));
    }
}
