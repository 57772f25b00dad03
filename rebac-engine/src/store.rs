use crate::{
    error::Result,
    models::*,
    query::RelationQuery,
};
use ahash::{AHashMap, RandomState};
use async_trait::async_trait;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Storage interface for relation tuples
///
/// Every mutating call is atomic: the forward index
/// `(namespace, object, relation) -> subjects` and the reverse index
/// `(namespace, subject) -> (object, relation)` change together or not at all.
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Insert a tuple. Inserting a stored tuple is a no-op.
    async fn insert(&self, tuple: RelationTuple) -> Result<()>;

    /// Remove an exact tuple, returning whether it was stored
    async fn delete(&self, tuple: &RelationTuple) -> Result<bool>;

    /// Apply an ordered batch in one critical section, returning how many
    /// deltas changed the stored state
    async fn apply(&self, deltas: &[RelationTupleDelta]) -> Result<usize>;

    /// Remove every tuple matching the pattern, returning the count removed
    async fn delete_matching(&self, query: &RelationQuery) -> Result<usize>;

    /// Subjects stored directly on `(namespace, object, relation)`, ids first
    async fn lookup_direct(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
    ) -> Result<Vec<SubjectRef>>;

    /// `(object, relation)` pairs the subject holds directly within `namespace`
    async fn lookup_reverse(
        &self,
        namespace: &str,
        subject: &SubjectRef,
    ) -> Result<Vec<(String, String)>>;

    /// Tuples matching the pattern, sorted
    async fn read(&self, query: &RelationQuery) -> Result<Vec<RelationTuple>>;

    async fn contains(&self, tuple: &RelationTuple) -> Result<bool>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Monotonic counter bumped by every call that changed stored state
    fn revision(&self) -> u64;
}

pub const DEFAULT_SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    namespace: String,
    object: String,
    relation: String,
}

impl BucketKey {
    fn new(namespace: &str, object: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
        }
    }

    fn of(tuple: &RelationTuple) -> Self {
        Self::new(&tuple.namespace, &tuple.object, &tuple.relation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReverseKey {
    namespace: String,
    subject: SubjectRef,
}

impl ReverseKey {
    fn of(tuple: &RelationTuple) -> Self {
        Self {
            namespace: tuple.namespace.clone(),
            subject: tuple.subject.clone(),
        }
    }
}

type ForwardShard = AHashMap<BucketKey, BTreeSet<SubjectRef>>;
type ReverseShard = AHashMap<ReverseKey, BTreeSet<(String, String)>>;

/// Sharded in-memory tuple store
///
/// Both indices are split into the same number of lock-protected shards.
/// Calls touching several shards lock forward shards in ascending order and
/// then reverse shards in ascending order, so concurrent writers never
/// deadlock and readers never see one index ahead of the other.
pub struct MemoryTupleStore {
    forward: Box<[RwLock<ForwardShard>]>,
    reverse: Box<[RwLock<ReverseShard>]>,
    hasher: RandomState,
    revision: AtomicU64,
}

impl MemoryTupleStore {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            forward: (0..shard_count).map(|_| RwLock::new(ForwardShard::new())).collect(),
            reverse: (0..shard_count).map(|_| RwLock::new(ReverseShard::new())).collect(),
            hasher: RandomState::new(),
            revision: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.forward.len()
    }

    fn shard_of<K: Hash>(&self, key: &K) -> usize {
        let shards = self.forward.len() as u64;
        (self.hasher.hash_one(key) % shards) as usize
    }

    fn write_forward(&self, shards: &BTreeSet<usize>) -> BTreeMap<usize, RwLockWriteGuard<'_, ForwardShard>> {
        shards
            .iter()
            .filter_map(|&index| self.forward.get(index).map(|lock| (index, lock.write())))
            .collect()
    }

    fn write_reverse(&self, shards: &BTreeSet<usize>) -> BTreeMap<usize, RwLockWriteGuard<'_, ReverseShard>> {
        shards
            .iter()
            .filter_map(|&index| self.reverse.get(index).map(|lock| (index, lock.write())))
            .collect()
    }

    fn read_all_forward(&self) -> Vec<RwLockReadGuard<'_, ForwardShard>> {
        self.forward.iter().map(|lock| lock.read()).collect()
    }

    fn apply_batch(&self, deltas: &[RelationTupleDelta]) -> usize {
        let located: Vec<_> = deltas
            .iter()
            .map(|delta| {
                let bucket = BucketKey::of(&delta.tuple);
                let reverse_key = ReverseKey::of(&delta.tuple);
                let forward_shard = self.shard_of(&bucket);
                let reverse_shard = self.shard_of(&reverse_key);
                (forward_shard, reverse_shard, bucket, reverse_key, delta)
            })
            .collect();

        let forward_ids: BTreeSet<usize> = located.iter().map(|entry| entry.0).collect();
        let reverse_ids: BTreeSet<usize> = located.iter().map(|entry| entry.1).collect();
        let mut forward = self.write_forward(&forward_ids);
        let mut reverse = self.write_reverse(&reverse_ids);

        let mut changed = 0;
        for (forward_id, reverse_id, bucket, reverse_key, delta) in located {
            // Indices come from shard_of and are always locked above.
            let (Some(buckets), Some(targets)) =
                (forward.get_mut(&forward_id), reverse.get_mut(&reverse_id))
            else {
                continue;
            };

            let applied = match delta.action {
                DeltaAction::Insert => {
                    insert_locked(buckets, targets, bucket, reverse_key, &delta.tuple.subject)
                }
                DeltaAction::Delete => {
                    remove_locked(buckets, targets, &bucket, &reverse_key, &delta.tuple.subject)
                }
            };
            if applied {
                changed += 1;
            }
        }

        if changed > 0 {
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        changed
    }

    /// Whether both indices describe the same set of tuples
    #[cfg(test)]
    fn indices_consistent(&self) -> bool {
        let mut from_forward = BTreeSet::new();
        for shard in self.read_all_forward().iter() {
            for (bucket, subjects) in shard.iter() {
                for subject in subjects {
                    from_forward.insert((
                        bucket.namespace.clone(),
                        subject.clone(),
                        bucket.object.clone(),
                        bucket.relation.clone(),
                    ));
                }
            }
        }

        let mut from_reverse = BTreeSet::new();
        for lock in self.reverse.iter() {
            for (key, targets) in lock.read().iter() {
                if targets.is_empty() {
                    return false;
                }
                for (object, relation) in targets {
                    from_reverse.insert((
                        key.namespace.clone(),
                        key.subject.clone(),
                        object.clone(),
                        relation.clone(),
                    ));
                }
            }
        }

        from_forward == from_reverse
    }
}

impl Default for MemoryTupleStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_locked(
    forward: &mut ForwardShard,
    reverse: &mut ReverseShard,
    bucket: BucketKey,
    reverse_key: ReverseKey,
    subject: &SubjectRef,
) -> bool {
    let target = (bucket.object.clone(), bucket.relation.clone());
    let inserted = forward.entry(bucket).or_default().insert(subject.clone());
    if inserted {
        reverse.entry(reverse_key).or_default().insert(target);
    }
    inserted
}

fn remove_locked(
    forward: &mut ForwardShard,
    reverse: &mut ReverseShard,
    bucket: &BucketKey,
    reverse_key: &ReverseKey,
    subject: &SubjectRef,
) -> bool {
    let Some(subjects) = forward.get_mut(bucket) else {
        return false;
    };
    if !subjects.remove(subject) {
        return false;
    }
    if subjects.is_empty() {
        forward.remove(bucket);
    }

    if let Some(targets) = reverse.get_mut(reverse_key) {
        targets.remove(&(bucket.object.clone(), bucket.relation.clone()));
        if targets.is_empty() {
            reverse.remove(reverse_key);
        }
    }
    true
}

#[async_trait]
impl TupleStore for MemoryTupleStore {
    async fn insert(&self, tuple: RelationTuple) -> Result<()> {
        self.apply_batch(&[RelationTupleDelta::insert(tuple)]);
        Ok(())
    }

    async fn delete(&self, tuple: &RelationTuple) -> Result<bool> {
        let removed = self.apply_batch(&[RelationTupleDelta::delete(tuple.clone())]);
        Ok(removed > 0)
    }

    async fn apply(&self, deltas: &[RelationTupleDelta]) -> Result<usize> {
        Ok(self.apply_batch(deltas))
    }

    async fn delete_matching(&self, query: &RelationQuery) -> Result<usize> {
        let mut forward: Vec<_> = self.forward.iter().map(|lock| lock.write()).collect();
        let mut reverse: Vec<_> = self.reverse.iter().map(|lock| lock.write()).collect();

        let mut removed = Vec::new();
        for shard in forward.iter_mut() {
            shard.retain(|bucket, subjects| {
                if !query.matches_bucket(&bucket.namespace, &bucket.object, &bucket.relation) {
                    return true;
                }
                subjects.retain(|subject| {
                    let hit = query.matches_subject(subject);
                    if hit {
                        removed.push(RelationTuple {
                            namespace: bucket.namespace.clone(),
                            object: bucket.object.clone(),
                            relation: bucket.relation.clone(),
                            subject: subject.clone(),
                        });
                    }
                    !hit
                });
                !subjects.is_empty()
            });
        }

        for tuple in &removed {
            let reverse_key = ReverseKey::of(tuple);
            let index = self.shard_of(&reverse_key);
            let Some(shard) = reverse.get_mut(index) else {
                continue;
            };
            if let Some(targets) = shard.get_mut(&reverse_key) {
                targets.remove(&(tuple.object.clone(), tuple.relation.clone()));
                if targets.is_empty() {
                    shard.remove(&reverse_key);
                }
            }
        }

        if !removed.is_empty() {
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        debug!("Deleted {} tuples matching {}", removed.len(), query);
        Ok(removed.len())
    }

    async fn lookup_direct(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
    ) -> Result<Vec<SubjectRef>> {
        let bucket = BucketKey::new(namespace, object, relation);
        let Some(lock) = self.forward.get(self.shard_of(&bucket)) else {
            return Ok(Vec::new());
        };
        Ok(lock
            .read()
            .get(&bucket)
            .map(|subjects| subjects.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lookup_reverse(
        &self,
        namespace: &str,
        subject: &SubjectRef,
    ) -> Result<Vec<(String, String)>> {
        let key = ReverseKey {
            namespace: namespace.to_string(),
            subject: subject.clone(),
        };
        let Some(lock) = self.reverse.get(self.shard_of(&key)) else {
            return Ok(Vec::new());
        };
        Ok(lock
            .read()
            .get(&key)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn read(&self, query: &RelationQuery) -> Result<Vec<RelationTuple>> {
        let mut tuples = Vec::new();
        let mut collect = |bucket: &BucketKey, subjects: &BTreeSet<SubjectRef>| {
            for subject in subjects {
                if query.matches_subject(subject) {
                    tuples.push(RelationTuple {
                        namespace: bucket.namespace.clone(),
                        object: bucket.object.clone(),
                        relation: bucket.relation.clone(),
                        subject: subject.clone(),
                    });
                }
            }
        };

        if let Some((namespace, object, relation)) = query.bucket() {
            let bucket = BucketKey::new(namespace, object, relation);
            if let Some(lock) = self.forward.get(self.shard_of(&bucket)) {
                if let Some(subjects) = lock.read().get(&bucket) {
                    collect(&bucket, subjects);
                }
            }
        } else {
            for shard in self.read_all_forward().iter() {
                for (bucket, subjects) in shard.iter() {
                    if query.matches_bucket(&bucket.namespace, &bucket.object, &bucket.relation) {
                        collect(bucket, subjects);
                    }
                }
            }
        }

        tuples.sort();
        Ok(tuples)
    }

    async fn contains(&self, tuple: &RelationTuple) -> Result<bool> {
        let bucket = BucketKey::of(tuple);
        Ok(self
            .forward
            .get(self.shard_of(&bucket))
            .is_some_and(|lock| {
                lock.read()
                    .get(&bucket)
                    .is_some_and(|subjects| subjects.contains(&tuple.subject))
            }))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self
            .read_all_forward()
            .iter()
            .flat_map(|shard| shard.values())
            .map(BTreeSet::len)
            .sum())
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tuple(text: &str) -> RelationTuple {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = MemoryTupleStore::new();
        let grant = tuple("document:doc1#view@alice");

        store.insert(grant.clone()).await.unwrap();
        assert!(store.contains(&grant).await.unwrap());

        let subjects = store.lookup_direct("document", "doc1", "view").await.unwrap();
        assert_eq!(subjects, vec![SubjectRef::id("alice")]);

        let targets = store
            .lookup_reverse("document", &SubjectRef::id("alice"))
            .await
            .unwrap();
        assert_eq!(targets, vec![("doc1".to_string(), "view".to_string())]);

        assert!(store.delete(&grant).await.unwrap());
        assert!(!store.contains(&grant).await.unwrap());
        assert!(store
            .lookup_reverse("document", &SubjectRef::id("alice"))
            .await
            .unwrap()
            .is_empty());
        assert!(store.indices_consistent());
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryTupleStore::new();
        let grant = tuple("role:admin#member@alice");

        store.insert(grant.clone()).await.unwrap();
        let revision = store.revision();
        store.insert(grant.clone()).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.revision(), revision);
    }

    #[tokio::test]
    async fn test_delete_missing_reports_false() {
        let store = MemoryTupleStore::new();
        assert!(!store.delete(&tuple("role:admin#member@alice")).await.unwrap());
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn test_apply_respects_order() {
        let store = MemoryTupleStore::with_shards(4);
        let grant = tuple("document:d1#admin@role:admin#member");

        let changed = store
            .apply(&[
                RelationTupleDelta::insert(grant.clone()),
                RelationTupleDelta::delete(grant.clone()),
                RelationTupleDelta::insert(tuple("role:admin#member@alice")),
            ])
            .await
            .unwrap();

        assert_eq!(changed, 3);
        assert!(!store.contains(&grant).await.unwrap());
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.indices_consistent());
    }

    #[tokio::test]
    async fn test_delete_matching_subject_wildcard() {
        let store = MemoryTupleStore::new();
        for text in [
            "document:d1#admin@alice",
            "document:d1#admin@role:admin#member",
            "document:d1#view@bob",
            "document:d2#admin@carol",
        ] {
            store.insert(tuple(text)).await.unwrap();
        }

        let query = RelationQuery::new()
            .namespace("document")
            .object("d1")
            .relation("admin");
        assert_eq!(store.delete_matching(&query).await.unwrap(), 2);
        assert_eq!(store.len().await.unwrap(), 2);
        assert!(store
            .lookup_reverse("document", &SubjectRef::set("role", "admin", "member"))
            .await
            .unwrap()
            .is_empty());
        assert!(store.indices_consistent());
    }

    #[tokio::test]
    async fn test_delete_matching_subject_set_is_exact() {
        let store = MemoryTupleStore::new();
        store.insert(tuple("document:d1#admin@role:admin#member")).await.unwrap();
        store.insert(tuple("document:d1#admin@role:admin#owner")).await.unwrap();

        let query = RelationQuery::new().subject(SubjectRef::set("role", "admin", "member"));
        assert_eq!(store.delete_matching(&query).await.unwrap(), 1);
        assert!(store
            .contains(&tuple("document:d1#admin@role:admin#owner"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_read_with_pattern() {
        let store = MemoryTupleStore::new();
        for text in [
            "document:d1#admin@alice",
            "document:d2#admin@alice",
            "role:admin#member@alice",
        ] {
            store.insert(tuple(text)).await.unwrap();
        }

        let by_subject = RelationQuery::new()
            .namespace("document")
            .subject(SubjectRef::id("alice"));
        let tuples = store.read(&by_subject).await.unwrap();
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0].object, "d1");

        let exact = RelationQuery::exact(&tuple("role:admin#member@alice"));
        assert_eq!(store.read(&exact).await.unwrap().len(), 1);
    }

    fn arb_delta() -> impl Strategy<Value = RelationTupleDelta> {
        let subject = prop_oneof![
            "[a-c]".prop_map(|id| SubjectRef::id(&id)),
            ("[a-b]", "[a-b]").prop_map(|(object, relation)| SubjectRef::set("group", &object, &relation)),
        ];
        (any::<bool>(), "[a-b]", "[a-b]", "[a-b]", subject).prop_map(
            |(insert, namespace, object, relation, subject)| {
                let tuple = RelationTuple::new(&namespace, &object, &relation, subject);
                if insert {
                    RelationTupleDelta::insert(tuple)
                } else {
                    RelationTupleDelta::delete(tuple)
                }
            },
        )
    }

    fn arb_query() -> impl Strategy<Value = RelationQuery> {
        (
            prop::option::of("[a-b]"),
            prop::option::of("[a-b]"),
            prop::option::of("[a-b]"),
            prop::option::of(prop_oneof![
                "[a-c]".prop_map(|id| SubjectRef::id(&id)),
                ("[a-b]", "[a-b]").prop_map(|(object, relation)| SubjectRef::set("group", &object, &relation)),
            ]),
        )
            .prop_map(|(namespace, object, relation, subject)| RelationQuery {
                namespace,
                object,
                relation,
                subject,
            })
    }

    proptest! {
        #[test]
        fn prop_read_and_delete_agree_with_pattern_match(
            deltas in prop::collection::vec(arb_delta(), 1..20),
            query in arb_query(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let store = MemoryTupleStore::with_shards(3);
            let (read, expected, removed) = runtime.block_on(async {
                store.apply(&deltas).await.unwrap();
                let everything = store.read(&RelationQuery::new()).await.unwrap();
                let expected: Vec<_> = everything.into_iter().filter(|tuple| query.matches(tuple)).collect();
                let read = store.read(&query).await.unwrap();
                let removed = store.delete_matching(&query).await.unwrap();
                (read, expected, removed)
            });
            prop_assert_eq!(removed, expected.len());
            prop_assert_eq!(read, expected);
            prop_assert!(store.indices_consistent());
        }

        #[test]
        fn prop_indices_stay_consistent(batches in prop::collection::vec(prop::collection::vec(arb_delta(), 1..6), 1..10)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let store = MemoryTupleStore::with_shards(3);
            runtime.block_on(async {
                for batch in &batches {
                    store.apply(batch).await.unwrap();
                }
                store.delete_matching(&RelationQuery::new().relation("a")).await.unwrap();
            });
            prop_assert!(store.indices_consistent());
        }
    }
}
