use crate::{
    error::Result,
    models::*,
    namespace::{NamespaceConfig, RewriteExpr},
    store::TupleStore,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Who holds a relation, as a tree of subject sets down to concrete subjects
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpandTree {
    /// A concrete subject id
    Leaf { subject: String },
    /// A visited `(namespace, object, relation)`
    Node {
        set: SubjectSet,
        children: Vec<ExpandTree>,
    },
    /// A subject set reached with no depth budget left
    Truncated { set: SubjectSet },
}

impl ExpandTree {
    /// Sorted, deduplicated concrete subject ids reachable in this tree
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects = BTreeSet::new();
        self.collect_subjects(&mut subjects);
        subjects.into_iter().collect()
    }

    fn collect_subjects(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Leaf { subject } => {
                out.insert(subject.clone());
            }
            Self::Node { children, .. } => {
                for child in children {
                    child.collect_subjects(out);
                }
            }
            Self::Truncated { .. } => {}
        }
    }

    /// Whether the depth budget cut off any branch
    pub fn is_truncated(&self) -> bool {
        match self {
            Self::Leaf { .. } => false,
            Self::Node { children, .. } => children.iter().any(Self::is_truncated),
            Self::Truncated { .. } => true,
        }
    }
}

type NodeFuture<'a> = Pin<Box<dyn Future<Output = Result<ExpandTree>> + Send + 'a>>;
type ChildrenFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<ExpandTree>>> + Send + 'a>>;

/// Subject expander finds all subjects with a given relation to an object
pub struct SubjectExpander {
    store: Arc<dyn TupleStore>,
    namespaces: Arc<NamespaceConfig>,
}

impl SubjectExpander {
    pub fn new(store: Arc<dyn TupleStore>, namespaces: Arc<NamespaceConfig>) -> Self {
        Self { store, namespaces }
    }

    /// Expand all subjects that have `relation` on `namespace:object`
    pub async fn expand(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        depth: u32,
    ) -> Result<ExpandTree> {
        self.expand_node(SubjectSet::new(namespace, object, relation), depth)
            .await
    }

    /// List all concrete subjects (flattened) with `relation` on `namespace:object`
    pub async fn list_subjects(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        depth: u32,
    ) -> Result<Vec<String>> {
        let tree = self.expand(namespace, object, relation, depth).await?;
        Ok(tree.subjects())
    }

    fn expand_node(&self, set: SubjectSet, depth: u32) -> NodeFuture<'_> {
        Box::pin(async move {
            if depth == 0 {
                debug!("Expansion truncated at {}", set);
                return Ok(ExpandTree::Truncated { set });
            }

            debug!("Expanding: {} (depth {})", set, depth);
            let rewrite = self.namespaces.expand(&set.namespace, &set.relation);
            let children = self.expand_rewrite(&rewrite, &set, depth).await?;
            Ok(ExpandTree::Node { set, children })
        })
    }

    fn expand_rewrite<'a>(
        &'a self,
        rewrite: &'a RewriteExpr,
        set: &'a SubjectSet,
        depth: u32,
    ) -> ChildrenFuture<'a> {
        Box::pin(async move {
            match rewrite {
                RewriteExpr::This => {
                    let subjects = self
                        .store
                        .lookup_direct(&set.namespace, &set.object, &set.relation)
                        .await?;

                    let mut children = Vec::with_capacity(subjects.len());
                    for subject in subjects {
                        match subject {
                            SubjectRef::Id { id } => children.push(ExpandTree::Leaf { subject: id }),
                            SubjectRef::Set(nested) => {
                                tokio::task::yield_now().await;
                                children.push(self.expand_node(nested, depth.saturating_sub(1)).await?);
                            }
                        }
                    }
                    Ok(children)
                }
                RewriteExpr::ComputedRelation(target) => {
                    let computed = SubjectSet::new(&set.namespace, &set.object, target);
                    Ok(vec![self.expand_node(computed, depth).await?])
                }
                RewriteExpr::Union(branches) => {
                    let mut children = Vec::new();
                    for branch in branches {
                        children.extend(self.expand_rewrite(branch, set, depth).await?);
                    }
                    Ok(children)
                }
            }
        })
    }
}
