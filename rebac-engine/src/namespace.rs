use crate::error::{RebacError, Result};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::HashMap;

/// How a relation is computed from stored tuples and sibling relations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteExpr {
    /// Only tuples stored for this relation count
    This,
    /// Subjects holding another relation on the same object
    ComputedRelation(String),
    /// Satisfied when any child is satisfied on the same object
    Union(Vec<RewriteExpr>),
}

impl RewriteExpr {
    pub fn computed(relation: &str) -> Self {
        Self::ComputedRelation(relation.to_string())
    }

    pub fn union(children: impl IntoIterator<Item = RewriteExpr>) -> Self {
        Self::Union(children.into_iter().collect())
    }

    /// `Union(This, <relations>...)`, the common "inherits from" shape
    pub fn this_or(relations: &[&str]) -> Self {
        Self::union(
            std::iter::once(Self::This).chain(relations.iter().map(|relation| Self::computed(relation))),
        )
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::This => {}
            Self::ComputedRelation(relation) => out.push(relation),
            Self::Union(children) => {
                for child in children {
                    child.collect_references(out);
                }
            }
        }
    }

    fn check_well_formed(&self, namespace: &str, relation: &str) -> Result<()> {
        match self {
            Self::This => Ok(()),
            Self::ComputedRelation(target) if target.is_empty() => {
                Err(RebacError::InvalidNamespaceConfig(format!(
                    "{}#{} references an empty relation name",
                    namespace, relation
                )))
            }
            Self::ComputedRelation(_) => Ok(()),
            Self::Union(children) if children.is_empty() => {
                Err(RebacError::InvalidNamespaceConfig(format!(
                    "{}#{} has an empty union",
                    namespace, relation
                )))
            }
            Self::Union(children) => children
                .iter()
                .try_for_each(|child| child.check_well_formed(namespace, relation)),
        }
    }
}

/// Static per-namespace rewrite rules
///
/// Immutable once built. Relations without explicit configuration resolve to
/// [`RewriteExpr::This`].
#[derive(Debug, Clone, Default)]
pub struct NamespaceConfig {
    namespaces: HashMap<String, HashMap<String, RewriteExpr>>,
}

impl NamespaceConfig {
    pub fn builder() -> NamespaceConfigBuilder {
        NamespaceConfigBuilder::default()
    }

    /// Config with no namespaces: every relation is direct-tuple only
    pub fn empty() -> Self {
        Self::default()
    }

    /// Roles and documents: `admin` implies `edit` implies `view`
    pub fn document_roles() -> Self {
        Self {
            namespaces: HashMap::from([
                (
                    "role".to_string(),
                    HashMap::from([("member".to_string(), RewriteExpr::This)]),
                ),
                (
                    "document".to_string(),
                    HashMap::from([
                        ("admin".to_string(), RewriteExpr::This),
                        ("edit".to_string(), RewriteExpr::this_or(&["admin"])),
                        ("view".to_string(), RewriteExpr::this_or(&["edit"])),
                    ]),
                ),
            ]),
        }
    }

    /// Rewrite expression for `(namespace, relation)`, `This` when unconfigured
    pub fn expand(&self, namespace: &str, relation: &str) -> RewriteExpr {
        self.rewrite_for(namespace, relation)
            .cloned()
            .unwrap_or(RewriteExpr::This)
    }

    pub fn rewrite_for(&self, namespace: &str, relation: &str) -> Option<&RewriteExpr> {
        self.namespaces.get(namespace)?.get(relation)
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }
}

#[derive(Debug, Default)]
pub struct NamespaceConfigBuilder {
    namespaces: HashMap<String, HashMap<String, RewriteExpr>>,
}

impl NamespaceConfigBuilder {
    /// Declare a namespace whose relations are all direct-tuple only
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespaces.entry(namespace.to_string()).or_default();
        self
    }

    pub fn relation(mut self, namespace: &str, relation: &str, rewrite: RewriteExpr) -> Self {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(relation.to_string(), rewrite);
        self
    }

    /// Validate names and reject relation-name cycles within each namespace
    pub fn build(self) -> Result<NamespaceConfig> {
        for (namespace, relations) in &self.namespaces {
            if namespace.is_empty() {
                return Err(RebacError::InvalidNamespaceConfig(
                    "namespace name must not be empty".to_string(),
                ));
            }

            let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
            for (relation, rewrite) in relations {
                if relation.is_empty() {
                    return Err(RebacError::InvalidNamespaceConfig(format!(
                        "namespace '{}' has an empty relation name",
                        namespace
                    )));
                }
                rewrite.check_well_formed(namespace, relation)?;

                graph.add_node(relation.as_str());
                let mut references = Vec::new();
                rewrite.collect_references(&mut references);
                for target in references {
                    graph.add_edge(relation.as_str(), target, ());
                }
            }

            if let Err(cycle) = toposort(&graph, None) {
                return Err(RebacError::InvalidNamespaceConfig(format!(
                    "relation '{}#{}' is part of a rewrite cycle",
                    namespace,
                    cycle.node_id()
                )));
            }
        }

        Ok(NamespaceConfig {
            namespaces: self.namespaces,
        })
    }
}
