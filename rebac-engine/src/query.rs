//! Partial tuple patterns used by bulk deletion and listing.
//!
//! Matching is purely syntactic: a subject-set pattern matches the identical
//! subject set only, it is never expanded.

use crate::{
    error::Result,
    models::{validate_name, RelationTuple, SubjectRef},
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tuple pattern; `None` fields act as wildcards
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationQuery {
    pub namespace: Option<String>,
    pub object: Option<String>,
    pub relation: Option<String>,
    pub subject: Option<SubjectRef>,
}

impl RelationQuery {
    /// Pattern matching every tuple
    pub fn new() -> Self {
        Self::default()
    }

    /// Pattern matching exactly one tuple
    pub fn exact(tuple: &RelationTuple) -> Self {
        Self {
            namespace: Some(tuple.namespace.clone()),
            object: Some(tuple.object.clone()),
            relation: Some(tuple.relation.clone()),
            subject: Some(tuple.subject.clone()),
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn object(mut self, object: &str) -> Self {
        self.object = Some(object.to_string());
        self
    }

    pub fn relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    pub fn subject(mut self, subject: SubjectRef) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Structural match of `tuple` against this pattern
    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        field_matches(&self.namespace, &tuple.namespace)
            && field_matches(&self.object, &tuple.object)
            && field_matches(&self.relation, &tuple.relation)
            && self.matches_subject(&tuple.subject)
    }

    /// Matches the subject part only; a set pattern is never expanded
    pub fn matches_subject(&self, subject: &SubjectRef) -> bool {
        self.subject.as_ref().map_or(true, |wanted| wanted == subject)
    }

    /// Matches the `(namespace, object, relation)` part only
    pub fn matches_bucket(&self, namespace: &str, object: &str, relation: &str) -> bool {
        field_matches(&self.namespace, namespace)
            && field_matches(&self.object, object)
            && field_matches(&self.relation, relation)
    }

    /// The single bucket this pattern is confined to, if all three are set
    pub fn bucket(&self) -> Option<(&str, &str, &str)> {
        match (&self.namespace, &self.object, &self.relation) {
            (Some(namespace), Some(object), Some(relation)) => {
                Some((namespace.as_str(), object.as_str(), relation.as_str()))
            }
            _ => None,
        }
    }

    /// Reject patterns with present-but-empty or malformed fields
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("query namespace", &self.namespace),
            ("query object", &self.object),
            ("query relation", &self.relation),
        ] {
            if let Some(value) = value {
                validate_name(name, value)?;
            }
        }

        match &self.subject {
            Some(subject) => subject.validate(),
            None => Ok(()),
        }
    }
}

fn field_matches(pattern: &Option<String>, value: &str) -> bool {
    pattern.as_deref().map_or(true, |expected| expected == value)
}

impl fmt::Display for RelationQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = self
            .subject
            .as_ref()
            .map_or_else(|| "*".to_string(), ToString::to_string);
        write!(
            f,
            "{}:{}#{}@{}",
            self.namespace.as_deref().unwrap_or("*"),
            self.object.as_deref().unwrap_or("*"),
            self.relation.as_deref().unwrap_or("*"),
            subject
        )
    }
}
