use crate::error::{RebacError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delimiters of the `namespace:object#relation@subject` text form
pub const RESERVED_CHARS: [char; 3] = [':', '#', '@'];

/// Reject empty names and names containing a text-form delimiter
pub fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RebacError::validation(format!("{} must not be empty", field)));
    }
    if value.contains(|c: char| RESERVED_CHARS.contains(&c)) {
        return Err(RebacError::validation(format!(
            "{} '{}' must not contain ':', '#' or '@'",
            field, value
        )));
    }
    Ok(())
}

/// The set of all subjects holding `relation` on `object` within `namespace`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectSet {
    pub namespace: String,
    pub object: String,
    pub relation: String,
}

impl SubjectSet {
    pub fn new(namespace: &str, object: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
        }
    }

    /// True when this set names exactly the given `(namespace, object, relation)` bucket
    pub fn refers_to(&self, namespace: &str, object: &str, relation: &str) -> bool {
        self.namespace == namespace && self.object == object && self.relation == relation
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("subject set namespace", &self.namespace)?;
        validate_name("subject set object", &self.object)?;
        validate_name("subject set relation", &self.relation)
    }
}

impl fmt::Display for SubjectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.namespace, self.object, self.relation)
    }
}

impl FromStr for SubjectSet {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace_object, relation) = s
            .split_once('#')
            .ok_or_else(|| RebacError::Parse(format!("subject set '{}' is missing '#'", s)))?;
        let (namespace, object) = namespace_object
            .split_once(':')
            .ok_or_else(|| RebacError::Parse(format!("subject set '{}' is missing ':'", s)))?;

        Ok(Self::new(namespace, object, relation))
    }
}

/// Subject of a relation tuple: either a concrete principal or a subject set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubjectRef {
    Id { id: String },
    Set(SubjectSet),
}

impl SubjectRef {
    pub fn id(id: &str) -> Self {
        Self::Id { id: id.to_string() }
    }

    /// Subject set reference, e.g. `SubjectRef::set("role", "admin", "member")`
    pub fn set(namespace: &str, object: &str, relation: &str) -> Self {
        Self::Set(SubjectSet::new(namespace, object, relation))
    }

    pub fn as_set(&self) -> Option<&SubjectSet> {
        match self {
            Self::Set(set) => Some(set),
            Self::Id { .. } => None,
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }

    /// Ids may contain ':' and '@' but never '#', which marks a subject set
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Id { id } if id.is_empty() => {
                Err(RebacError::validation("subject id must not be empty"))
            }
            Self::Id { id } if id.contains('#') => Err(RebacError::validation(format!(
                "subject id '{}' must not contain '#'",
                id
            ))),
            Self::Id { .. } => Ok(()),
            Self::Set(set) => set.validate(),
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id { id } => write!(f, "{}", id),
            Self::Set(set) => write!(f, "{}", set),
        }
    }
}

impl FromStr for SubjectRef {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(RebacError::Parse("subject is empty".to_string()));
        }
        if s.contains('#') {
            Ok(Self::Set(s.parse()?))
        } else {
            Ok(Self::id(s))
        }
    }
}

/// One edge of the authorization graph: `namespace:object#relation@subject`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationTuple {
    pub namespace: String,
    pub object: String,
    pub relation: String,
    pub subject: SubjectRef,
}

impl RelationTuple {
    pub fn new(namespace: &str, object: &str, relation: &str, subject: SubjectRef) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
            subject,
        }
    }

    /// A tuple whose subject set is its own `(namespace, object, relation)` bucket
    pub fn is_self_referencing(&self) -> bool {
        self.subject
            .as_set()
            .is_some_and(|set| set.refers_to(&self.namespace, &self.object, &self.relation))
    }

    /// Structural validation; every valid tuple survives the text and record forms
    pub fn validate(&self) -> Result<()> {
        validate_name("namespace", &self.namespace)?;
        validate_name("object", &self.object)?;
        validate_name("relation", &self.relation)?;
        self.subject.validate()
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}",
            self.namespace, self.object, self.relation, self.subject
        )
    }
}

impl FromStr for RelationTuple {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        let (resource, subject) = s
            .split_once('@')
            .ok_or_else(|| RebacError::Parse(format!("tuple '{}' is missing '@'", s)))?;
        let (namespace_object, relation) = resource
            .split_once('#')
            .ok_or_else(|| RebacError::Parse(format!("tuple '{}' is missing '#'", s)))?;
        let (namespace, object) = namespace_object
            .split_once(':')
            .ok_or_else(|| RebacError::Parse(format!("tuple '{}' is missing ':'", s)))?;

        Ok(Self::new(namespace, object, relation, subject.parse()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaAction {
    Insert,
    Delete,
}

/// A single step of a write batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationTupleDelta {
    pub action: DeltaAction,
    pub tuple: RelationTuple,
}

impl RelationTupleDelta {
    pub fn insert(tuple: RelationTuple) -> Self {
        Self {
            action: DeltaAction::Insert,
            tuple,
        }
    }

    pub fn delete(tuple: RelationTuple) -> Self {
        Self {
            action: DeltaAction::Delete,
            tuple,
        }
    }

    /// Turn a list of tuples into deltas sharing one action
    pub fn from_tuples(tuples: impl IntoIterator<Item = RelationTuple>, action: DeltaAction) -> Vec<Self> {
        tuples
            .into_iter()
            .map(|tuple| Self { action, tuple })
            .collect()
    }
}

/// Authorization check request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckRequest {
    pub namespace: String,
    pub object: String,
    pub relation: String,
    pub subject: SubjectRef,
}

impl CheckRequest {
    pub fn new(namespace: &str, object: &str, relation: &str, subject: SubjectRef) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
            subject,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("namespace", &self.namespace)?;
        validate_name("object", &self.object)?;
        validate_name("relation", &self.relation)?;
        self.subject.validate()
    }
}

impl From<RelationTuple> for CheckRequest {
    fn from(tuple: RelationTuple) -> Self {
        Self {
            namespace: tuple.namespace,
            object: tuple.object,
            relation: tuple.relation,
            subject: tuple.subject,
        }
    }
}

impl fmt::Display for CheckRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}",
            self.namespace, self.object, self.relation, self.subject
        )
    }
}

/// Authorization check response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Id,
    Set,
}

/// Storage record for a tuple. `(namespace, object, relation, subject_kind,
/// subject_value)` is the primary key; a set's value is its `ns:obj#rel` text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleRecord {
    pub namespace: String,
    pub object: String,
    pub relation: String,
    pub subject_kind: SubjectKind,
    pub subject_value: String,
}

impl From<&RelationTuple> for TupleRecord {
    fn from(tuple: &RelationTuple) -> Self {
        let subject_kind = match tuple.subject {
            SubjectRef::Id { .. } => SubjectKind::Id,
            SubjectRef::Set(_) => SubjectKind::Set,
        };

        Self {
            namespace: tuple.namespace.clone(),
            object: tuple.object.clone(),
            relation: tuple.relation.clone(),
            subject_kind,
            subject_value: tuple.subject.to_string(),
        }
    }
}

impl TryFrom<TupleRecord> for RelationTuple {
    type Error = RebacError;

    fn try_from(record: TupleRecord) -> Result<Self> {
        let subject = match record.subject_kind {
            SubjectKind::Id => SubjectRef::Id {
                id: record.subject_value,
            },
            SubjectKind::Set => SubjectRef::Set(record.subject_value.parse()?),
        };

        Ok(Self {
            namespace: record.namespace,
            object: record.object,
            relation: record.relation,
            subject,
        })
    }
}
