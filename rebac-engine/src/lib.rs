//! Relationship-based access control (ReBAC) engine
//!
//! Stores directed relation tuples and answers "does subject S hold relation R
//! on object O?" by walking them:
//! - Direct tuples (`document:readme#view@alice`)
//! - Subject sets, i.e. transitive membership (`document:readme#admin@role:admin#member`)
//! - Per-namespace rewrite rules (`edit = this | admin`)
//!
//! Traversal is bounded by a depth budget, so cyclic membership graphs
//! terminate and deny instead of looping.
//!
//! # Core Concepts
//!
//! - **Tuple**: `namespace:object#relation@subject`, one edge of the graph
//! - **Subject**: a concrete id (`alice`) or a subject set (`role:admin#member`)
//! - **Rewrite rule**: how a relation is derived from stored tuples and sibling relations
//!
//! # Example
//!
//! ```rust
//! use rebac_engine::{AuthorizationEngine, MemoryTupleStore, NamespaceConfig, SubjectRef};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthorizationEngine::new(
//!         Arc::new(MemoryTupleStore::new()),
//!         Arc::new(NamespaceConfig::document_roles()),
//!     );
//!
//!     engine.write_tuple("role:admin#member@alice".parse()?).await?;
//!     engine.write_tuple("document:readme#admin@role:admin#member".parse()?).await?;
//!
//!     let allowed = engine
//!         .check("document", "readme", "edit", &SubjectRef::id("alice"))
//!         .await?;
//!     assert!(allowed);
//!
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod client;
pub mod engine;
pub mod error;
pub mod expand;
pub mod logging;
pub mod models;
pub mod namespace;
pub mod query;
pub mod settings;
pub mod store;
pub mod write;

pub use check::{PermissionChecker, Resolution, DEFAULT_MAX_DEPTH};
pub use client::{RelationClient, RelationService, RetryPolicy};
pub use engine::{AuthorizationEngine, DEFAULT_CACHE_CAPACITY};
pub use error::*;
pub use expand::{ExpandTree, SubjectExpander};
pub use models::*;
pub use namespace::{NamespaceConfig, NamespaceConfigBuilder, RewriteExpr};
pub use query::RelationQuery;
pub use settings::{EngineSettings, LoggingSettings};
pub use store::{MemoryTupleStore, TupleStore, DEFAULT_SHARD_COUNT};
pub use write::WriteCoordinator;
