//! # kyro-assoc - Polymorphic Associations
//!
//! A polymorphic association is a named relationship slot that may point at
//! records of several entity kinds, distinguished by a discriminator field
//! (`commentable_type`) and an id field (`commentable_id`). kyro-assoc keeps
//! the set of legal target kinds explicit and queryable instead of scattered
//! through application code.
//!
//! ## Components
//!
//! - **Registry**: the authoritative, persisted set of associations and
//!   their target kinds, with change notifications
//! - **Discovery**: proposes target kinds from relationship naming patterns
//!   and from the live distribution of discriminator values
//! - **Query builder**: validated, target-aware queries with eager loading,
//!   aggregation, per-target batches and timeouts
//! - **Query cache**: TTL + LRU result cache, invalidated automatically when
//!   the registry changes
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use kyro_assoc::{AssociationRegistry, AssociationSpec, InMemoryDataSource, Provenance, QueryBuilder, Record};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(AssociationRegistry::new());
//! registry.register_association(AssociationSpec::new("commentable").table("comments"))?;
//! registry.add_target("commentable", "posts", "Post", Provenance::Manual)?;
//!
//! let source = Arc::new(InMemoryDataSource::new());
//! source.insert(
//!     "comments",
//!     Record::new().with("id", 1).with("commentable_type", "posts").with("commentable_id", 7),
//! )?;
//!
//! let rows = QueryBuilder::new(Arc::clone(&registry), source, "commentable")
//!     .target("posts")
//!     .execute()?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Associations, targets and the persisted configuration.
pub mod association;
/// Error types.
pub mod error;
/// Change notifications.
pub mod events;
/// Injectable clocks.
pub mod time;
/// Field values and records.
pub mod value;

/// Query result cache.
pub mod cache;
/// Target-kind discovery.
pub mod discovery;
/// Query building and execution.
pub mod query;
/// The association registry.
pub mod registry;
/// Collaborator traits and reference implementations.
pub mod storage;

mod periodic;

pub use association::{Association, AssociationSpec, Provenance, RegistryConfiguration, TargetMetadata};
pub use cache::{CacheConfig, CacheKey, CacheMetrics, InvalidationFilter, QueryCache};
pub use discovery::{
    DiscoveryEngine, DiscoveryResult, DiscoverySource, DiscoveryWorker, DiscoveryWorkerConfig, ProposedAssociation,
};
pub use error::{AssocError, AssocResult, DiscoveryError, ExecutionError, ValidationError};
pub use events::{
    CacheInvalidated, ChangeEvent, ChangeKind, ChangeListener, ChannelListener, InvalidationReason, ListenerId, RegistryChanged,
};
pub use query::{AggregateFn, AggregationSpec, Condition, Query, QueryBuilder, QueryRequest, SortDirection};
pub use registry::AssociationRegistry;
pub use storage::{ConfigStore, DataSource, InMemoryDataSource, JsonFileConfigStore};
pub use value::{Record, Value};
