//! Collaborator interfaces and reference implementations.
//!
//! The traits define what the core needs from a data store and from
//! configuration persistence; the in-memory and JSON-file implementations
//! back embedded use and tests.

mod file;
mod memory;
mod traits;

pub use file::JsonFileConfigStore;
pub use memory::{InMemoryConfigStore, InMemoryDataSource};
pub use traits::{ConfigStore, DataSource, PersistenceError, StorageError};
