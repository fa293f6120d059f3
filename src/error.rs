//! Error types for kyro-assoc.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the specific misuse (unknown association, unregistered target kind, ...)
//! instead of parsing messages.

use thiserror::Error;

use crate::storage::{PersistenceError, StorageError};

/// Validation errors raised at the point of misuse.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// An identifier-shaped field does not match `[A-Za-z][A-Za-z0-9_]*`.
    #[error("Invalid identifier for '{field}': {value:?}")]
    InvalidIdentifier {
        /// Name of the offending field.
        field: String,
        /// The rejected value.
        value: String,
    },

    /// A required field is empty.
    #[error("Required field '{field}' is missing")]
    MissingField {
        /// Name of the missing field.
        field: String,
    },

    /// A field is longer than allowed.
    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        /// Name of the field.
        field: String,
        /// Maximum length.
        max_length: usize,
    },

    /// Attempt to change an association's table or fields.
    #[error("Field '{field}' of association '{association}' is fixed once created")]
    ImmutableField {
        /// The association.
        association: String,
        /// The field that would change.
        field: String,
    },

    /// NaN or an infinity in a condition operand.
    #[error("Condition on '{field}' uses a non-finite number")]
    NonFiniteValue {
        /// The condition's field.
        field: String,
    },
}

/// Errors raised while running a query against the data-access collaborator.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The query did not finish within its timeout.
    #[error("Query timed out after {duration_ms}ms")]
    Timeout {
        /// The timeout that elapsed.
        duration_ms: u64,
    },

    /// The data source failed.
    #[error("Data source error: {0}")]
    Storage(#[from] StorageError),

    /// A query worker thread panicked or could not be started.
    #[error("Query worker failed: {reason}")]
    WorkerFailed {
        /// What went wrong.
        reason: String,
    },
}

/// A single discovery candidate could not be analysed.
///
/// Discovery is advisory: these are collected and logged, never used to
/// abort a scan.
#[derive(Debug, Clone, Error)]
#[error("Discovery failed for {table}.{field}: {reason}")]
pub struct DiscoveryError {
    /// Candidate table.
    pub table: String,
    /// Candidate field, or `*` for the whole table.
    pub field: String,
    /// What went wrong.
    pub reason: String,
}

impl DiscoveryError {
    /// Creates a discovery error for a (table, field) candidate.
    #[must_use]
    pub fn new(table: impl Into<String>, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum AssocError {
    /// No association with this name is registered.
    #[error("Unknown association: {name}")]
    UnknownAssociation {
        /// The requested name.
        name: String,
    },

    /// Target kind is unregistered, or inactive without override.
    #[error("Invalid target '{target_kind}' for association '{association}': {reason}")]
    InvalidTarget {
        /// The association.
        association: String,
        /// The rejected target kind.
        target_kind: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Aggregation without functions, or a numeric function without fields.
    #[error("Malformed aggregation: {reason}")]
    MalformedAggregation {
        /// What is wrong with it.
        reason: String,
    },

    /// Invalid input.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Query execution failed.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Loading or saving the configuration failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A discovery candidate failed.
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Internal invariant violated (poisoned lock and the like).
    #[error("Internal error: {message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl AssocError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an unknown-association error.
    #[must_use]
    pub fn unknown_association(name: impl Into<String>) -> Self {
        Self::UnknownAssociation { name: name.into() }
    }

    /// Creates an invalid-target error.
    #[must_use]
    pub fn invalid_target(
        association: impl Into<String>,
        target_kind: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTarget {
            association: association.into(),
            target_kind: target_kind.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this is an unknown-association error.
    #[must_use]
    pub const fn is_unknown_association(&self) -> bool {
        matches!(self, Self::UnknownAssociation { .. })
    }

    /// Returns true if this is an invalid-target error.
    #[must_use]
    pub const fn is_invalid_target(&self) -> bool {
        matches!(self, Self::InvalidTarget { .. })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::MalformedAggregation { .. })
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a persistence error.
    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Returns true if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Timeout { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::Storage(StorageError::ConnectionError(_))
            ),
            Self::Persistence(PersistenceError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Result type alias for kyro-assoc operations.
pub type AssocResult<T> = Result<T, AssocError>;
