//! Canonical cache keys.
//!
//! The key is the JSON encoding of the request's semantic parts. Maps are
//! `BTreeMap`s and target kinds are kept sorted, so logically identical
//! requests encode to identical bytes regardless of construction order.
//! The timeout is not part of the key: it changes how long the caller is
//! willing to wait, not what is fetched.

use std::collections::BTreeMap;
use std::fmt;

use blake3::Hasher;
use serde::Serialize;

use crate::query::{AggregationSpec, Condition, OrderBy, Pagination, QueryRequest, TargetFilter};

#[derive(Serialize)]
struct KeyParts<'a> {
    association: &'a str,
    filter: &'a TargetFilter,
    target_kinds: &'a [String],
    conditions: &'a BTreeMap<String, Condition>,
    order_by: &'a [OrderBy],
    pagination: Pagination,
    with_targets: bool,
    aggregation: Option<&'a AggregationSpec>,
}

/// Canonical, order-independent key of a `QueryRequest`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    canonical: String,
}

impl CacheKey {
    /// Encodes a request.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if a condition value cannot be encoded.
    pub fn for_request(request: &QueryRequest) -> Result<Self, serde_json::Error> {
        let parts = KeyParts {
            association: request.association(),
            filter: request.filter(),
            target_kinds: request.target_kinds(),
            conditions: request.conditions(),
            order_by: request.order_by(),
            pagination: request.pagination(),
            with_targets: request.with_targets(),
            aggregation: request.aggregation(),
        };
        Ok(Self {
            canonical: serde_json::to_string(&parts)?,
        })
    }

    /// The canonical encoding.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Short stable digest, for logs.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut h = Hasher::new();
        h.update(self.canonical.as_bytes());
        let hex = h.finalize().to_hex();
        hex.as_str()[..16].to_string()
    }

    pub(crate) fn len(&self) -> usize {
        self.canonical.len()
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.digest()).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::association::Provenance;
    use crate::query::QueryBuilder;
    use crate::registry::AssociationRegistry;
    use crate::storage::InMemoryDataSource;

    fn builder() -> QueryBuilder {
        let registry = Arc::new(AssociationRegistry::new());
        for kind in ["jobs", "tasks", "runs"] {
            registry.add_target("loggable", kind, kind, Provenance::Manual).unwrap();
        }
        QueryBuilder::new(registry, Arc::new(InMemoryDataSource::new()), "loggable")
    }

    fn key(b: QueryBuilder) -> CacheKey {
        CacheKey::for_request(b.build().unwrap().request()).unwrap()
    }

    #[test]
    fn test_construction_order_does_not_matter() {
        let b = builder();
        let a = key(b.clone().target("tasks").target("jobs").eq("level", "warn").eq("host", "a"));
        let c = key(b.target("jobs").target("tasks").eq("host", "a").eq("level", "warn"));
        assert_eq!(a, c);
        assert_eq!(a.as_str(), c.as_str());
        assert_eq!(a.digest(), c.digest());
    }

    #[test]
    fn test_semantic_differences_change_key() {
        let b = builder();
        let base = key(b.clone().target("jobs"));
        assert_ne!(base, key(b.clone().target("tasks")));
        assert_ne!(base, key(b.clone().target("jobs").limit(10)));
        assert_ne!(base, key(b.clone().target("jobs").with_targets()));
        assert_ne!(base, key(b.clone()));
        // Timeout is not semantic.
        assert_eq!(base, key(b.target("jobs").timeout(Duration::from_secs(1))));
    }

    #[test]
    fn test_digest_is_short_hex() {
        let k = key(builder());
        assert_eq!(k.digest().len(), 16);
        assert!(k.digest().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
