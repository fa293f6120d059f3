//! Invalidation criteria.

use std::collections::BTreeSet;

use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;

/// Which entries `QueryCache::invalidate` removes.
///
/// Criteria are OR'd: an entry is removed if any criterion matches it.
/// A target-kind criterion also matches entries that followed the registry's
/// full target set, since their results may include that kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationFilter {
    all: bool,
    associations: BTreeSet<String>,
    target_kinds: BTreeSet<String>,
    keys: BTreeSet<CacheKey>,
    /// (association, target kind) pairs that must both match.
    scopes: BTreeSet<(String, String)>,
}

impl InvalidationFilter {
    /// Matches nothing until criteria are added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches every entry.
    #[must_use]
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Matches every entry of `association`.
    #[must_use]
    pub fn association(mut self, association: impl Into<String>) -> Self {
        self.associations.insert(association.into());
        self
    }

    /// Matches entries whose results depend on `target_kind`.
    #[must_use]
    pub fn target_kind(mut self, target_kind: impl Into<String>) -> Self {
        self.target_kinds.insert(target_kind.into());
        self
    }

    /// Matches one exact key.
    #[must_use]
    pub fn key(mut self, key: CacheKey) -> Self {
        self.keys.insert(key);
        self
    }

    /// Entries of `association` whose results involve `target_kind`.
    #[must_use]
    pub fn scoped(mut self, association: impl Into<String>, target_kind: impl Into<String>) -> Self {
        self.scopes.insert((association.into(), target_kind.into()));
        self
    }

    /// True if no criterion was set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all
            && self.associations.is_empty()
            && self.target_kinds.is_empty()
            && self.keys.is_empty()
            && self.scopes.is_empty()
    }

    pub(crate) fn matches(&self, entry: &CacheEntry) -> bool {
        self.all
            || self.associations.contains(&entry.association)
            || self.keys.contains(&entry.key)
            || self.target_kinds.iter().any(|k| entry.involves_target(k))
            || self
                .scopes
                .iter()
                .any(|(assoc, kind)| *assoc == entry.association && entry.involves_target(kind))
    }
}
