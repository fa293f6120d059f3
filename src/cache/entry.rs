//! Cache entries.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::key::CacheKey;
use crate::query::QueryRequest;
use crate::value::Record;

/// One cached result set.
///
/// Rows and metadata are immutable once inserted; a refresh replaces the
/// whole entry. Access statistics are atomics so hits only need the shared
/// lock.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub(crate) key: CacheKey,
    pub(crate) rows: Vec<Record>,
    pub(crate) association: String,
    pub(crate) target_kinds: Vec<String>,
    /// Whether the request followed the registry's full target set.
    pub(crate) follows_registry: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) fetch_duration: Duration,
    pub(crate) size_bytes: usize,
    hits: AtomicU64,
    /// Microseconds between `created_at` and the last access.
    last_accessed_offset_us: AtomicI64,
    /// Monotonic access sequence; orders LRU even when the clock stands still.
    last_access_seq: AtomicU64,
}

impl CacheEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: CacheKey,
        request: &QueryRequest,
        rows: Vec<Record>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        fetch_duration: Duration,
        size_bytes: usize,
        seq: u64,
    ) -> Self {
        Self {
            key,
            rows,
            association: request.association().to_string(),
            target_kinds: request.target_kinds().to_vec(),
            follows_registry: request.filter().is_all(),
            created_at,
            expires_at,
            fetch_duration,
            size_bytes,
            hits: AtomicU64::new(0),
            last_accessed_offset_us: AtomicI64::new(0),
            last_access_seq: AtomicU64::new(seq),
        }
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn touch(&self, now: DateTime<Utc>, seq: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let offset = (now - self.created_at).num_microseconds().unwrap_or(i64::MAX);
        self.last_accessed_offset_us.store(offset, Ordering::Relaxed);
        self.last_access_seq.store(seq, Ordering::Relaxed);
    }

    pub(crate) fn last_access_seq(&self) -> u64 {
        self.last_access_seq.load(Ordering::Relaxed)
    }

    /// True if the entry's results depend on `target_kind`.
    pub(crate) fn involves_target(&self, target_kind: &str) -> bool {
        self.follows_registry || self.target_kinds.iter().any(|k| k == target_kind)
    }

    pub(crate) fn info(&self) -> EntryInfo {
        let offset = self.last_accessed_offset_us.load(Ordering::Relaxed);
        EntryInfo {
            key: self.key.digest(),
            association: self.association.clone(),
            target_kinds: self.target_kinds.clone(),
            rows: self.rows.len(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed: self
                .created_at
                .checked_add_signed(chrono::Duration::microseconds(offset))
                .unwrap_or(self.created_at),
            hits: self.hits.load(Ordering::Relaxed),
            fetch_duration: self.fetch_duration,
            size_bytes: self.size_bytes,
        }
    }
}

/// Read-only snapshot of one entry's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    /// Key digest.
    pub key: String,
    /// Association the request targeted.
    pub association: String,
    /// Resolved target kinds of the request.
    pub target_kinds: Vec<String>,
    /// Number of cached rows.
    pub rows: usize,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Last hit, or insertion time if never hit.
    pub last_accessed: DateTime<Utc>,
    /// Number of hits.
    pub hits: u64,
    /// How long the fetch that produced the entry took.
    pub fetch_duration: Duration,
    /// Estimated size in bytes.
    pub size_bytes: usize,
}
