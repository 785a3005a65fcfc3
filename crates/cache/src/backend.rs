//! The cache backend seam

use crate::entry::{CacheEntry, EntryDraft};
use crate::errors::Result;
use crate::key::CacheKey;
use async_trait::async_trait;
use kiln_config::MaterializeMode;
use kiln_core::ByteCount;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of a store call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutcome {
    Stored,
    /// An identical payload was already stored under the key
    AlreadyPresent,
}

/// A build generation. Entries touched or pinned during the current epoch
/// are never evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub u64);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when validation was short-circuited because nothing changed
    pub skipped: bool,
    pub checked_entries: usize,
    pub checked_blobs: usize,
    pub version_ok: bool,
    pub missing_entry_files: Vec<String>,
    pub unindexed_entries: Vec<String>,
    pub missing_blobs: Vec<String>,
    pub corrupt_blobs: Vec<String>,
    pub unreadable_entries: Vec<String>,
    pub orphan_blobs: usize,
}

impl ValidationReport {
    /// Whether the store needs `recover()`. Orphan blobs are harmless and
    /// left for `prune`.
    pub fn is_healthy(&self) -> bool {
        self.version_ok
            && self.missing_entry_files.is_empty()
            && self.unindexed_entries.is_empty()
            && self.missing_blobs.is_empty()
            && self.corrupt_blobs.is_empty()
            && self.unreadable_entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub rebuilt_index: bool,
    pub recovered_entries: usize,
    pub dropped_entries: Vec<String>,
    pub removed_partials: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub scanned: usize,
    pub evicted: Vec<String>,
    pub skipped_pinned: usize,
    pub reclaimed_bytes: ByteCount,
    pub removed_blobs: usize,
    pub final_size: ByteCount,
    /// Base keys whose recorded dependency sets no longer lead to an entry
    #[serde(default)]
    pub dropped_dependency_sets: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUsage {
    pub entries: usize,
    pub blobs: usize,
    pub total_bytes: ByteCount,
    pub pinned: usize,
}

/// A content-addressable cache store.
///
/// Implementations must be safe to call from many worker tasks at once.
/// `lookup` is expected to be bounded by the caller; a slow or failing
/// backend degrades to a miss.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Capture the draft's output files under `key`.
    ///
    /// Storing a byte-identical payload again is a no-op; a different
    /// payload is a [`crate::CacheError::KeyCollision`].
    async fn store(&self, key: &CacheKey, draft: EntryDraft) -> Result<StoreOutcome>;

    /// Place the entry's outputs at `destinations` (same order as
    /// `entry.outputs`). Returns the bytes written.
    async fn materialize(
        &self,
        entry: &CacheEntry,
        destinations: &[PathBuf],
        mode: MaterializeMode,
    ) -> Result<ByteCount>;

    /// Discovered-input path sets previously recorded for a base key,
    /// most recent first
    async fn dependency_sets(&self, base: &CacheKey) -> Result<Vec<Vec<String>>>;

    async fn record_dependency_set(&self, base: &CacheKey, paths: Vec<String>) -> Result<()>;

    async fn validate(&self) -> Result<ValidationReport>;

    async fn recover(&self) -> Result<RecoveryReport>;

    async fn prune(&self, limit: ByteCount) -> Result<PruneReport>;

    async fn begin_epoch(&self) -> Result<Epoch>;

    /// Keep `key` alive for the rest of the current epoch
    async fn pin(&self, key: &CacheKey) -> Result<()>;

    async fn end_epoch(&self) -> Result<()>;

    async fn usage(&self) -> Result<StoreUsage>;

    /// Persist any buffered index state
    async fn flush(&self) -> Result<()>;
}
