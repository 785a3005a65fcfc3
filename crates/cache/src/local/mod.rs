//! Local content-addressable store.
//!
//! Blobs live under `objects/` addressed by their SHA-256, write-once entry
//! records under `entries/`, and a versioned `index.json` tracks sizes,
//! access history, epochs, pins and recorded dependency sets. The store holds
//! an exclusive [`StoreLock`] on its root while open.

mod index;
mod layout;
mod maintenance;
mod objects;

#[cfg(test)]
mod tests;

use crate::backend::{
    CacheBackend, Epoch, PruneReport, RecoveryReport, StoreOutcome, StoreUsage, ValidationReport,
};
use crate::entry::{CacheEntry, EntryDraft, OutputBlob};
use crate::errors::{CacheError, RecoveryHint, Result, StoreType};
use crate::key::CacheKey;
use async_trait::async_trait;
use chrono::Utc;
use index::{BlobRef, IndexFile, IndexLoad, IndexRecord};
use kiln_config::{EvictionKind, MaterializeMode};
use kiln_core::ByteCount;
use kiln_utils::{copy_atomic, hard_link_atomic, write_atomic_json, StoreLock};
use layout::Layout;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) struct LocalState {
    pub index: IndexFile,
    pub dirty: bool,
    /// Bumped on every mutation that could invalidate a validation
    pub generation: u64,
    pub validated_generation: Option<u64>,
    pub active_epoch: Option<u64>,
}

impl LocalState {
    fn mutated(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }
}

pub(crate) struct Inner {
    pub layout: Layout,
    pub state: Mutex<LocalState>,
    pub eviction: EvictionKind,
    _lock: StoreLock,
}

/// Handle to an open local store. Cheap to clone.
#[derive(Clone)]
pub struct LocalCas {
    inner: Arc<Inner>,
    startup_recovery: Option<RecoveryReport>,
}

impl std::fmt::Debug for LocalCas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCas")
            .field("root", &self.inner.layout.root())
            .finish()
    }
}

impl LocalCas {
    /// Open (creating if needed) the store at `root`.
    ///
    /// A missing, unreadable or incompatible index is rebuilt from the entry
    /// files before the store is returned.
    pub fn open(root: impl Into<PathBuf>, eviction: EvictionKind) -> Result<Self> {
        let layout = Layout::new(root);
        layout
            .ensure()
            .map_err(|e| CacheError::io(layout.root(), "create store directories", e))?;
        let lock = StoreLock::try_acquire(layout.root()).map_err(|e| CacheError::StoreUnavailable {
            store_type: StoreType::Local,
            reason: e.to_string(),
            recovery_hint: RecoveryHint::Retry {
                after: std::time::Duration::from_secs(1),
            },
        })?;

        let (index, needs_rebuild) = match read_index(&layout)? {
            IndexLoad::Loaded(index) => (index, false),
            IndexLoad::Missing => (IndexFile::default(), has_entry_files(&layout)),
            IndexLoad::Incompatible { found } => {
                warn!(
                    root = %layout.root().display(),
                    found,
                    expected = kiln_core::CACHE_FORMAT_VERSION,
                    "cache index has incompatible format version, rebuilding"
                );
                (IndexFile::default(), true)
            }
            IndexLoad::Unreadable(reason) => {
                warn!(root = %layout.root().display(), %reason, "cache index unreadable, rebuilding");
                (IndexFile::default(), true)
            }
        };

        let inner = Arc::new(Inner {
            layout,
            state: Mutex::new(LocalState {
                index,
                dirty: false,
                generation: 0,
                validated_generation: None,
                active_epoch: None,
            }),
            eviction,
            _lock: lock,
        });

        let startup_recovery = if needs_rebuild {
            Some(inner.recover()?)
        } else {
            None
        };

        Ok(Self {
            inner,
            startup_recovery,
        })
    }

    pub fn root(&self) -> &Path {
        self.inner.layout.root()
    }

    /// Report of the automatic rebuild performed by `open`, if any
    pub fn startup_recovery(&self) -> Option<&RecoveryReport> {
        self.startup_recovery.as_ref()
    }

    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| CacheError::StoreUnavailable {
                store_type: StoreType::Local,
                reason: format!("{operation} worker failed: {e}"),
                recovery_hint: RecoveryHint::Retry {
                    after: std::time::Duration::from_millis(100),
                },
            })?
    }
}

fn read_index(layout: &Layout) -> Result<IndexLoad> {
    let path = layout.index();
    match fs::read(&path) {
        Ok(bytes) => Ok(IndexFile::parse(&bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IndexLoad::Missing),
        Err(e) => Err(CacheError::io(path, "read index", e)),
    }
}

fn has_entry_files(layout: &Layout) -> bool {
    walkdir::WalkDir::new(layout.entries_dir())
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file())
}

pub(crate) fn read_entry(layout: &Layout, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let path = layout.entry(key);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io(path, "read entry", e)),
    };
    let entry: CacheEntry =
        serde_json::from_slice(&bytes).map_err(|e| CacheError::decode(key.to_string(), e))?;
    if entry.key != *key || !entry.is_consistent() {
        return Err(CacheError::corruption(
            key.to_string(),
            "entry record does not match its key or payload digest",
        ));
    }
    Ok(Some(entry))
}

impl Inner {
    pub(crate) fn persist_index(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        write_atomic_json(&self.layout.index(), &state.index)?;
        state.dirty = false;
        Ok(())
    }

    fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        if !self.state.lock().index.entries.contains_key(key) {
            return Ok(None);
        }

        let checked = read_entry(&self.layout, key).and_then(|entry| match entry {
            Some(entry) => {
                for output in &entry.outputs {
                    objects::check_present(&self.layout, &output.digest, output.size)?;
                }
                Ok(Some(entry))
            }
            None => Err(CacheError::corruption(key.to_string(), "indexed entry file missing")),
        });

        let mut state = self.state.lock();
        match checked {
            Ok(entry) => {
                let epoch = state.active_epoch;
                state.index.touch(key, epoch);
                state.dirty = true;
                Ok(entry)
            }
            Err(err) => {
                warn!(key = %key, %err, "dropping unusable cache entry");
                state.index.entries.remove(key);
                state.mutated();
                Err(err)
            }
        }
    }

    fn store(&self, key: &CacheKey, draft: EntryDraft) -> Result<StoreOutcome> {
        let mut staged = Vec::with_capacity(draft.outputs.len());
        for source in &draft.outputs {
            match objects::stage(&self.layout, &source.local_path) {
                Ok(blob) => staged.push(blob),
                Err(err) => {
                    objects::discard(&staged);
                    return Err(err);
                }
            }
        }

        let outputs: Vec<OutputBlob> = draft
            .outputs
            .iter()
            .zip(&staged)
            .map(|(source, blob)| OutputBlob {
                path: source.logical_path.clone(),
                digest: blob.digest,
                size: blob.size,
                executable: blob.executable,
            })
            .collect();
        let entry = CacheEntry::new(*key, outputs, draft.metadata);

        let mut state = self.state.lock();
        let existing = if state.index.entries.contains_key(key) || self.layout.entry(key).exists() {
            read_entry(&self.layout, key).ok().flatten()
        } else {
            None
        };
        if let Some(existing) = existing {
            objects::discard(&staged);
            if existing.payload_digest != entry.payload_digest {
                return Err(CacheError::KeyCollision {
                    key: key.to_string(),
                    existing_payload: existing.payload_digest,
                    new_payload: entry.payload_digest,
                });
            }
            if !state.index.entries.contains_key(key) {
                state.index.entries.insert(*key, record_for(&existing, 0, None));
                state.mutated();
            }
            let epoch = state.active_epoch;
            state.index.touch(key, epoch);
            state.dirty = true;
            return Ok(StoreOutcome::AlreadyPresent);
        }

        // Blobs are committed under the state lock so prune never sees them
        // as orphans.
        let committed = staged
            .iter()
            .try_for_each(|blob| objects::commit(&self.layout, blob))
            .and_then(|()| write_atomic_json(&self.layout.entry(key), &entry).map_err(CacheError::from));
        if let Err(err) = committed {
            objects::discard(&staged);
            return Err(err);
        }

        let tick = state.index.tick();
        let epoch = state.active_epoch;
        state.index.entries.insert(*key, record_for(&entry, tick, epoch));
        state.mutated();
        debug!(key = %key, outputs = entry.outputs.len(), bytes = %entry.total_size(), "stored cache entry");
        Ok(StoreOutcome::Stored)
    }

    fn materialize(
        &self,
        entry: &CacheEntry,
        destinations: &[PathBuf],
        mode: MaterializeMode,
    ) -> Result<ByteCount> {
        if destinations.len() != entry.outputs.len() {
            return Err(CacheError::corruption(
                entry.key.to_string(),
                format!(
                    "entry has {} outputs but {} destinations were requested",
                    entry.outputs.len(),
                    destinations.len()
                ),
            ));
        }
        let mut written = ByteCount::ZERO;
        for (output, dest) in entry.outputs.iter().zip(destinations) {
            let blob = self.layout.blob(&output.digest);
            objects::check_present(&self.layout, &output.digest, output.size)?;
            match mode {
                MaterializeMode::Hardlink if !output.executable => {
                    if let Err(err) = hard_link_atomic(&blob, dest) {
                        debug!(dest = %dest.display(), %err, "hard link failed, copying");
                        copy_atomic(&blob, dest, output.executable)?;
                    }
                }
                _ => {
                    copy_atomic(&blob, dest, output.executable)?;
                }
            }
            written += ByteCount::new(output.size);
        }
        Ok(written)
    }

    fn begin_epoch(&self) -> Epoch {
        let mut state = self.state.lock();
        state.index.epoch += 1;
        let epoch = state.index.epoch;
        state.active_epoch = Some(epoch);
        state.dirty = true;
        Epoch(epoch)
    }

    fn end_epoch(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(epoch) = state.active_epoch.take() {
                state.index.pins.retain(|_, pinned| *pinned != epoch);
                state.dirty = true;
            }
        }
        self.persist_index()
    }

    fn pin(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        let epoch = state.active_epoch.unwrap_or(state.index.epoch);
        state.index.pins.insert(*key, epoch);
        state.dirty = true;
    }

    fn usage(&self) -> StoreUsage {
        let state = self.state.lock();
        let refcounts = state.index.blob_refcounts();
        StoreUsage {
            entries: state.index.entries.len(),
            blobs: refcounts.len(),
            total_bytes: ByteCount::new(refcounts.values().map(|(_, size)| size).sum()),
            pinned: state.index.pins.len(),
        }
    }
}

pub(crate) fn record_for(entry: &CacheEntry, tick: u64, epoch: Option<u64>) -> IndexRecord {
    let mut seen = HashSet::new();
    IndexRecord {
        blobs: entry
            .outputs
            .iter()
            .filter(|o| seen.insert(o.digest))
            .map(|o| BlobRef {
                digest: o.digest,
                size: o.size,
            })
            .collect(),
        created_at: Utc::now(),
        last_access: tick,
        access_count: 1,
        last_epoch: epoch.unwrap_or(0),
        base: entry.metadata.base_key,
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(err) = self.persist_index() {
            warn!(root = %self.layout.root().display(), %err, "failed to persist cache index");
        }
    }
}

#[async_trait]
impl CacheBackend for LocalCas {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let key = *key;
        self.blocking("lookup", move |inner| inner.lookup(&key)).await
    }

    async fn store(&self, key: &CacheKey, draft: EntryDraft) -> Result<StoreOutcome> {
        let key = *key;
        self.blocking("store", move |inner| inner.store(&key, draft)).await
    }

    async fn materialize(
        &self,
        entry: &CacheEntry,
        destinations: &[PathBuf],
        mode: MaterializeMode,
    ) -> Result<ByteCount> {
        let entry = entry.clone();
        let destinations = destinations.to_vec();
        self.blocking("materialize", move |inner| {
            inner.materialize(&entry, &destinations, mode)
        })
        .await
    }

    async fn dependency_sets(&self, base: &CacheKey) -> Result<Vec<Vec<String>>> {
        Ok(self
            .inner
            .state
            .lock()
            .index
            .dependency_sets
            .get(base)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_dependency_set(&self, base: &CacheKey, paths: Vec<String>) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.index.record_dependency_set(*base, paths);
        state.dirty = true;
        Ok(())
    }

    async fn validate(&self) -> Result<ValidationReport> {
        self.blocking("validate", |inner| inner.validate()).await
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        let report = self.blocking("recover", |inner| inner.recover()).await?;
        info!(
            recovered = report.recovered_entries,
            dropped = report.dropped_entries.len(),
            "cache store recovered"
        );
        Ok(report)
    }

    async fn prune(&self, limit: ByteCount) -> Result<PruneReport> {
        self.blocking("prune", move |inner| inner.prune(limit)).await
    }

    async fn begin_epoch(&self) -> Result<Epoch> {
        Ok(self.inner.begin_epoch())
    }

    async fn pin(&self, key: &CacheKey) -> Result<()> {
        self.inner.pin(key);
        Ok(())
    }

    async fn end_epoch(&self) -> Result<()> {
        self.blocking("end epoch", |inner| inner.end_epoch()).await
    }

    async fn usage(&self) -> Result<StoreUsage> {
        Ok(self.inner.usage())
    }

    async fn flush(&self) -> Result<()> {
        self.blocking("flush", |inner| inner.persist_index()).await
    }
}
