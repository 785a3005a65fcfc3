//! validate / recover / prune for the local store

use super::index::{IndexFile, IndexLoad};
use super::layout::{digest_from_blob_path, key_from_entry_path};
use super::{objects, read_entry, record_for, Inner};
use crate::backend::{PruneReport, RecoveryReport, ValidationReport};
use crate::errors::{CacheError, Result};
use crate::eviction::create_eviction_policy;
use crate::key::CacheKey;
use kiln_core::{ByteCount, Digest, CACHE_FORMAT_VERSION};
use kiln_utils::write_atomic_json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

fn files_under(dir: PathBuf) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}

impl Inner {
    /// Check the store against its index.
    ///
    /// Skipped when nothing has been written since the last successful
    /// validation or recovery.
    pub(crate) fn validate(&self) -> Result<ValidationReport> {
        let state = self.state.lock();
        if state.validated_generation == Some(state.generation) {
            return Ok(ValidationReport {
                skipped: true,
                version_ok: true,
                ..Default::default()
            });
        }
        let index = state.index.clone();
        let generation = state.generation;
        drop(state);

        let mut report = ValidationReport {
            version_ok: true,
            ..Default::default()
        };

        if let Ok(bytes) = fs::read(self.layout.index()) {
            match IndexFile::parse(&bytes) {
                IndexLoad::Incompatible { found } => {
                    warn!(found, expected = CACHE_FORMAT_VERSION, "index version mismatch");
                    report.version_ok = false;
                }
                IndexLoad::Unreadable(reason) => {
                    report.unreadable_entries.push(format!("index: {reason}"));
                }
                IndexLoad::Loaded(_) | IndexLoad::Missing => {}
            }
        }

        let mut verified: HashMap<Digest, bool> = HashMap::new();
        for (key, record) in &index.entries {
            report.checked_entries += 1;
            match read_entry(&self.layout, key) {
                Ok(Some(entry)) => {
                    if entry.format_version != CACHE_FORMAT_VERSION {
                        report.version_ok = false;
                    }
                }
                Ok(None) => {
                    report.missing_entry_files.push(key.to_string());
                    continue;
                }
                Err(err) => {
                    debug!(key = %key, %err, "unreadable entry");
                    report.unreadable_entries.push(key.to_string());
                    continue;
                }
            }
            for blob in &record.blobs {
                if let Some(ok) = verified.get(&blob.digest) {
                    if !ok {
                        report.corrupt_blobs.push(blob.digest.to_hex());
                    }
                    continue;
                }
                report.checked_blobs += 1;
                let ok = match objects::verify(&self.layout, &blob.digest) {
                    Ok(size) if size == blob.size => true,
                    Ok(_) => {
                        report.corrupt_blobs.push(blob.digest.to_hex());
                        false
                    }
                    Err(CacheError::Corruption { .. }) => {
                        report.missing_blobs.push(blob.digest.to_hex());
                        false
                    }
                    Err(_) => {
                        report.corrupt_blobs.push(blob.digest.to_hex());
                        false
                    }
                };
                verified.insert(blob.digest, ok);
            }
        }

        for path in files_under(self.layout.entries_dir()) {
            match key_from_entry_path(&path) {
                Some(key) if index.entries.contains_key(&key) => {}
                Some(key) => report.unindexed_entries.push(key.to_string()),
                None => report.unindexed_entries.push(path.display().to_string()),
            }
        }

        let referenced = index.blob_refcounts();
        report.orphan_blobs = files_under(self.layout.objects_dir())
            .filter(|path| {
                digest_from_blob_path(path).map_or(true, |d| !referenced.contains_key(&d))
            })
            .count();

        if report.is_healthy() {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.validated_generation = Some(generation);
            }
        } else {
            warn!(
                missing_entries = report.missing_entry_files.len(),
                unindexed = report.unindexed_entries.len(),
                missing_blobs = report.missing_blobs.len(),
                corrupt_blobs = report.corrupt_blobs.len(),
                "cache store failed validation"
            );
        }
        Ok(report)
    }

    /// Rebuild the index from the entry files.
    ///
    /// Partial writes in `tmp/` are removed, entries that fail to parse or
    /// reference missing or corrupt blobs are dropped, and access history,
    /// pins and dependency sets of surviving entries are carried over.
    pub(crate) fn recover(&self) -> Result<RecoveryReport> {
        let mut state = self.state.lock();
        let previous = std::mem::take(&mut state.index);
        let mut report = RecoveryReport {
            rebuilt_index: true,
            ..Default::default()
        };

        for path in files_under(self.layout.tmp_dir()) {
            if fs::remove_file(&path).is_ok() {
                report.removed_partials += 1;
            }
        }

        let mut index = IndexFile {
            clock: previous.clock,
            epoch: previous.epoch,
            ..IndexFile::default()
        };
        let mut verified: HashMap<Digest, bool> = HashMap::new();

        for path in files_under(self.layout.entries_dir()) {
            let Some(key) = key_from_entry_path(&path) else {
                let _ = fs::remove_file(&path);
                report.dropped_entries.push(path.display().to_string());
                continue;
            };
            let entry = match read_entry(&self.layout, &key) {
                Ok(Some(entry)) if entry.format_version == CACHE_FORMAT_VERSION => entry,
                Ok(_) | Err(_) => {
                    let _ = fs::remove_file(&path);
                    report.dropped_entries.push(key.to_string());
                    continue;
                }
            };
            let intact = entry.outputs.iter().all(|output| {
                *verified.entry(output.digest).or_insert_with(|| {
                    matches!(objects::verify(&self.layout, &output.digest), Ok(size) if size == output.size)
                })
            });
            if !intact {
                let _ = fs::remove_file(&path);
                report.dropped_entries.push(key.to_string());
                continue;
            }

            let mut record = record_for(&entry, 0, None);
            match previous.entries.get(&key) {
                Some(old) => {
                    record.created_at = old.created_at;
                    record.last_access = old.last_access;
                    record.access_count = old.access_count;
                    record.last_epoch = old.last_epoch;
                }
                None => record.created_at = entry.created_at,
            }
            index.entries.insert(key, record);
            report.recovered_entries += 1;
        }

        // Corrupt blobs are removed so a later store rewrites them.
        for (digest, ok) in &verified {
            if !ok {
                let _ = fs::remove_file(self.layout.blob(digest));
            }
        }

        index.pins = previous
            .pins
            .into_iter()
            .filter(|(key, _)| index.entries.contains_key(key))
            .collect();
        index.dependency_sets = previous.dependency_sets;
        let dropped_sets = index.retain_live_dependency_sets();
        if dropped_sets > 0 {
            debug!(dropped = dropped_sets, "dropped dependency sets without entries");
        }

        write_atomic_json(&self.layout.index(), &index)?;
        state.index = index;
        state.dirty = false;
        state.generation += 1;
        state.validated_generation = Some(state.generation);
        Ok(report)
    }

    /// Evict entries until the store holds at most `limit` bytes.
    ///
    /// Entries used or pinned in the active epoch are never evicted. Orphan
    /// blobs are always removed.
    pub(crate) fn prune(&self, limit: ByteCount) -> Result<PruneReport> {
        let mut state = self.state.lock();
        let mut report = PruneReport::default();
        let mut refcounts = state.index.blob_refcounts();

        for path in files_under(self.layout.objects_dir()) {
            let orphan = digest_from_blob_path(&path).map_or(true, |d| !refcounts.contains_key(&d));
            if orphan {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if fs::remove_file(&path).is_ok() {
                    report.removed_blobs += 1;
                    report.reclaimed_bytes += ByteCount::new(size);
                }
            }
        }

        let active = state.active_epoch;
        let policy = create_eviction_policy(self.eviction, 0);
        let mut candidates: BTreeMap<String, CacheKey> = BTreeMap::new();
        for (key, record) in &state.index.entries {
            report.scanned += 1;
            let in_use = active.is_some_and(|epoch| {
                record.last_epoch == epoch || state.index.pins.get(key) == Some(&epoch)
            });
            if in_use {
                report.skipped_pinned += 1;
                continue;
            }
            let name = key.to_string();
            policy.on_restore(&name, record.size(), record.last_access, record.access_count);
            candidates.insert(name, *key);
        }

        let mut total: u64 = refcounts.values().map(|(_, size)| size).sum();
        let mut removed_keys: HashSet<CacheKey> = HashSet::new();
        while total > limit.bytes() {
            let Some(victim) = policy.next_eviction() else {
                break;
            };
            policy.on_remove(&victim);
            let Some(key) = candidates.remove(&victim) else {
                continue;
            };
            let Some(record) = state.index.entries.remove(&key) else {
                continue;
            };
            let entry_path = self.layout.entry(&key);
            if let Err(e) = fs::remove_file(&entry_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    state.index.entries.insert(key, record);
                    return Err(CacheError::io(entry_path, "remove evicted entry", e));
                }
            }
            for blob in &record.blobs {
                let Some(count) = refcounts.get_mut(&blob.digest) else {
                    continue;
                };
                count.0 -= 1;
                if count.0 == 0 {
                    refcounts.remove(&blob.digest);
                    let _ = fs::remove_file(self.layout.blob(&blob.digest));
                    report.removed_blobs += 1;
                    report.reclaimed_bytes += ByteCount::new(blob.size);
                    total = total.saturating_sub(blob.size);
                }
            }
            removed_keys.insert(key);
            report.evicted.push(key.to_string());
        }

        if !removed_keys.is_empty() {
            state.index.pins.retain(|key, _| !removed_keys.contains(key));
            state.mutated();
        }
        report.dropped_dependency_sets = state.index.retain_live_dependency_sets();
        if report.dropped_dependency_sets > 0 {
            state.mutated();
        }
        report.final_size = ByteCount::new(total);
        drop(state);
        self.persist_index()?;

        info!(
            evicted = report.evicted.len(),
            reclaimed = %report.reclaimed_bytes,
            final_size = %report.final_size,
            limit = %limit,
            "cache pruned"
        );
        Ok(report)
    }
}
