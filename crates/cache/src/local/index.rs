//! The versioned store index.
//!
//! The index is a derived structure: everything in it except access history,
//! pins and recorded dependency sets can be rebuilt from the entry files.

use crate::key::CacheKey;
use chrono::{DateTime, Utc};
use kiln_core::{Digest, CACHE_FORMAT_VERSION, MAX_DEPENDENCY_SETS_PER_KEY};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BlobRef {
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexRecord {
    pub blobs: Vec<BlobRef>,
    pub created_at: DateTime<Utc>,
    /// Logical clock value of the last hit or store
    pub last_access: u64,
    pub access_count: u64,
    /// Epoch in which the entry was last used
    pub last_epoch: u64,
    /// Base key whose dependency sets lead to this entry
    #[serde(default)]
    pub base: Option<CacheKey>,
}

impl IndexRecord {
    pub fn size(&self) -> u64 {
        self.blobs.iter().map(|b| b.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexFile {
    pub format_version: u32,
    pub clock: u64,
    pub epoch: u64,
    pub entries: BTreeMap<CacheKey, IndexRecord>,
    #[serde(default)]
    pub dependency_sets: BTreeMap<CacheKey, Vec<Vec<String>>>,
    /// key -> epoch it was pinned in
    #[serde(default)]
    pub pins: BTreeMap<CacheKey, u64>,
}

impl Default for IndexFile {
    fn default() -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION,
            clock: 0,
            epoch: 0,
            entries: BTreeMap::new(),
            dependency_sets: BTreeMap::new(),
            pins: BTreeMap::new(),
        }
    }
}

/// Outcome of reading `index.json`
#[derive(Debug)]
pub(crate) enum IndexLoad {
    Missing,
    Loaded(IndexFile),
    Incompatible { found: u32 },
    Unreadable(String),
}

#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

impl IndexFile {
    pub fn parse(bytes: &[u8]) -> IndexLoad {
        match serde_json::from_slice::<VersionProbe>(bytes) {
            Ok(probe) if probe.format_version != CACHE_FORMAT_VERSION => {
                return IndexLoad::Incompatible {
                    found: probe.format_version,
                }
            }
            Ok(_) => {}
            Err(e) => return IndexLoad::Unreadable(e.to_string()),
        }
        match serde_json::from_slice::<IndexFile>(bytes) {
            Ok(index) => IndexLoad::Loaded(index),
            Err(e) => IndexLoad::Unreadable(e.to_string()),
        }
    }

    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn touch(&mut self, key: &CacheKey, epoch: Option<u64>) {
        let tick = self.tick();
        if let Some(record) = self.entries.get_mut(key) {
            record.last_access = tick;
            record.access_count += 1;
            if let Some(epoch) = epoch {
                record.last_epoch = epoch;
            }
        }
    }

    pub fn record_dependency_set(&mut self, base: CacheKey, paths: Vec<String>) {
        let sets = self.dependency_sets.entry(base).or_default();
        sets.retain(|existing| *existing != paths);
        sets.insert(0, paths);
        sets.truncate(MAX_DEPENDENCY_SETS_PER_KEY);
    }

    /// Forget dependency sets of base keys no remaining entry was stored
    /// under. Returns how many base keys were dropped.
    pub fn retain_live_dependency_sets(&mut self) -> usize {
        let live: HashSet<CacheKey> = self.entries.values().filter_map(|r| r.base).collect();
        let before = self.dependency_sets.len();
        self.dependency_sets.retain(|base, _| live.contains(base));
        before - self.dependency_sets.len()
    }

    /// Reference counts of every blob named by an index record
    pub fn blob_refcounts(&self) -> HashMap<Digest, (usize, u64)> {
        let mut counts: HashMap<Digest, (usize, u64)> = HashMap::new();
        for record in self.entries.values() {
            for blob in &record.blobs {
                counts.entry(blob.digest).or_insert((0, blob.size)).0 += 1;
            }
        }
        counts
    }

    /// Bytes of all distinct referenced blobs
    pub fn referenced_bytes(&self) -> u64 {
        self.blob_refcounts().values().map(|(_, size)| size).sum()
    }
}
