//! Persisted per-task signature records.
//!
//! The history is what makes a null build cheap: a task whose recorded
//! cheap signature still matches the filesystem is up to date without
//! hashing a single input.

use crate::definition::TaskIdentity;
use dashmap::DashMap;
use kiln_cache::CacheKey;
use kiln_core::{Digest, Result, SIGNATURE_HISTORY_VERSION};
use kiln_utils::write_atomic_json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// What the last successful run of a task looked like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Metadata signature over inputs, discovered inputs and outputs
    pub cheap: Digest,
    /// Signature in the configured mode over declared and discovered inputs
    pub signature: Digest,
    /// Dependencies the process reported on that run
    #[serde(default)]
    pub discovered_inputs: Vec<PathBuf>,
    /// Cache key the outputs were stored or found under
    #[serde(default)]
    pub cache_key: Option<CacheKey>,
}

#[derive(Serialize, Deserialize)]
struct HistoryFile {
    format_version: u32,
    records: BTreeMap<TaskIdentity, SignatureRecord>,
}

/// Signature records keyed by task identity
#[derive(Debug)]
pub struct SignatureHistory {
    path: Option<PathBuf>,
    records: DashMap<TaskIdentity, SignatureRecord>,
    dirty: AtomicBool,
}

impl SignatureHistory {
    /// History that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: DashMap::new(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the history at `path`. A missing file is an empty history; an
    /// unreadable or incompatible one is discarded with a warning and every
    /// task is treated as never built.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut records = DashMap::new();

        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HistoryFile>(&bytes) {
                Ok(file) if file.format_version == SIGNATURE_HISTORY_VERSION => {
                    debug!(path = %path.display(), records = file.records.len(), "loaded signature history");
                    records.extend(file.records);
                }
                Ok(file) => warn!(
                    path = %path.display(),
                    found = file.format_version,
                    expected = SIGNATURE_HISTORY_VERSION,
                    "signature history has an incompatible format; starting empty"
                ),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "signature history is unreadable; starting empty"
                ),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "cannot read signature history; starting empty"
            ),
        }

        Self {
            path: Some(path),
            records,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, identity: &TaskIdentity) -> Option<SignatureRecord> {
        self.records.get(identity).map(|r| r.value().clone())
    }

    pub fn record(&self, identity: TaskIdentity, record: SignatureRecord) {
        self.records.insert(identity, record);
        self.dirty.store(true, Ordering::Release);
    }

    /// Forget a task, forcing it to run next time even if this build is
    /// interrupted before it finishes
    pub fn remove(&self, identity: &TaskIdentity) {
        if self.records.remove(identity).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the history if anything changed since the last flush
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let file = HistoryFile {
            format_version: SIGNATURE_HISTORY_VERSION,
            records: self
                .records
                .iter()
                .map(|r| (r.key().clone(), r.value().clone()))
                .collect(),
        };
        if let Err(e) = write_atomic_json(path, &file) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(path = %path.display(), records = file.records.len(), "flushed signature history");
        Ok(())
    }
}
