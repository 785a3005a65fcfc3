//! Cache entries: what a key maps to

use crate::key::CacheKey;
use chrono::{DateTime, Utc};
use kiln_core::{ByteCount, Digest, DigestBuilder, CACHE_FORMAT_VERSION};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One captured output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBlob {
    /// Declared output path after prefix remapping
    pub path: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default)]
    pub executable: bool,
}

/// Side information stored next to the outputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Rule type of the task that produced the entry
    pub rule: String,
    /// Identity of the producing task
    pub task: String,
    /// Captured diagnostics text, replayed on a hit
    #[serde(default)]
    pub diagnostics: String,
    /// Remapped discovered-input paths, used to extend later signatures
    #[serde(default)]
    pub discovered_inputs: Vec<String>,
    /// Key before discovered inputs were folded in; owns the recorded
    /// dependency sets this entry was found through
    #[serde(default)]
    pub base_key: Option<CacheKey>,
}

/// A stored cache entry. Write-once: the payload never changes after it is
/// first recorded under a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub format_version: u32,
    pub key: CacheKey,
    pub outputs: Vec<OutputBlob>,
    pub metadata: EntryMetadata,
    /// Digest over the ordered outputs; equal payloads have equal digests
    pub payload_digest: Digest,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, outputs: Vec<OutputBlob>, metadata: EntryMetadata) -> Self {
        let payload_digest = payload_digest(&outputs);
        Self {
            format_version: CACHE_FORMAT_VERSION,
            key,
            outputs,
            metadata,
            payload_digest,
            created_at: Utc::now(),
        }
    }

    pub fn total_size(&self) -> ByteCount {
        self.outputs.iter().map(|o| ByteCount::new(o.size)).sum()
    }

    /// Whether the recorded payload digest agrees with the outputs
    pub fn is_consistent(&self) -> bool {
        self.payload_digest == payload_digest(&self.outputs)
    }
}

/// Digest over the ordered output list. Diagnostics are excluded because
/// they may legitimately differ between equivalent runs.
pub fn payload_digest(outputs: &[OutputBlob]) -> Digest {
    let mut builder = DigestBuilder::with_domain("kiln-cache-payload");
    builder.add_u64(outputs.len() as u64);
    for output in outputs {
        builder
            .add_str(&output.path)
            .add_digest(&output.digest)
            .add_u64(output.size)
            .add_bool(output.executable);
    }
    builder.finish()
}

/// An output file on disk that should be captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSource {
    /// Where the file lives on this host
    pub local_path: PathBuf,
    /// Remapped path recorded in the entry
    pub logical_path: String,
}

/// Everything `store` needs to create an entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryDraft {
    pub outputs: Vec<OutputSource>,
    pub metadata: EntryMetadata,
}
