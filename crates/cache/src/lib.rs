//! Content-addressable build cache for kiln.
//!
//! A [`CacheBackend`] maps [`CacheKey`]s to write-once [`CacheEntry`]
//! records whose outputs are stored as content-addressed blobs. Two backends
//! are provided: [`LocalCas`] on the local filesystem and [`PluginCas`]
//! talking to an external process.

pub mod backend;
pub mod entry;
pub mod errors;
pub mod eviction;
pub mod hashing;
pub mod key;
pub mod local;
pub mod lookup;
pub mod plugin;

pub use backend::{
    CacheBackend, Epoch, PruneReport, RecoveryReport, StoreOutcome, StoreUsage, ValidationReport,
};
pub use entry::{payload_digest, CacheEntry, EntryDraft, EntryMetadata, OutputBlob, OutputSource};
pub use errors::{CacheError, RecoveryHint, Result, StoreType};
pub use eviction::{create_eviction_policy, EvictionPolicy};
pub use key::CacheKey;
pub use local::LocalCas;
pub use lookup::{bounded_lookup, CacheLookup, LookupResolution, MissReason};
pub use plugin::PluginCas;

use kiln_config::{BuildConfig, CacheBackendConfig};
use std::path::Path;
use std::sync::Arc;

/// Open the backend configured in `config`, resolving relative paths
/// against `base`.
pub fn open_backend(config: &BuildConfig, base: &Path) -> Result<Arc<dyn CacheBackend>> {
    match &config.cache.backend {
        CacheBackendConfig::Local { .. } => {
            let root = config.cache_root(base);
            let cas = LocalCas::open(root, config.cache.eviction)?;
            if let Some(report) = cas.startup_recovery() {
                tracing::warn!(
                    recovered = report.recovered_entries,
                    dropped = report.dropped_entries.len(),
                    "cache index was rebuilt on open"
                );
            }
            Ok(Arc::new(cas))
        }
        CacheBackendConfig::Plugin { command, args } => {
            Ok(Arc::new(PluginCas::new(command.clone(), args.clone())))
        }
    }
}
