//! Cache error type definitions

use kiln_core::Digest;
use std::path::PathBuf;
use std::time::Duration;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for cache operations.
///
/// Every variant carries a [`RecoveryHint`] describing what the caller can do
/// about it. Only [`CacheError::KeyCollision`] is fatal to a build; all other
/// cache failures degrade to a miss.
#[derive(Debug)]
pub enum CacheError {
    /// I/O errors during cache operations
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
        recovery_hint: RecoveryHint,
    },

    /// Serialization/deserialization errors
    Serialization {
        key: String,
        operation: SerializationOp,
        source: Box<dyn std::error::Error + Send + Sync>,
        recovery_hint: RecoveryHint,
    },

    /// Cache corruption detected
    Corruption {
        key: String,
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// Blob content does not match its digest
    IntegrityFailure {
        key: String,
        expected_hash: String,
        actual_hash: String,
        recovery_hint: RecoveryHint,
    },

    /// A byte-different payload was stored under an existing key
    KeyCollision {
        key: String,
        existing_payload: Digest,
        new_payload: Digest,
    },

    /// On-disk format written by an incompatible version
    VersionMismatch {
        what: String,
        expected_version: u32,
        actual_version: u32,
        recovery_hint: RecoveryHint,
    },

    /// Cache store unavailable
    StoreUnavailable {
        store_type: StoreType,
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// Timeout during cache operation
    Timeout {
        operation: &'static str,
        duration: Duration,
        recovery_hint: RecoveryHint,
    },

    /// The plugin process answered something we do not understand
    Protocol {
        message: String,
        recovery_hint: RecoveryHint,
    },

    /// An output cannot be captured (missing, not a regular file)
    NotCacheable { path: PathBuf, reason: String },
}

/// Serialization direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationOp {
    Encode,
    Decode,
}

/// Kind of store an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Local,
    Plugin,
}

/// What the caller can do about an error
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryHint {
    /// Retry the operation after a delay
    Retry { after: Duration },

    /// Clear the cache and retry
    ClearAndRetry,

    /// Rebuild the cache index from the entry files
    RebuildIndex,

    /// Evict entries to free space
    RunEviction,

    /// Check file permissions
    CheckPermissions { path: PathBuf },

    /// No automated recovery possible
    Manual { instructions: String },

    /// Operation can be safely ignored (treated as a miss)
    Ignore,
}

impl CacheError {
    /// Recovery hint for this error
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            CacheError::Io { recovery_hint, .. }
            | CacheError::Serialization { recovery_hint, .. }
            | CacheError::Corruption { recovery_hint, .. }
            | CacheError::IntegrityFailure { recovery_hint, .. }
            | CacheError::VersionMismatch { recovery_hint, .. }
            | CacheError::StoreUnavailable { recovery_hint, .. }
            | CacheError::Timeout { recovery_hint, .. }
            | CacheError::Protocol { recovery_hint, .. } => recovery_hint.clone(),
            CacheError::KeyCollision { .. } => RecoveryHint::Manual {
                instructions: "a task produced different outputs for identical inputs; \
                               mark it non-cacheable or clear the cache"
                    .to_string(),
            },
            CacheError::NotCacheable { .. } => RecoveryHint::Ignore,
        }
    }

    /// Whether the build must stop trusting the cache
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::KeyCollision { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        let path = path.into();
        let recovery_hint = if source.kind() == std::io::ErrorKind::PermissionDenied {
            RecoveryHint::CheckPermissions { path: path.clone() }
        } else {
            RecoveryHint::Retry {
                after: Duration::from_millis(100),
            }
        };
        CacheError::Io {
            path,
            operation,
            source,
            recovery_hint,
        }
    }

    pub(crate) fn decode(key: impl Into<String>, source: serde_json::Error) -> Self {
        CacheError::Serialization {
            key: key.into(),
            operation: SerializationOp::Decode,
            source: Box::new(source),
            recovery_hint: RecoveryHint::RebuildIndex,
        }
    }

    pub(crate) fn encode(key: impl Into<String>, source: serde_json::Error) -> Self {
        CacheError::Serialization {
            key: key.into(),
            operation: SerializationOp::Encode,
            source: Box::new(source),
            recovery_hint: RecoveryHint::Ignore,
        }
    }

    pub(crate) fn corruption(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::Corruption {
            key: key.into(),
            reason: reason.into(),
            recovery_hint: RecoveryHint::RebuildIndex,
        }
    }
}

impl From<kiln_core::Error> for CacheError {
    fn from(error: kiln_core::Error) -> Self {
        match error {
            kiln_core::Error::FileSystem {
                path, source, ..
            } => CacheError::io(path, "file system", source),
            other => CacheError::Corruption {
                key: String::new(),
                reason: other.to_string(),
                recovery_hint: RecoveryHint::Ignore,
            },
        }
    }
}

impl From<CacheError> for kiln_core::Error {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Io {
                path,
                operation,
                source,
                ..
            } => kiln_core::Error::file_system(path, operation, source),
            other => kiln_core::Error::cache(other.to_string()),
        }
    }
}
