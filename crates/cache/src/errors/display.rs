//! Display implementations for cache errors

use super::types::CacheError;
use std::fmt;

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io {
                path,
                operation,
                source,
                ..
            } => write!(
                f,
                "I/O error during {} on '{}': {}",
                operation,
                path.display(),
                source
            ),
            Self::Serialization {
                key,
                operation,
                source,
                ..
            } => write!(f, "failed to {operation:?} cache record '{key}': {source}"),
            Self::Corruption { key, reason, .. } => {
                write!(f, "cache corruption detected for '{key}': {reason}")
            }
            Self::IntegrityFailure {
                key,
                expected_hash,
                actual_hash,
                ..
            } => write!(
                f,
                "integrity check failed for '{key}': expected {expected_hash}, found {actual_hash}"
            ),
            Self::KeyCollision {
                key,
                existing_payload,
                new_payload,
            } => write!(
                f,
                "cache key collision for '{key}': stored payload {} differs from new payload {}",
                existing_payload.short(),
                new_payload.short()
            ),
            Self::VersionMismatch {
                what,
                expected_version,
                actual_version,
                ..
            } => write!(
                f,
                "{what} has format version {actual_version}, expected {expected_version}"
            ),
            Self::StoreUnavailable {
                store_type, reason, ..
            } => write!(f, "cache store {store_type:?} unavailable: {reason}"),
            Self::Timeout {
                operation,
                duration,
                ..
            } => write!(f, "cache {operation} timed out after {duration:?}"),
            Self::Protocol { message, .. } => write!(f, "cache plugin protocol error: {message}"),
            Self::NotCacheable { path, reason } => {
                write!(f, "output '{}' cannot be cached: {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialization { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
