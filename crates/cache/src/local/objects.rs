//! Blob ingestion and verification

use super::layout::Layout;
use crate::errors::{CacheError, RecoveryHint, Result};
use crate::hashing::hash_file;
use kiln_core::Digest;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A blob copied into the store's tmp area and hashed, waiting to be
/// committed under its digest.
#[derive(Debug)]
pub(crate) struct StagedBlob {
    pub temp_path: PathBuf,
    pub digest: Digest,
    pub size: u64,
    pub executable: bool,
}

/// Copy `source` into `tmp/` and hash the copy. Hashing the copy rather than
/// the source means the recorded digest always describes the stored bytes.
pub(crate) fn stage(layout: &Layout, source: &Path) -> Result<StagedBlob> {
    let metadata = fs::metadata(source).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CacheError::NotCacheable {
            path: source.to_path_buf(),
            reason: "output does not exist".into(),
        },
        _ => CacheError::io(source, "stat output", e),
    })?;
    if !metadata.is_file() {
        return Err(CacheError::NotCacheable {
            path: source.to_path_buf(),
            reason: "output is not a regular file".into(),
        });
    }

    let temp_path = layout.tmp_dir().join(Uuid::new_v4().to_string());
    fs::copy(source, &temp_path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        CacheError::io(source, "copy output into store", e)
    })?;
    let (digest, size) = hash_file(&temp_path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        CacheError::io(&temp_path, "hash staged blob", e)
    })?;

    Ok(StagedBlob {
        temp_path,
        digest,
        size,
        executable: is_executable(&metadata),
    })
}

/// Move a staged blob to its content address. An existing blob with the same
/// digest wins and the staged copy is discarded.
pub(crate) fn commit(layout: &Layout, staged: &StagedBlob) -> Result<()> {
    let target = layout.blob(&staged.digest);
    if fs::metadata(&target).map(|m| m.len() == staged.size).unwrap_or(false) {
        let _ = fs::remove_file(&staged.temp_path);
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, "create shard", e))?;
    }
    make_read_only(&staged.temp_path);
    fs::rename(&staged.temp_path, &target).map_err(|e| {
        let _ = fs::remove_file(&staged.temp_path);
        CacheError::io(&target, "commit blob", e)
    })
}

pub(crate) fn discard(staged: &[StagedBlob]) {
    for blob in staged {
        let _ = fs::remove_file(&blob.temp_path);
    }
}

/// Cheap presence check used on lookup
pub(crate) fn check_present(layout: &Layout, digest: &Digest, size: u64) -> Result<()> {
    let path = layout.blob(digest);
    match fs::metadata(&path) {
        Ok(m) if m.len() == size => Ok(()),
        Ok(m) => Err(CacheError::IntegrityFailure {
            key: digest.to_hex(),
            expected_hash: format!("{size} bytes"),
            actual_hash: format!("{} bytes", m.len()),
            recovery_hint: RecoveryHint::RebuildIndex,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CacheError::corruption(
            digest.to_hex(),
            "blob missing from store",
        )),
        Err(e) => Err(CacheError::io(path, "stat blob", e)),
    }
}

/// Full check: rehash the blob
pub(crate) fn verify(layout: &Layout, digest: &Digest) -> Result<u64> {
    let path = layout.blob(digest);
    let (actual, size) = hash_file(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CacheError::corruption(digest.to_hex(), "blob missing from store"),
        _ => CacheError::io(&path, "hash blob", e),
    })?;
    if actual != *digest {
        return Err(CacheError::IntegrityFailure {
            key: digest.to_hex(),
            expected_hash: digest.to_hex(),
            actual_hash: actual.to_hex(),
            recovery_hint: RecoveryHint::RebuildIndex,
        });
    }
    Ok(size)
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

fn make_read_only(path: &Path) {
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_readonly(true);
        let _ = fs::set_permissions(path, perms);
    }
}
