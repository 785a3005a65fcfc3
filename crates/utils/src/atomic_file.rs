//! Atomic file writes.
//!
//! Every persisted kiln artifact (cache index, entry records, blobs, the
//! signature history, materialized outputs) is written to a temporary file in
//! the destination directory and renamed into place, so readers only ever see
//! complete files.

use kiln_core::{Error, Result};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Temporary sibling path used while writing `path`
pub fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::configuration(format!("no parent directory for {}", path.display())))?;
    Ok(parent.join(format!(".{}.tmp", Uuid::new_v4())))
}

/// Write data to a file atomically by writing to a temporary file and renaming
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = temp_path_for(path)?;
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::file_system(parent, "create parent directory", e))?;
    }

    let written = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::file_system(&temp_path, "create temporary file", e))?;
        file.write_all(content)
            .map_err(|e| Error::file_system(&temp_path, "write temporary file", e))?;
        file.sync_all()
            .map_err(|e| Error::file_system(&temp_path, "sync temporary file", e))
    })();

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    rename_into_place(&temp_path, path)
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_atomic_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::json(format!("serialize {}", path.display()), e))?;
    write_atomic(path, &bytes)
}

/// Copy `source` to `dest` atomically. The copy is writable by its owner
/// regardless of the source's permissions, and executable if requested.
pub fn copy_atomic(source: &Path, dest: &Path, executable: bool) -> Result<u64> {
    let temp_path = temp_path_for(dest)?;
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::file_system(parent, "create parent directory", e))?;
    }
    let copied = fs::copy(source, &temp_path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::file_system(source, "copy", e)
    })?;
    if let Err(err) = set_output_mode(&temp_path, executable) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    rename_into_place(&temp_path, dest)?;
    Ok(copied)
}

/// Hard-link `source` at `dest`, replacing whatever was there.
pub fn hard_link_atomic(source: &Path, dest: &Path) -> Result<()> {
    let temp_path = temp_path_for(dest)?;
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::file_system(parent, "create parent directory", e))?;
    }
    fs::hard_link(source, &temp_path).map_err(|e| Error::file_system(source, "hard link", e))?;
    rename_into_place(&temp_path, dest)
}

fn rename_into_place(temp_path: &Path, path: &Path) -> Result<()> {
    fs::rename(temp_path, path).map_err(|e| {
        let _ = fs::remove_file(temp_path);
        Error::file_system(path, "atomic rename", e)
    })
}

#[cfg(unix)]
fn set_output_mode(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::file_system(path, "set permissions", e))
}

#[cfg(not(unix))]
fn set_output_mode(path: &Path, _executable: bool) -> Result<()> {
    let mut perms = fs::metadata(path)
        .map_err(|e| Error::file_system(path, "stat", e))?
        .permissions();
    perms.set_readonly(false);
    fs::set_permissions(path, perms).map_err(|e| Error::file_system(path, "set permissions", e))
}
