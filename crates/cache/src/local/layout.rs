//! On-disk layout of the local store

use crate::key::CacheKey;
use kiln_core::Digest;
use std::path::{Path, PathBuf};

pub(crate) const INDEX_FILE: &str = "index.json";
const ENTRIES_DIR: &str = "entries";
const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// ```text
/// <root>/index.json
/// <root>/entries/<aa>/<key>.json
/// <root>/objects/<aa>/<digest>
/// <root>/tmp/
/// ```
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn entries_dir(&self) -> PathBuf {
        self.root.join(ENTRIES_DIR)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join(OBJECTS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub fn entry(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir()
            .join(key.shard())
            .join(format!("{key}.json"))
    }

    pub fn blob(&self, digest: &Digest) -> PathBuf {
        self.objects_dir()
            .join(digest.shard())
            .join(digest.to_hex())
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [self.entries_dir(), self.objects_dir(), self.tmp_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Parse `<key>.json` back into a key
pub(crate) fn key_from_entry_path(path: &Path) -> Option<CacheKey> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".json")?.parse().ok()
}

/// Parse an object file name back into a digest
pub(crate) fn digest_from_blob_path(path: &Path) -> Option<Digest> {
    path.file_name()?.to_str()?.parse().ok()
}
