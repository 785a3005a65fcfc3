//! Task signatures.
//!
//! A signature is a SHA-256 digest over everything that can change a task's
//! result: its command line, environment, working directory and a stamp for
//! every input. Stamps come in two flavours selected by [`SignatureMode`]:
//! cheap filesystem metadata or full content digests.
//!
//! The byte layout is fixed: a domain tag and format version, then each
//! field length-prefixed, integers little-endian, inputs in declaration
//! order. Reordering inputs changes the signature.

use crate::definition::Task;
use crate::errors::SignatureError;
use kiln_cache::hashing::hash_file;
use kiln_cache::CacheKey;
use kiln_config::SignatureMode;
use kiln_core::{Digest, DigestBuilder, SIGNATURE_FORMAT_VERSION};
use kiln_utils::PathRemapper;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

type Result<T> = std::result::Result<T, SignatureError>;

const SIGNATURE_DOMAIN: &str = "kiln-signature";
const DEPENDENCY_DOMAIN: &str = "kiln-discovered-set";

/// Observed state of one input path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputStamp {
    /// The path does not exist. Absence is part of the signature.
    Absent { path: PathBuf },
    Metadata {
        path: PathBuf,
        dev: u64,
        inode: u64,
        size: u64,
        mtime_secs: i64,
        mtime_nanos: u32,
    },
    Content {
        path: PathBuf,
        size: u64,
        digest: Digest,
    },
    /// A directory input; its member files follow as separate stamps
    Directory { path: PathBuf, members: u64 },
}

impl InputStamp {
    pub fn path(&self) -> &Path {
        match self {
            InputStamp::Absent { path }
            | InputStamp::Metadata { path, .. }
            | InputStamp::Content { path, .. }
            | InputStamp::Directory { path, .. } => path,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            InputStamp::Absent { .. } => 0,
            InputStamp::Metadata { .. } => 1,
            InputStamp::Content { .. } => 2,
            InputStamp::Directory { .. } => 3,
        }
    }

    fn hash_into(&self, builder: &mut DigestBuilder, remap: Option<&PathRemapper>) {
        builder.add_u8(self.tag());
        builder.add_str(&remap_path(self.path(), remap));
        match self {
            InputStamp::Absent { .. } => {}
            InputStamp::Metadata {
                dev,
                inode,
                size,
                mtime_secs,
                mtime_nanos,
                ..
            } => {
                builder
                    .add_u64(*dev)
                    .add_u64(*inode)
                    .add_u64(*size)
                    .add_i64(*mtime_secs)
                    .add_u32(*mtime_nanos);
            }
            InputStamp::Content { size, digest, .. } => {
                builder.add_u64(*size).add_digest(digest);
            }
            InputStamp::Directory { members, .. } => {
                builder.add_u64(*members);
            }
        }
    }
}

fn remap_path(path: &Path, remap: Option<&PathRemapper>) -> String {
    match remap {
        Some(remapper) => remapper.remap_path(path),
        None => path.to_string_lossy().into_owned(),
    }
}

fn remap_text(text: &str, remap: Option<&PathRemapper>) -> String {
    match remap {
        Some(remapper) => remapper.remap_text(text),
        None => text.to_string(),
    }
}

/// Stamp every path in order.
///
/// Missing paths produce [`InputStamp::Absent`]. A path that cannot be read
/// for any other reason fails the whole resolution.
pub fn resolve_inputs(paths: &[PathBuf], mode: SignatureMode) -> Result<Vec<InputStamp>> {
    let mut stamps = Vec::with_capacity(paths.len());
    for path in paths {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                stamps.push(InputStamp::Absent { path: path.clone() });
                continue;
            }
            Err(e) => return Err(SignatureError::from_io(path, e)),
        };

        if metadata.is_dir() {
            let mut members = Vec::new();
            for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let member = e.path().map(Path::to_path_buf).unwrap_or_else(|| path.clone());
                    let io = e.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "directory loop")
                    });
                    SignatureError::from_io(member, io)
                })?;
                if entry.file_type().is_file() {
                    members.push(entry.into_path());
                }
            }
            stamps.push(InputStamp::Directory {
                path: path.clone(),
                members: members.len() as u64,
            });
            for member in members {
                let metadata = fs::metadata(&member).map_err(|e| SignatureError::from_io(&member, e))?;
                stamps.push(stamp_file(member, &metadata, mode)?);
            }
        } else {
            stamps.push(stamp_file(path.clone(), &metadata, mode)?);
        }
    }
    Ok(stamps)
}

fn stamp_file(path: PathBuf, metadata: &fs::Metadata, mode: SignatureMode) -> Result<InputStamp> {
    match mode {
        SignatureMode::Metadata => {
            let (mtime_secs, mtime_nanos) = mtime(metadata);
            let (dev, inode) = device_and_inode(metadata);
            Ok(InputStamp::Metadata {
                path,
                dev,
                inode,
                size: metadata.len(),
                mtime_secs,
                mtime_nanos,
            })
        }
        SignatureMode::Content => {
            let (digest, size) = hash_file(&path).map_err(|e| SignatureError::from_io(&path, e))?;
            Ok(InputStamp::Content { path, size, digest })
        }
    }
}

fn mtime(metadata: &fs::Metadata) -> (i64, u32) {
    match metadata.modified() {
        Ok(time) => match time.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => (-(e.duration().as_secs() as i64), e.duration().subsec_nanos()),
        },
        Err(_) => (0, 0),
    }
}

#[cfg(unix)]
fn device_and_inode(metadata: &fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn device_and_inode(_metadata: &fs::Metadata) -> (u64, u64) {
    (0, 0)
}

/// Computes the signatures the scheduler compares and the cache keys it
/// looks up.
#[derive(Debug, Clone)]
pub struct SignatureEngine {
    mode: SignatureMode,
    remapper: PathRemapper,
}

impl SignatureEngine {
    pub fn new(mode: SignatureMode, remapper: PathRemapper) -> Self {
        Self { mode, remapper }
    }

    pub fn mode(&self) -> SignatureMode {
        self.mode
    }

    pub fn remapper(&self) -> &PathRemapper {
        &self.remapper
    }

    /// Hash a task's static fields and the given stamps
    pub fn signature(task: &Task, stamps: &[InputStamp], remap: Option<&PathRemapper>) -> Digest {
        let mut builder = DigestBuilder::with_domain(SIGNATURE_DOMAIN);
        builder.add_u32(SIGNATURE_FORMAT_VERSION);
        builder.add_str(task.rule());

        builder.add_u64(task.command_line().len() as u64);
        for arg in task.command_line() {
            builder.add_str(&remap_text(arg, remap));
        }

        builder.add_u64(task.environment().len() as u64);
        for (key, value) in task.environment() {
            builder.add_str(key).add_str(&remap_text(value, remap));
        }

        builder.add_str(&remap_path(task.working_directory(), remap));

        builder.add_u64(stamps.len() as u64);
        for stamp in stamps {
            stamp.hash_into(&mut builder, remap);
        }
        builder.finish()
    }

    /// Metadata-only signature over declared inputs, previously discovered
    /// inputs and declared outputs. Cheap enough to compute for every task
    /// on every build.
    pub fn cheap_signature(&self, task: &Task, discovered: &[PathBuf]) -> Result<Digest> {
        let paths: Vec<PathBuf> = task
            .declared_inputs()
            .iter()
            .chain(discovered)
            .chain(task.declared_outputs())
            .cloned()
            .collect();
        let stamps = resolve_inputs(&paths, SignatureMode::Metadata)?;
        Ok(Self::signature(task, &stamps, None))
    }

    /// Signature in the configured mode over declared and discovered inputs
    pub fn full_signature(&self, task: &Task, discovered: &[PathBuf]) -> Result<Digest> {
        let paths: Vec<PathBuf> = task
            .declared_inputs()
            .iter()
            .chain(discovered)
            .cloned()
            .collect();
        let stamps = resolve_inputs(&paths, self.mode)?;
        Ok(Self::signature(task, &stamps, None))
    }

    /// Cache key before discovered dependencies are known: content stamps of
    /// declared inputs with host-specific prefixes remapped
    pub fn base_key(&self, task: &Task) -> Result<CacheKey> {
        let stamps = resolve_inputs(task.declared_inputs(), SignatureMode::Content)?;
        let signature = Self::signature(task, &stamps, Some(&self.remapper));
        Ok(CacheKey::base(&signature))
    }

    /// Digest of a discovered-dependency set: remapped path and content
    /// stamp of each member, in order
    pub fn dependency_digest(&self, paths: &[PathBuf]) -> Result<Digest> {
        let stamps = resolve_inputs(paths, SignatureMode::Content)?;
        let mut builder = DigestBuilder::with_domain(DEPENDENCY_DOMAIN);
        builder.add_u64(stamps.len() as u64);
        for stamp in &stamps {
            stamp.hash_into(&mut builder, Some(&self.remapper));
        }
        Ok(builder.finish())
    }

    /// Final cache key for `base` extended by the discovered set
    pub fn cache_key(&self, base: &CacheKey, discovered: &[PathBuf]) -> Result<CacheKey> {
        Ok(base.extend(&self.dependency_digest(discovered)?))
    }

    pub fn remap(&self, path: &Path) -> String {
        self.remapper.remap_path(path)
    }

    pub fn unmap(&self, remapped: &str) -> PathBuf {
        self.remapper.unmap(remapped)
    }
}
