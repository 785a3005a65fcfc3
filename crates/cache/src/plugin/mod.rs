//! Out-of-process cache backend.
//!
//! The plugin is an arbitrary executable that answers [`protocol::Request`]s
//! on stdout. It is started lazily on first use and restarted after a broken
//! pipe. Entries stored through a plugin are not visible to the local store
//! and vice versa.

pub mod protocol;

use crate::backend::{
    CacheBackend, Epoch, PruneReport, RecoveryReport, StoreOutcome, StoreUsage, ValidationReport,
};
use crate::entry::{CacheEntry, EntryDraft, OutputBlob};
use crate::errors::{CacheError, RecoveryHint, Result, StoreType};
use crate::key::CacheKey;
use async_trait::async_trait;
use kiln_config::MaterializeMode;
use kiln_core::ByteCount;
use protocol::{decode_response, encode_request, into_result, BlobPayload, Request};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Connection {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

pub struct PluginCas {
    command: String,
    args: Vec<String>,
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for PluginCas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCas")
            .field("command", &self.command)
            .field("args", &self.args)
            .finish()
    }
}

fn unavailable(reason: impl Into<String>) -> CacheError {
    CacheError::StoreUnavailable {
        store_type: StoreType::Plugin,
        reason: reason.into(),
        recovery_hint: RecoveryHint::Retry {
            after: Duration::from_secs(1),
        },
    }
}

impl PluginCas {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            connection: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<Connection> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable(format!("failed to start cache plugin {}: {e}", self.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| unavailable("cache plugin stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable("cache plugin stdout unavailable"))?;
        debug!(command = %self.command, "started cache plugin");
        Ok(Connection {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let line = encode_request(&request)?;
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(unavailable("cache plugin not running"));
        };

        let exchanged = async {
            connection.stdin.write_all(line.as_bytes()).await?;
            connection.stdin.flush().await?;
            connection.stdout.next_line().await
        }
        .await;

        let reply = match exchanged {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                *guard = None;
                return Err(unavailable("cache plugin closed its output"));
            }
            Err(e) => {
                warn!(command = %self.command, error = %e, "cache plugin connection lost");
                *guard = None;
                return Err(unavailable(format!("cache plugin I/O failed: {e}")));
            }
        };
        drop(guard);

        into_result(&request, decode_response(&reply)?)
    }
}

async fn read_output(source: &Path) -> Result<(Vec<u8>, bool)> {
    let metadata = tokio::fs::metadata(source).await.map_err(|e| match e.kind() {
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
    let bytes = tokio::fs::read(source)
        .await
        .map_err(|e| CacheError::io(source, "read output", e))?;
    Ok((bytes, is_executable(&metadata)))
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl CacheBackend for PluginCas {
    fn name(&self) -> &'static str {
        "plugin"
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let entry: Option<CacheEntry> = self.call(Request::Lookup { key: *key }).await?;
        match entry {
            Some(entry) if entry.key != *key || !entry.is_consistent() => Err(CacheError::corruption(
                key.to_string(),
                "plugin returned an inconsistent entry",
            )),
            other => Ok(other),
        }
    }

    async fn store(&self, key: &CacheKey, draft: EntryDraft) -> Result<StoreOutcome> {
        let mut outputs = Vec::with_capacity(draft.outputs.len());
        let mut blobs = Vec::with_capacity(draft.outputs.len());
        for source in &draft.outputs {
            let (bytes, executable) = read_output(&source.local_path).await?;
            let payload = BlobPayload::encode(&bytes);
            outputs.push(OutputBlob {
                path: source.logical_path.clone(),
                digest: payload.digest,
                size: bytes.len() as u64,
                executable,
            });
            if !blobs.iter().any(|b: &BlobPayload| b.digest == payload.digest) {
                blobs.push(payload);
            }
        }
        let entry = CacheEntry::new(*key, outputs, draft.metadata);
        self.call(Request::Store {
            key: *key,
            entry,
            blobs,
        })
        .await
    }

    async fn materialize(
        &self,
        entry: &CacheEntry,
        destinations: &[PathBuf],
        _mode: MaterializeMode,
    ) -> Result<ByteCount> {
        if destinations.len() != entry.outputs.len() {
            return Err(CacheError::corruption(
                entry.key.to_string(),
                "output count does not match destinations",
            ));
        }
        let mut written = ByteCount::ZERO;
        for (output, dest) in entry.outputs.iter().zip(destinations) {
            let payload: BlobPayload = self.call(Request::Fetch { digest: output.digest }).await?;
            if payload.digest != output.digest {
                return Err(CacheError::corruption(
                    entry.key.to_string(),
                    "plugin returned a different blob than requested",
                ));
            }
            let bytes = payload.decode()?;
            kiln_utils::write_atomic(dest, &bytes)?;
            if output.executable {
                set_executable(dest).map_err(|e| CacheError::io(dest, "set executable", e))?;
            }
            written += ByteCount::new(bytes.len() as u64);
        }
        Ok(written)
    }

    async fn dependency_sets(&self, base: &CacheKey) -> Result<Vec<Vec<String>>> {
        self.call(Request::DependencySets { base: *base }).await
    }

    async fn record_dependency_set(&self, base: &CacheKey, paths: Vec<String>) -> Result<()> {
        self.call(Request::RecordDependencySet { base: *base, paths })
            .await
    }

    async fn validate(&self) -> Result<ValidationReport> {
        self.call(Request::Validate).await
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        self.call(Request::Recover).await
    }

    async fn prune(&self, limit: ByteCount) -> Result<PruneReport> {
        self.call(Request::Prune {
            limit: limit.bytes(),
        })
        .await
    }

    async fn begin_epoch(&self) -> Result<Epoch> {
        self.call(Request::BeginEpoch).await
    }

    async fn pin(&self, key: &CacheKey) -> Result<()> {
        self.call(Request::Pin { key: *key }).await
    }

    async fn end_epoch(&self) -> Result<()> {
        self.call(Request::EndEpoch).await
    }

    async fn usage(&self) -> Result<StoreUsage> {
        self.call(Request::Usage).await
    }

    async fn flush(&self) -> Result<()> {
        self.call(Request::Flush).await
    }
}
