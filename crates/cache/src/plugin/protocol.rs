//! Wire format spoken with a cache plugin.
//!
//! One JSON object per line in each direction. Requests are tagged by `op`,
//! responses by `status`. Blob bytes travel base64-encoded.

use crate::entry::CacheEntry;
use crate::errors::{CacheError, RecoveryHint, Result};
use crate::key::CacheKey;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use kiln_core::Digest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPayload {
    pub digest: Digest,
    pub data: String,
}

impl BlobPayload {
    pub fn encode(bytes: &[u8]) -> Self {
        Self {
            digest: Digest::of(bytes),
            data: BASE64_STANDARD.encode(bytes),
        }
    }

    /// Decode and check the bytes against the advertised digest
    pub fn decode(&self) -> Result<Vec<u8>> {
        let bytes = BASE64_STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| protocol_error(format!("invalid base64 for blob {}: {e}", self.digest.short())))?;
        let actual = Digest::of(&bytes);
        if actual != self.digest {
            return Err(CacheError::IntegrityFailure {
                key: self.digest.to_hex(),
                expected_hash: self.digest.to_hex(),
                actual_hash: actual.to_hex(),
                recovery_hint: RecoveryHint::Ignore,
            });
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Lookup { key: CacheKey },
    Store {
        key: CacheKey,
        entry: CacheEntry,
        blobs: Vec<BlobPayload>,
    },
    Fetch { digest: Digest },
    DependencySets { base: CacheKey },
    RecordDependencySet { base: CacheKey, paths: Vec<String> },
    Validate,
    Recover,
    Prune { limit: u64 },
    BeginEpoch,
    Pin { key: CacheKey },
    EndEpoch,
    Usage,
    Flush,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Lookup { .. } => "lookup",
            Request::Store { .. } => "store",
            Request::Fetch { .. } => "fetch",
            Request::DependencySets { .. } => "dependency_sets",
            Request::RecordDependencySet { .. } => "record_dependency_set",
            Request::Validate => "validate",
            Request::Recover => "recover",
            Request::Prune { .. } => "prune",
            Request::BeginEpoch => "begin_epoch",
            Request::Pin { .. } => "pin",
            Request::EndEpoch => "end_epoch",
            Request::Usage => "usage",
            Request::Flush => "flush",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default)]
        result: serde_json::Value,
    },
    /// The plugin already holds a different payload for the key
    Collision { existing_payload: Digest },
    Error { message: String },
}

pub fn encode_request(request: &Request) -> Result<String> {
    let mut line = serde_json::to_string(request).map_err(|e| CacheError::encode(request.op(), e))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_response(line: &str) -> Result<Response> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| protocol_error(format!("malformed plugin response: {e}")))
}

/// Interpret a response to `request` as `T`
pub fn into_result<T: DeserializeOwned>(request: &Request, response: Response) -> Result<T> {
    match response {
        Response::Ok { result } => serde_json::from_value(result)
            .map_err(|e| protocol_error(format!("unexpected result for {}: {e}", request.op()))),
        Response::Collision { existing_payload } => match request {
            Request::Store { key, entry, .. } => Err(CacheError::KeyCollision {
                key: key.to_string(),
                existing_payload,
                new_payload: entry.payload_digest,
            }),
            other => Err(protocol_error(format!(
                "collision reported for {} request",
                other.op()
            ))),
        },
        Response::Error { message } => Err(protocol_error(format!("{} failed: {message}", request.op()))),
    }
}

pub(crate) fn protocol_error(message: impl Into<String>) -> CacheError {
    CacheError::Protocol {
        message: message.into(),
        recovery_hint: RecoveryHint::Ignore,
    }
}
