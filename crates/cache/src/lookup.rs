//! Per-task cache lookup state machine.
//!
//! `NotQueried → Queried → {Hit, Miss}`, enforced with phantom types so a
//! lookup can only be resolved once and only after it was issued.

use crate::backend::CacheBackend;
use crate::entry::CacheEntry;
use crate::key::CacheKey;
use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Phantom marker: no query issued yet
#[derive(Debug)]
pub struct NotQueried;

/// Phantom marker: query in flight
#[derive(Debug)]
pub struct Queried;

/// Why a lookup did not produce a usable entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    NotFound,
    TimedOut(Duration),
    BackendError(String),
    /// Entry found but its outputs could not be materialized
    Unusable(String),
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::NotFound => f.write_str("not found"),
            MissReason::TimedOut(d) => write!(f, "lookup timed out after {}ms", d.as_millis()),
            MissReason::BackendError(e) => write!(f, "backend error: {e}"),
            MissReason::Unusable(e) => write!(f, "entry unusable: {e}"),
        }
    }
}

/// Terminal state of a lookup
#[derive(Debug)]
pub enum LookupResolution {
    Hit {
        key: CacheKey,
        entry: Box<CacheEntry>,
        elapsed: Duration,
    },
    Miss {
        key: CacheKey,
        reason: MissReason,
        elapsed: Duration,
    },
}

impl LookupResolution {
    pub fn is_hit(&self) -> bool {
        matches!(self, LookupResolution::Hit { .. })
    }

    pub fn key(&self) -> &CacheKey {
        match self {
            LookupResolution::Hit { key, .. } | LookupResolution::Miss { key, .. } => key,
        }
    }
}

#[derive(Debug)]
pub struct CacheLookup<State = NotQueried> {
    key: CacheKey,
    started: Option<Instant>,
    _state: PhantomData<State>,
}

impl CacheLookup<NotQueried> {
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            started: None,
            _state: PhantomData,
        }
    }

    /// Mark the query as issued
    pub fn issue(self) -> CacheLookup<Queried> {
        CacheLookup {
            key: self.key,
            started: Some(Instant::now()),
            _state: PhantomData,
        }
    }
}

impl<S> CacheLookup<S> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl CacheLookup<Queried> {
    fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn hit(self, entry: CacheEntry) -> LookupResolution {
        LookupResolution::Hit {
            elapsed: self.elapsed(),
            key: self.key,
            entry: Box::new(entry),
        }
    }

    pub fn miss(self, reason: MissReason) -> LookupResolution {
        LookupResolution::Miss {
            elapsed: self.elapsed(),
            key: self.key,
            reason,
        }
    }
}

/// Query `backend` for `key`, giving up after `timeout`.
///
/// Backend errors and timeouts resolve to a miss; the caller decides whether
/// to report them.
pub async fn bounded_lookup(
    backend: &dyn CacheBackend,
    key: CacheKey,
    timeout: Duration,
) -> LookupResolution {
    let lookup = CacheLookup::new(key).issue();
    match tokio::time::timeout(timeout, backend.lookup(&key)).await {
        Ok(Ok(Some(entry))) => lookup.hit(entry),
        Ok(Ok(None)) => lookup.miss(MissReason::NotFound),
        Ok(Err(err)) => lookup.miss(MissReason::BackendError(err.to_string())),
        Err(_) => lookup.miss(MissReason::TimedOut(timeout)),
    }
}
