//! Cache keys

use kiln_core::{Digest, DigestBuilder, CACHE_FORMAT_VERSION};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const BASE_DOMAIN: &str = "kiln-cache-key";
const DEPENDENCY_DOMAIN: &str = "kiln-cache-key/deps";

/// Identifier of a cache entry.
///
/// A key is derived in two steps. The *base* key covers everything known
/// before a task runs (command, environment, declared inputs). The final key
/// extends the base with the digest of the discovered-dependency set, so two
/// runs that read different headers can never share an entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Digest);

impl CacheKey {
    /// Base key for a remapped, content-mode task signature
    pub fn base(signature: &Digest) -> Self {
        let mut builder = DigestBuilder::with_domain(BASE_DOMAIN);
        builder.add_u32(CACHE_FORMAT_VERSION).add_digest(signature);
        Self(builder.finish())
    }

    /// Final key for this base and a discovered-dependency digest
    pub fn extend(&self, dependencies: &Digest) -> Self {
        let mut builder = DigestBuilder::with_domain(DEPENDENCY_DOMAIN);
        builder.add_digest(&self.0).add_digest(dependencies);
        Self(builder.finish())
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }

    pub fn shard(&self) -> String {
        self.0.shard()
    }

    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl From<Digest> for CacheKey {
    fn from(digest: Digest) -> Self {
        Self(digest)
    }
}

impl FromStr for CacheKey {
    type Err = kiln_core::DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0.short())
    }
}
