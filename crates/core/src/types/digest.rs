//! Fixed-size content digests and the incremental builder that produces them

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte SHA-256 digest, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest of a single byte slice
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Two-character shard prefix used for on-disk fan-out
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid digest '{input}': expected 64 lowercase hex characters")]
pub struct DigestParseError {
    pub input: String,
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DigestParseError {
            input: s.to_string(),
        };
        if s.len() != Self::LEN * 2 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(err());
        }
        let bytes = hex::decode(s).map_err(|_| err())?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| err())?;
        Ok(Self(array))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental digest builder.
///
/// Integers are fed little-endian and strings/byte slices are length
/// prefixed, so adjacent fields can never run into each other.
#[derive(Clone, Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a builder whose output is namespaced by `domain`
    pub fn with_domain(domain: &str) -> Self {
        let mut builder = Self::new();
        builder.add_str(domain);
        builder
    }

    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.hasher.update([value]);
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn add_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn add_i64(&mut self, value: i64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn add_bool(&mut self, value: bool) -> &mut Self {
        self.add_u8(u8::from(value))
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.add_u64(bytes.len() as u64);
        self.hasher.update(bytes);
        self
    }

    pub fn add_str(&mut self, value: &str) -> &mut Self {
        self.add_bytes(value.as_bytes())
    }

    pub fn add_digest(&mut self, digest: &Digest) -> &mut Self {
        self.hasher.update(digest.as_bytes());
        self
    }

    /// Feed raw bytes without a length prefix (streaming file content)
    pub fn update_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn finish(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hex_round_trip() {
        let digest = Digest::of(b"hello");
        let parsed: Digest = digest.to_hex().parse().unwrap();
        assert_eq!(parsed, digest);
        assert_eq!(
            digest.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn rejects_uppercase_and_short_input() {
        assert!("ABCD".parse::<Digest>().is_err());
        let upper = Digest::of(b"x").to_hex().to_uppercase();
        assert!(upper.parse::<Digest>().is_err());
    }

    #[test]
    fn length_prefix_separates_fields() {
        let mut a = DigestBuilder::new();
        a.add_str("ab").add_str("c");
        let mut b = DigestBuilder::new();
        b.add_str("a").add_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn shard_is_first_byte() {
        let digest = Digest::of(b"shard");
        assert_eq!(digest.shard(), &digest.to_hex()[..2]);
    }

    proptest! {
        #[test]
        fn builder_is_deterministic(parts in proptest::collection::vec(".*", 0..8), n in any::<u64>()) {
            let build = || {
                let mut builder = DigestBuilder::with_domain("test");
                for part in &parts {
                    builder.add_str(part);
                }
                builder.add_u64(n);
                builder.finish()
            };
            prop_assert_eq!(build(), build());
        }
    }
}
