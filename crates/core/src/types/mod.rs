//! Shared value types

mod byte_count;
mod digest;

pub use byte_count::{ByteCount, ByteCountParseError};
pub use digest::{Digest, DigestBuilder, DigestParseError};
