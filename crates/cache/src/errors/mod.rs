//! Cache error types

mod display;
mod types;

pub use types::{CacheError, RecoveryHint, Result, SerializationOp, StoreType};
