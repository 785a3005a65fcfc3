//! Shared utilities for kiln: atomic file writes, the store lock, path
//! remapping and tracing setup.

pub mod atomic_file;
pub mod logging;
pub mod paths;
pub mod store_lock;

pub use atomic_file::{copy_atomic, hard_link_atomic, temp_path_for, write_atomic, write_atomic_json};
pub use paths::{absolutize, is_within, normalize_lexically, PathRemapper, PrefixRule};
pub use store_lock::StoreLock;
