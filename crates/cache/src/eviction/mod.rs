//! Eviction policies used by `prune`

mod factory;
mod policies;
mod traits;

pub use factory::create_eviction_policy;
pub use policies::{LfuPolicy, LruPolicy};
pub use traits::EvictionPolicy;

#[cfg(test)]
mod tests;
