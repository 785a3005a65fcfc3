//! Factory for creating eviction policies

use super::policies::{LfuPolicy, LruPolicy};
use super::traits::EvictionPolicy;
use kiln_config::EvictionKind;

/// Build the configured policy with the given byte budget
pub fn create_eviction_policy(kind: EvictionKind, budget: u64) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionKind::Lru => Box::new(LruPolicy::new(budget)),
        EvictionKind::Lfu => Box::new(LfuPolicy::new(budget)),
    }
}
