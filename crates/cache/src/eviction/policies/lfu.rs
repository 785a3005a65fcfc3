//! LFU (Least Frequently Used) eviction policy implementation

use crate::eviction::traits::EvictionPolicy;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy)]
struct Usage {
    count: u64,
    last_access: u64,
    size: u64,
}

/// LFU (Least Frequently Used) eviction policy. Ties go to the least
/// recently used key, then to key order, so eviction is deterministic.
pub struct LfuPolicy {
    usage: DashMap<String, Usage>,
    total_size: AtomicU64,
    clock: AtomicU64,
    budget: u64,
}

impl LfuPolicy {
    pub fn new(budget: u64) -> Self {
        Self {
            usage: DashMap::new(),
            total_size: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            budget,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn on_access(&self, key: &str) {
        let tick = self.tick();
        if let Some(mut usage) = self.usage.get_mut(key) {
            usage.count += 1;
            usage.last_access = tick;
        }
    }

    fn on_insert(&self, key: &str, size: u64) {
        let tick = self.tick();
        self.on_restore(key, size, tick, 1);
    }

    fn on_restore(&self, key: &str, size: u64, last_access: u64, access_count: u64) {
        self.on_remove(key);
        self.clock.fetch_max(last_access, Ordering::AcqRel);
        self.usage.insert(
            key.to_string(),
            Usage {
                count: access_count.max(1),
                last_access,
                size,
            },
        );
        self.total_size.fetch_add(size, Ordering::AcqRel);
    }

    fn on_remove(&self, key: &str) {
        if let Some((_, usage)) = self.usage.remove(key) {
            self.total_size.fetch_sub(usage.size, Ordering::AcqRel);
        }
    }

    fn next_eviction(&self) -> Option<String> {
        if self.tracked_bytes() <= self.budget {
            return None;
        }
        self.usage
            .iter()
            .map(|r| (r.value().count, r.value().last_access, r.key().clone()))
            .min()
            .map(|(_, _, key)| key)
    }

    fn clear(&self) {
        self.usage.clear();
        self.total_size.store(0, Ordering::Release);
    }

    fn tracked_bytes(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }
}
