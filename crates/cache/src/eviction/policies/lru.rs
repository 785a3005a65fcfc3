//! LRU (Least Recently Used) eviction policy implementation

use crate::eviction::traits::EvictionPolicy;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
struct LruState {
    /// (tick, key), oldest first
    order: BTreeSet<(u64, String)>,
    /// key -> (tick, size)
    entries: HashMap<String, (u64, u64)>,
    clock: u64,
    total: u64,
}

/// LRU (Least Recently Used) eviction policy
pub struct LruPolicy {
    state: Mutex<LruState>,
    budget: u64,
}

impl LruPolicy {
    pub fn new(budget: u64) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            budget,
        }
    }
}

impl LruState {
    fn touch(&mut self, key: &str, tick: u64) {
        if let Some((old_tick, _)) = self.entries.get(key).copied() {
            self.order.remove(&(old_tick, key.to_string()));
            self.order.insert((tick, key.to_string()));
            if let Some(entry) = self.entries.get_mut(key) {
                entry.0 = tick;
            }
        }
    }

    fn insert(&mut self, key: &str, size: u64, tick: u64) {
        self.remove(key);
        self.entries.insert(key.to_string(), (tick, size));
        self.order.insert((tick, key.to_string()));
        self.total += size;
        self.clock = self.clock.max(tick);
    }

    fn remove(&mut self, key: &str) {
        if let Some((tick, size)) = self.entries.remove(key) {
            self.order.remove(&(tick, key.to_string()));
            self.total = self.total.saturating_sub(size);
        }
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_access(&self, key: &str) {
        let mut state = self.state.lock();
        state.clock += 1;
        let tick = state.clock;
        state.touch(key, tick);
    }

    fn on_insert(&self, key: &str, size: u64) {
        let mut state = self.state.lock();
        state.clock += 1;
        let tick = state.clock;
        state.insert(key, size, tick);
    }

    fn on_restore(&self, key: &str, size: u64, last_access: u64, _access_count: u64) {
        self.state.lock().insert(key, size, last_access);
    }

    fn on_remove(&self, key: &str) {
        self.state.lock().remove(key);
    }

    fn next_eviction(&self) -> Option<String> {
        let state = self.state.lock();
        if state.total <= self.budget {
            return None;
        }
        state.order.iter().next().map(|(_, key)| key.clone())
    }

    fn clear(&self) {
        *self.state.lock() = LruState::default();
    }

    fn tracked_bytes(&self) -> u64 {
        self.state.lock().total
    }
}
