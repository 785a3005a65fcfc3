//! Core eviction policy trait definition

/// Orders cache entries for eviction.
///
/// The store feeds the policy every evictable entry (with its persisted
/// access history) and repeatedly asks for the next victim until it is back
/// under its size ceiling.
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Record access to a key
    fn on_access(&self, key: &str);

    /// Start tracking a key
    fn on_insert(&self, key: &str, size: u64);

    /// Start tracking a key restored from persisted history
    fn on_restore(&self, key: &str, size: u64, last_access: u64, access_count: u64);

    /// Stop tracking a key
    fn on_remove(&self, key: &str);

    /// Next key to evict, if tracked usage exceeds the policy's budget
    fn next_eviction(&self) -> Option<String>;

    /// Clear all tracking data
    fn clear(&self);

    /// Bytes currently tracked
    fn tracked_bytes(&self) -> u64;
}
