//! Tests for eviction policies

use super::*;
use kiln_config::EvictionKind;

#[test]
fn lru_evicts_least_recently_used() {
    let policy = LruPolicy::new(1000);

    policy.on_insert("a", 100);
    policy.on_insert("b", 200);
    policy.on_insert("c", 300);
    policy.on_insert("d", 500);

    assert_eq!(policy.next_eviction(), Some("a".to_string()));

    policy.on_access("b");
    policy.on_remove("a");
    policy.on_insert("e", 200);

    assert_eq!(policy.next_eviction(), Some("c".to_string()));
}

#[test]
fn lru_is_quiet_under_budget() {
    let policy = LruPolicy::new(1000);
    policy.on_insert("a", 400);
    policy.on_insert("b", 600);
    assert_eq!(policy.next_eviction(), None);
    assert_eq!(policy.tracked_bytes(), 1000);
}

#[test]
fn lru_restore_respects_persisted_ticks() {
    let policy = LruPolicy::new(0);
    policy.on_restore("new", 10, 50, 1);
    policy.on_restore("old", 10, 5, 9);
    assert_eq!(policy.next_eviction(), Some("old".to_string()));
}

#[test]
fn lfu_evicts_least_frequently_used() {
    let policy = LfuPolicy::new(1000);

    policy.on_insert("a", 300);
    policy.on_insert("b", 300);
    policy.on_insert("c", 300);

    policy.on_access("a");
    policy.on_access("a");
    policy.on_access("b");
    policy.on_access("c");
    policy.on_access("c");
    policy.on_access("c");

    policy.on_insert("d", 300);

    assert_eq!(policy.next_eviction(), Some("d".to_string()));
    policy.on_remove("d");
    assert_eq!(policy.next_eviction(), None);
}

#[test]
fn lfu_breaks_ties_by_recency() {
    let policy = LfuPolicy::new(0);
    policy.on_restore("x", 1, 20, 3);
    policy.on_restore("y", 1, 10, 3);
    assert_eq!(policy.next_eviction(), Some("y".to_string()));
}

#[test]
fn factory_builds_requested_policy() {
    assert_eq!(create_eviction_policy(EvictionKind::Lru, 0).name(), "lru");
    assert_eq!(create_eviction_policy(EvictionKind::Lfu, 0).name(), "lfu");
}

#[test]
fn clear_resets_tracking() {
    for policy in [
        create_eviction_policy(EvictionKind::Lru, 0),
        create_eviction_policy(EvictionKind::Lfu, 0),
    ] {
        policy.on_insert("a", 10);
        policy.clear();
        assert_eq!(policy.tracked_bytes(), 0);
        assert_eq!(policy.next_eviction(), None);
    }
}
