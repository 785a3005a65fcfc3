//! Build statistics.
//!
//! Counters live in a [`BuildStatistics`] value owned by the build context
//! rather than in process-wide globals, so concurrent builds (and tests)
//! never observe each other's numbers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Named counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    TasksUpToDate,
    TasksCacheHit,
    TasksExecuted,
    TasksFailed,
    TasksSkipped,
    TasksCancelled,
    SignaturesComputed,
    CacheLookups,
    CacheHits,
    CacheMisses,
    CacheLookupTimeouts,
    CacheStores,
    CacheStoredBytes,
    CacheErrors,
    ProcessesSpawned,
    DependencyViolations,
    GraphSplices,
}

impl Statistic {
    pub const COUNT: usize = 17;

    pub const ALL: [Statistic; Self::COUNT] = [
        Statistic::TasksUpToDate,
        Statistic::TasksCacheHit,
        Statistic::TasksExecuted,
        Statistic::TasksFailed,
        Statistic::TasksSkipped,
        Statistic::TasksCancelled,
        Statistic::SignaturesComputed,
        Statistic::CacheLookups,
        Statistic::CacheHits,
        Statistic::CacheMisses,
        Statistic::CacheLookupTimeouts,
        Statistic::CacheStores,
        Statistic::CacheStoredBytes,
        Statistic::CacheErrors,
        Statistic::ProcessesSpawned,
        Statistic::DependencyViolations,
        Statistic::GraphSplices,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Statistic::TasksUpToDate => "tasks.up_to_date",
            Statistic::TasksCacheHit => "tasks.cache_hit",
            Statistic::TasksExecuted => "tasks.executed",
            Statistic::TasksFailed => "tasks.failed",
            Statistic::TasksSkipped => "tasks.skipped",
            Statistic::TasksCancelled => "tasks.cancelled",
            Statistic::SignaturesComputed => "signatures.computed",
            Statistic::CacheLookups => "cache.lookups",
            Statistic::CacheHits => "cache.hits",
            Statistic::CacheMisses => "cache.misses",
            Statistic::CacheLookupTimeouts => "cache.lookup_timeouts",
            Statistic::CacheStores => "cache.stores",
            Statistic::CacheStoredBytes => "cache.stored_bytes",
            Statistic::CacheErrors => "cache.errors",
            Statistic::ProcessesSpawned => "processes.spawned",
            Statistic::DependencyViolations => "deps.violations",
            Statistic::GraphSplices => "graph.splices",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-build counter set
#[derive(Debug)]
pub struct BuildStatistics {
    counters: [AtomicU64; Statistic::COUNT],
}

impl Default for BuildStatistics {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl BuildStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, statistic: Statistic) {
        self.add(statistic, 1);
    }

    pub fn add(&self, statistic: Statistic, amount: u64) {
        self.counters[statistic.index()].fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, statistic: Statistic) -> u64 {
        self.counters[statistic.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            values: Statistic::ALL
                .iter()
                .map(|s| (s.name().to_string(), self.get(*s)))
                .collect(),
        }
    }
}

/// Point-in-time copy of all counters, keyed by counter name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub values: BTreeMap<String, u64>,
}

impl StatisticsSnapshot {
    pub fn get(&self, statistic: Statistic) -> u64 {
        self.values.get(statistic.name()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent_per_instance() {
        let a = BuildStatistics::new();
        let b = BuildStatistics::new();
        a.increment(Statistic::CacheHits);
        a.add(Statistic::CacheStoredBytes, 128);
        assert_eq!(a.get(Statistic::CacheHits), 1);
        assert_eq!(b.get(Statistic::CacheHits), 0);

        let snapshot = a.snapshot();
        assert_eq!(snapshot.get(Statistic::CacheStoredBytes), 128);
        assert_eq!(snapshot.values.len(), Statistic::ALL.len());
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = Statistic::ALL.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Statistic::ALL.len());
    }
}
