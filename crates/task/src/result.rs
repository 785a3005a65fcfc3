//! Task and build outcomes

use crate::process::ExitStatus;
use indexmap::IndexMap;
use kiln_core::{BuildEvent, StatisticsSnapshot};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DependencyFailed { dependency: String },
    /// The build stopped admitting work before this task became ready
    BuildStopped,
}

/// Terminal state of one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    UpToDate,
    CacheHit,
    /// The command ran; a non-success status is a failure
    Executed(ExitStatus),
    /// The task could not be run or its result was rejected
    Failed(String),
    Skipped(SkipReason),
    Cancelled,
}

impl TaskResult {
    /// Dependents may start after this result
    pub fn is_success(&self) -> bool {
        match self {
            TaskResult::UpToDate | TaskResult::CacheHit => true,
            TaskResult::Executed(status) => status.is_success(),
            _ => false,
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            TaskResult::Failed(_) => true,
            TaskResult::Executed(status) => !status.is_success(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResult::UpToDate => f.write_str("up to date"),
            TaskResult::CacheHit => f.write_str("restored from cache"),
            TaskResult::Executed(status) if status.is_success() => f.write_str("executed"),
            TaskResult::Executed(status) => write!(f, "failed ({status})"),
            TaskResult::Failed(reason) => write!(f, "failed: {reason}"),
            TaskResult::Skipped(SkipReason::DependencyFailed { dependency }) => {
                write!(f, "skipped: dependency '{dependency}' failed")
            }
            TaskResult::Skipped(SkipReason::BuildStopped) => f.write_str("skipped: build stopped"),
            TaskResult::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Counts per terminal state. Gates and virtual nodes are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub up_to_date: usize,
    pub cache_hits: usize,
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl BuildSummary {
    pub(crate) fn count(&mut self, result: &TaskResult) {
        self.total += 1;
        match result {
            TaskResult::UpToDate => self.up_to_date += 1,
            TaskResult::CacheHit => self.cache_hits += 1,
            TaskResult::Executed(status) if status.is_success() => self.executed += 1,
            TaskResult::Executed(_) | TaskResult::Failed(_) => self.failed += 1,
            TaskResult::Skipped(_) => self.skipped += 1,
            TaskResult::Cancelled => self.cancelled += 1,
        }
    }
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} executed, {} from cache, {} up to date, {} failed, {} skipped, {} cancelled",
            self.total,
            self.executed,
            self.cache_hits,
            self.up_to_date,
            self.failed,
            self.skipped,
            self.cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Per-node results keyed by label, in graph order
    pub results: IndexMap<String, TaskResult>,
    pub summary: BuildSummary,
    pub statistics: StatisticsSnapshot,
    /// Error-severity events emitted during the build
    pub errors: Vec<BuildEvent>,
    pub duration: Duration,
    pub cancelled_by_user: bool,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        !self.cancelled_by_user
            && self.summary.failed == 0
            && self.summary.skipped == 0
            && self.summary.cancelled == 0
    }

    pub fn result(&self, label: &str) -> Option<&TaskResult> {
        self.results.get(label)
    }
}
