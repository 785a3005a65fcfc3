//! Event payload and severity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// Stable rule identities attached to events.
///
/// Consumers match on these strings, so they never change meaning once
/// published.
pub mod rules {
    pub const BUILD_STARTED: &str = "build.started";
    pub const BUILD_FINISHED: &str = "build.finished";

    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_FINISHED: &str = "task.finished";
    pub const TASK_UP_TO_DATE: &str = "task.up-to-date";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_SKIPPED: &str = "task.skipped";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_OUTPUT: &str = "task.output";

    pub const CACHE_HIT: &str = "cache.hit";
    pub const CACHE_MISS: &str = "cache.miss";
    pub const CACHE_STORE: &str = "cache.store";
    pub const CACHE_COLLISION: &str = "cache.collision";
    pub const CACHE_VALIDATE: &str = "cache.validate";
    pub const CACHE_VALIDATE_SKIPPED: &str = "cache.validate.skipped";
    pub const CACHE_RECOVER: &str = "cache.recover";
    pub const CACHE_PRUNE: &str = "cache.prune";
    pub const CACHE_ERROR: &str = "cache.error";

    pub const DEPS_UNDECLARED: &str = "deps.undeclared";
    pub const DEPS_UNDECLARED_OUTPUT: &str = "deps.undeclared-output";

    pub const GRAPH_SPLICE: &str = "graph.splice";
}

/// One diagnostic event.
///
/// `sequence` is assigned by the [`super::EventBus`] and increases strictly
/// in publication order across the whole build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub rule: String,
    pub severity: Severity,
    pub task: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl BuildEvent {
    pub fn new(rule: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            rule: rule.into(),
            severity,
            task: None,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn note(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(rule, Severity::Note, message)
    }

    pub fn warning(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(rule, Severity::Warning, message)
    }

    pub fn error(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(rule, Severity::Error, message)
    }

    #[must_use]
    pub fn for_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}
