//! Event sinks

use super::event::{BuildEvent, Severity};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Receiver of build events. Implementations must be cheap; they are called
/// from worker tasks while the build is running.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BuildEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &BuildEvent) {
        let task = event.task.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Note => info!(rule = %event.rule, task, "{}", event.message),
            Severity::Warning => warn!(rule = %event.rule, task, "{}", event.message),
            Severity::Error => error!(rule = %event.rule, task, "{}", event.message),
        }
    }
}

/// Keeps every event in memory; used by tests and by the CLI summary.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<BuildEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().clone()
    }

    pub fn with_rule(&self, rule: &str) -> Vec<BuildEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.rule == rule)
            .cloned()
            .collect()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.severity == severity)
            .count()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &BuildEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Publishes events on a tokio broadcast channel for UI layers
pub struct BroadcastSink {
    sender: broadcast::Sender<BuildEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &BuildEvent) {
        // No receivers is fine; lagging receivers see a Lagged error instead.
        let _ = self.sender.send(event.clone());
    }
}
