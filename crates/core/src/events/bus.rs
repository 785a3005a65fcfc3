//! Fan-out of events to registered sinks

use super::event::BuildEvent;
use super::sink::EventSink;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Assigns sequence numbers and forwards each event to every sink.
///
/// Publication is serialized so that sequence order and delivery order agree.
#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    sequence: AtomicU64,
    publish_lock: parking_lot::Mutex<()>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        let bus = Self::new();
        bus.add_sink(sink);
        bus
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Publish an event, returning its sequence number
    pub fn publish(&self, mut event: BuildEvent) -> u64 {
        let _guard = self.publish_lock.lock();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.sequence = sequence;
        for sink in self.sinks.read().iter() {
            sink.emit(&event);
        }
        sequence
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.read().len())
            .field("sequence", &self.last_sequence())
            .finish()
    }
}
