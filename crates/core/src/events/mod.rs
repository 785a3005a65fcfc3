//! Structured diagnostic events.
//!
//! Every user-visible state transition (cache hit, task failure, validation
//! outcome, dependency violation, ...) is published as a [`BuildEvent`]
//! carrying a stable rule identity and a [`Severity`]. Events flow through an
//! [`EventBus`] to any number of [`EventSink`]s.

mod bus;
mod event;
mod sink;

pub use bus::EventBus;
pub use event::{rules, BuildEvent, Severity};
pub use sink::{BroadcastSink, CollectingSink, EventSink, TracingSink};
