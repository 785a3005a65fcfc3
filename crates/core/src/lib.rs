//! Core domain types, errors, and constants for kiln.
//!
//! ## Key Components
//!
//! - **`errors`**: the shared `Error` enum and `Result` alias.
//! - **`events`**: structured diagnostic events with stable rule identities
//!   and the sinks that consume them.
//! - **`types`**: `Digest`, `DigestBuilder` and `ByteCount`.
//! - **`statistics`**: per-build counters.
//! - **`cancel`**: build-wide cancellation signal.
//! - **`constants`**: file names, environment variable names, format versions.

pub mod cancel;
pub mod constants;
pub mod errors;
pub mod events;
pub mod statistics;
pub mod types;

pub use self::{
    cancel::{CancellationSignal, CancellationSource},
    constants::*,
    errors::{Error, Result, ResultExt},
    events::{rules, BroadcastSink, BuildEvent, CollectingSink, EventBus, EventSink, Severity, TracingSink},
    statistics::{BuildStatistics, Statistic, StatisticsSnapshot},
    types::*,
};
