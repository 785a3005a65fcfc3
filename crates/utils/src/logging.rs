//! Tracing subscriber setup

use kiln_core::KILN_LOG_VAR;
use tracing::{span, Level, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// The filter comes from `KILN_LOG`, then `RUST_LOG`, then `default_level`.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_env(KILN_LOG_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(default_level))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_tty())
        .compact()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn is_tty() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr())
}

/// Span covering one whole build
pub fn build_span(total_tasks: usize) -> Span {
    span!(Level::INFO, "build", total_tasks = total_tasks)
}

/// Span covering the evaluation of one task
pub fn task_span(identity: &str) -> Span {
    span!(Level::INFO, "task", task = %identity)
}
