//! Core error type definitions

use std::path::PathBuf;

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kiln operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Malformed build description or graph input
    #[error("invalid build description: {message}")]
    InvalidDescription { message: String },

    /// Command execution errors
    #[error("{}", format_command_error(.command, .args, .message, .exit_code))]
    CommandExecution {
        command: String,
        args: Vec<String>,
        message: String,
        exit_code: Option<i32>,
    },

    /// File system operations
    #[error("file system error during {operation} on '{}': {source}", .path.display())]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// Permission denied errors
    #[error("permission denied for {operation}: {message}")]
    PermissionDenied { operation: String, message: String },

    /// Unsupported operation errors
    #[error("unsupported {feature}: {message}")]
    Unsupported { feature: String, message: String },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {}ms", .duration.as_millis())]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// An error wrapped with a description of what was being attempted
    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<Error>,
    },

    /// Cache store failures surfaced outside the cache crate
    #[error("cache error: {message}")]
    Cache { message: String },

    /// The build was cancelled while the operation was running
    #[error("operation '{operation}' was cancelled")]
    Cancelled { operation: String },
}

fn format_command_error(
    command: &str,
    args: &[String],
    message: &str,
    exit_code: &Option<i32>,
) -> String {
    let invocation = if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    };
    match exit_code {
        Some(code) => format!("command '{invocation}' failed with exit code {code}: {message}"),
        None => format!("command '{invocation}' failed: {message}"),
    }
}
