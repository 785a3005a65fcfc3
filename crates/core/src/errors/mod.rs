//! Error handling for kiln
//!
//! `Error` is the shared failure type for the library crates. Domain crates
//! (cache, task graph) keep their own narrower enums and convert into it at
//! the boundary.

mod builders;
mod conversions;
mod extensions;
mod types;

pub use extensions::ResultExt;
pub use types::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn command_error_display_includes_exit_code() {
        let err = Error::command_execution("cc", vec!["-c".into(), "a.c".into()], "failed", Some(1));
        assert_eq!(err.to_string(), "command 'cc -c a.c' failed with exit code 1: failed");
    }

    #[test]
    fn command_error_display_without_args() {
        let err = Error::command_execution("true", vec![], "killed", None);
        assert_eq!(err.to_string(), "command 'true' failed: killed");
    }

    #[test]
    fn file_system_error_keeps_path_and_operation() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::file_system(PathBuf::from("/tmp/x"), "read", io);
        let rendered = err.to_string();
        assert!(rendered.contains("read"));
        assert!(rendered.contains("/tmp/x"));
    }

    #[test]
    fn timeout_display() {
        let err = Error::timeout("cache lookup", Duration::from_millis(250));
        assert_eq!(err.to_string(), "operation 'cache lookup' timed out after 250ms");
    }

    #[test]
    fn context_wraps_message() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = res.context("loading history").unwrap_err();
        assert!(err.to_string().starts_with("loading history: "));
        assert!(std::error::Error::source(&err).is_some());
    }
}
