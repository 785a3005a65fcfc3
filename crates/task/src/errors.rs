//! Errors raised while building graphs and computing signatures

use crate::definition::TaskIdentity;
use std::path::PathBuf;
use thiserror::Error;

/// Graph construction and splice errors. All of them are fatal to the build
/// (or to the splicing task) and leave the graph unchanged.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task '{0}' is defined more than once")]
    DuplicateTask(TaskIdentity),

    #[error("output '{}' is produced by both '{first}' and '{second}'", path.display())]
    DuplicateProducer {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("unknown graph node {0}")]
    UnknownNode(usize),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// The full cycle, first node repeated at the end
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("'{existing}' has already started and cannot wait for new task '{new}'")]
    StartedDependent { existing: String, new: String },
}

impl GraphError {
    /// Node labels on the cycle, without the closing repetition
    pub fn cycle_members(&self) -> Option<&[String]> {
        match self {
            GraphError::Cycle { path } if !path.is_empty() => Some(&path[..path.len() - 1]),
            _ => None,
        }
    }
}

/// Failure to stamp an input. Missing inputs are not errors; they are
/// recorded as absent.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("permission denied reading input '{}'", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read input '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SignatureError {
    pub(crate) fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            SignatureError::PermissionDenied { path, source }
        } else {
            SignatureError::Io { path, source }
        }
    }
}

impl From<GraphError> for kiln_core::Error {
    fn from(error: GraphError) -> Self {
        kiln_core::Error::invalid_description(error.to_string())
    }
}

impl From<SignatureError> for kiln_core::Error {
    fn from(error: SignatureError) -> Self {
        match error {
            SignatureError::PermissionDenied { path, .. } => kiln_core::Error::permission_denied(
                "stamp input",
                format!("cannot read {}", path.display()),
            ),
            SignatureError::Io { path, source } => {
                kiln_core::Error::file_system(path, "stamp input", source)
            }
        }
    }
}
