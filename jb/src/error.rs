//! Error types for queue operations

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from job environment operations
///
/// Lock contention is not represented here: a lock that is already held is
/// reported as `Ok(false)` by the lock primitives.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Malformed metadata in '{name}': {reason}")]
    MalformedMetadata { name: String, reason: String },

    #[error("Transport cannot retarget {}", .0.display())]
    RetargetUnsupported(PathBuf),

    #[error("No destination directory for {}", .0.display())]
    NoDestination(PathBuf),

    #[error("{} already exists", .0.display())]
    TargetExists(PathBuf),

    #[error("No pending directory configured")]
    NoPendingRoot,

    #[error("Invalid delay: {0}")]
    InvalidDelay(String),

    #[error("Invalid disposition: {0}")]
    InvalidDisposition(String),

    #[error("File name is not valid UTF-8: {}", .0.display())]
    NonUtf8Name(PathBuf),

    #[error("Invalid bucket time: {0}")]
    InvalidBucketTime(String),

    #[error("Application '{0}' is already running")]
    AlreadyRunning(String),
}

impl JobError {
    /// Wrap an I/O error with the path it occurred on
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        JobError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        JobError::MalformedMetadata {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for job environment operations
pub type JobResult<T> = Result<T, JobError>;
