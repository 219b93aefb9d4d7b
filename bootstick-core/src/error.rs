//! The error type shared by every stage of the provisioning pipeline.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by `bootstick-core`.
///
/// Each stage fails fast with one of these; the orchestrator turns whatever a
/// stage returns into a single terminal [`crate::provision::Outcome`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The target is mounted on a protected path or vanished from a fresh
    /// enumeration. Never bypassed.
    #[error("refusing to touch {}: {reason}", path.display())]
    Safety { path: PathBuf, reason: String },

    /// A required external tool (or the elevation helper) is not installed.
    #[error("required tool is not available: {0}")]
    Unavailable(String),

    /// The elevation helper refused or was dismissed.
    #[error("privilege escalation was refused: {0}")]
    Privilege(String),

    #[error("partitioning failed: {0}")]
    Partition(String),

    #[error("formatting failed: {0}")]
    Format(String),

    #[error("writing the image failed: {0}")]
    Write(String),

    #[error("extracting the image failed: {0}")]
    Extract(String),

    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    /// Another operation already owns the device or the writer.
    #[error("{0} is busy with another operation")]
    Busy(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps an I/O error with a short description of what was being attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Attaches context to a bare `io::Result`.
pub(crate) trait IoContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| Error::io(context(), source))
    }
}
