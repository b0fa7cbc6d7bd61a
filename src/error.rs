//! Error taxonomy for the run database and the schedulers built on it.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input rejected before any job is launched. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Expected run or job metadata is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The batch system reported a failed job. The diagnostic is passed through unmodified.
    #[error("job in {} failed: {diagnostic}", dir.display())]
    ExternalJobFailure { dir: PathBuf, diagnostic: String },

    /// `add` was called for a vector that already matches a stored entry.
    #[error("parameter vector already stored at index {0}")]
    AlreadyIndexed(usize),

    #[error("malformed stored data in {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A target that was accepted but not in the way the caller asked for.
///
/// Logged and returned alongside the result; never aborts the operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StaleStateWarning {
    /// An AND target was satisfied through the hard year cap while the tolerance target was missed.
    YearCapReached {
        run: PathBuf,
        years: u32,
        cap: u32,
        reached_tolerance: f64,
        target_tolerance: f64,
    },
}

impl std::fmt::Display for StaleStateWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::YearCapReached {
                run,
                years,
                cap,
                reached_tolerance,
                target_tolerance,
            } => write!(
                f,
                "run {} reached {} years (cap {}) with tolerance {:e}, target tolerance {:e} missed",
                run.display(),
                years,
                cap,
                reached_tolerance,
                target_tolerance
            ),
        }
    }
}
