//! Error types for the build farm.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cannot build: {0}")]
    CannotBuild(String),

    /// The build itself can never be dispatched as it stands.
    #[error("build rejected: {0}")]
    BuildRejected(String),

    #[error("worker cannot fetch {url}: {info}")]
    CannotFetchFile { url: String, info: String },

    #[error("cannot resume host: {0}")]
    CannotResumeHost(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came from talking to a worker, as opposed to our own
    /// bookkeeping or the build itself. Worker-side errors are attributed to
    /// the worker.
    pub fn is_worker_fault(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Timeout(_)
                | Error::CannotBuild(_)
                | Error::CannotFetchFile { .. }
                | Error::CannotResumeHost(_)
                | Error::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_builds_are_not_worker_faults() {
        assert!(Error::CannotBuild("worker said no".to_string()).is_worker_fault());
        assert!(!Error::BuildRejected("security pocket".to_string()).is_worker_fault());
        assert!(!Error::Internal("oops".to_string()).is_worker_fault());
    }
}
