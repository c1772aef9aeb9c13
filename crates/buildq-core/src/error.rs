//! Error types for the buildq scheduler.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown build, task, worker, or log.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed identifier or request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Operation attempted against a build that is already cancelled or done.
    #[error("Build is terminal: {0}")]
    TerminalBuild(String),

    /// No eligible worker is currently connected.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn build_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("build {id}"))
    }

    pub fn task_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("task {id}"))
    }

    pub fn worker_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("worker {id}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
