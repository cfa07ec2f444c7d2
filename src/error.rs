//! Error kinds carried inside a [`Failure`](crate::Failure) or returned by
//! the setup functions of this crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The computation was voluntarily abandoned.
    #[error("promise was cancelled")]
    Cancelled,
    /// Every sealant of a pending promise was dropped without resolving it.
    #[error("sealant dropped before the promise was resolved")]
    SealantDropped,
    /// A setup function or continuation panicked.
    #[error("continuation panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Message(String),
    /// A foreign promise completed with an error-shaped outcome.
    #[error("foreign promise failed: {0}")]
    Foreign(String),
    #[error("an executor has already been installed")]
    ExecutorInstalled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn executor thread: {0}")]
    Spawn(#[from] std::io::Error),
}
