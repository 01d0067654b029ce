//! Error types for the tandem core.
//!
//! The split follows a simple rule: anything that makes the service unable to
//! start is a [`ConfigError`] and is fatal at build time; anything that goes
//! wrong while the manager is running is a [`ManagerError`]. Participant
//! failures are *not* errors at this level — the pipeline catches them, logs
//! them with the transaction id, and treats them as an abort vote for that
//! participant only.

use thiserror::Error;

/// Fatal configuration problems detected when a manager is built.
///
/// The service refuses to start on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No input queue name was configured.
    #[error("no input queue configured")]
    MissingQueue,

    /// The default participant list is empty and no groups are defined.
    #[error("no participants configured")]
    NoParticipants,

    /// Worker pool size must be at least one session.
    #[error("session pool size must be >= 1, got {0}")]
    InvalidPoolSize(usize),
}

/// Runtime errors surfaced by the transaction manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// `resume` was called for an id that is not paused.
    #[error("transaction {0} is not paused")]
    NotPaused(u64),

    /// The manager has shut down and no longer accepts work.
    #[error("manager is shut down")]
    ShutDown,

    /// The recovery store failed mid-operation. Never retried internally;
    /// the caller of the operation in progress sees it.
    #[error("recovery store failure")]
    Store(#[from] anyhow::Error),
}
