use std::io;

use thiserror::Error;

/// Returned when a task can't be posted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    /// The pool is shutting down or was joined, and the task isn't allowed to
    /// block shutdown.
    #[error("task rejected: the thread pool is shutting down")]
    Rejected,
}

/// Why a submitted task didn't produce a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task was skipped, cancelled or dropped before it could run.
    #[error("the task was dropped before it could run")]
    Abandoned,
    /// The task panicked.
    #[error("the task panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to spawn thread {name:?}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}
