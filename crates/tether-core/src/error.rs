use thiserror::Error;

use crate::domain::TaskId;

/// Error returned by a handler. Any error type converts into it with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum EventError {
    /// `repeat` and any other reserved kind without an implementation.
    #[error("event kind '{0}' is not implemented")]
    UnsupportedEventKind(String),

    #[error("invalid delay in '{event_type}': {reason}")]
    InvalidDelay { event_type: String, reason: String },

    #[error("task {0} has no handler to run")]
    InvalidTaskTarget(TaskId),

    #[error("task {task_id} failed: {message}")]
    TaskExecution { task_id: TaskId, message: String },

    #[error("failed to spawn scheduler worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}
