#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

use crate::task::model::TaskState;

#[derive(Debug, Error)]
pub enum SegtaskError {
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read input stream: {0}")]
    Input(#[source] std::io::Error),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("queue delivered an invalid task id: '{0}'")]
    QueuePayload(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("result for task {0} is not ready")]
    ResultNotReady(String),

    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("unknown task state '{0}'")]
    UnknownState(String),

    #[error("corrupt status record at {path}: '{value}'")]
    CorruptStatus { path: PathBuf, value: String },

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("config error: {0}")]
    Config(String),
}

impl SegtaskError {
    /// Builds a closure that tags an io error with the path it happened at.
    pub fn storage(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Storage { path, source }
    }
}

pub type Result<T, E = SegtaskError> = std::result::Result<T, E>;
