#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod config;
pub mod error;
pub mod queue;
pub mod task;

pub use error::SegtaskError;
pub use task::{TaskId, TaskManager, TaskState};
