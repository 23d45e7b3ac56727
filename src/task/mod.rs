#![forbid(unsafe_code)]

pub mod blob;
pub mod manager;
pub mod model;
pub mod storage;
pub mod worker;

pub use manager::TaskManager;
pub use model::{TaskId, TaskState};
