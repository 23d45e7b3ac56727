#![forbid(unsafe_code)]

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{QueueBackend, QueueConfig};
use crate::error::SegtaskError;
use crate::task::model::TaskId;

/// FIFO hand-off of task ids from producers to workers.
///
/// Delivery is at-least-once; consumers must tolerate seeing an id twice.
#[async_trait]
pub trait TaskQueue: Send + Sync + std::fmt::Debug {
    /// Appends `id` at the tail.
    async fn push(&self, id: &TaskId) -> Result<(), SegtaskError>;

    /// Takes the head id, waiting up to `timeout` for one to arrive.
    async fn pop(&self, timeout: Duration) -> Result<Option<TaskId>, SegtaskError>;

    async fn depth(&self) -> Result<usize, SegtaskError>;
}

pub async fn connect(cfg: &QueueConfig) -> Result<Arc<dyn TaskQueue>, SegtaskError> {
    match cfg.backend {
        QueueBackend::Redis => {
            let queue = redis::RedisQueue::connect(&cfg.url, &cfg.name).await?;
            Ok(Arc::new(queue))
        }
        QueueBackend::Memory => Ok(Arc::new(memory::MemoryQueue::new())),
    }
}
