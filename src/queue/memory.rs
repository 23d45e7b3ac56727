#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::SegtaskError;
use crate::queue::TaskQueue;
use crate::task::model::TaskId;

/// Process-local queue. Useful for tests and for embedding producer and
/// worker in one process.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<TaskId>>,
    notify: Notify,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents, head first.
    pub async fn snapshot(&self) -> Vec<TaskId> {
        self.items.lock().await.iter().copied().collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, id: &TaskId) -> Result<(), SegtaskError> {
        self.items.lock().await.push_back(*id);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<TaskId>, SegtaskError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(id) = self.items.lock().await.pop_front() {
                return Ok(Some(id));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn depth(&self) -> Result<usize, SegtaskError> {
        Ok(self.items.lock().await.len())
    }
}
