#![forbid(unsafe_code)]

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use tracing::debug;

use crate::error::SegtaskError;
use crate::queue::TaskQueue;
use crate::task::model::TaskId;

pub const DEFAULT_QUEUE_NAME: &str = "task-queue";

const POP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Redis list used as the broker: `RPUSH` at the tail, `LPOP` at the head.
///
/// The multiplexed connection is shared, so pops poll with `LPOP` rather than
/// parking the connection in `BLPOP`.
#[derive(Debug, Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
    name: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, name: &str) -> Result<Self, SegtaskError> {
        let client = ::redis::Client::open(url).map_err(|e| {
            SegtaskError::QueueUnavailable(format!("invalid redis url '{url}': {e}"))
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                SegtaskError::QueueUnavailable(format!("failed to connect to {url}: {e}"))
            })?;
        debug!(url, queue = name, "connected to redis");
        Ok(Self::with_connection(conn, name))
    }

    #[must_use]
    pub fn with_connection(conn: MultiplexedConnection, name: &str) -> Self {
        Self {
            conn,
            name: name.to_owned(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn unavailable(&self, op: &str, err: &::redis::RedisError) -> SegtaskError {
        SegtaskError::QueueUnavailable(format!("{op} on '{}' failed: {err}", self.name))
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn push(&self, id: &TaskId) -> Result<(), SegtaskError> {
        let mut conn = self.conn.clone();
        let _len: i64 = ::redis::cmd("RPUSH")
            .arg(&self.name)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.unavailable("RPUSH", &e))?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<TaskId>, SegtaskError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut conn = self.conn.clone();
        loop {
            let payload: Option<String> = ::redis::cmd("LPOP")
                .arg(&self.name)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.unavailable("LPOP", &e))?;
            if let Some(payload) = payload {
                return payload
                    .parse()
                    .map(Some)
                    .map_err(|_| SegtaskError::QueuePayload(payload));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn depth(&self) -> Result<usize, SegtaskError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("LLEN")
            .arg(&self.name)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.unavailable("LLEN", &e))
    }
}
