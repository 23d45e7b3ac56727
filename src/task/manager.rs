#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncRead;
use tracing::{debug, error, info};

use crate::error::{Result, SegtaskError};
use crate::queue::TaskQueue;
use crate::task::blob::{BlobStore, DEFAULT_CHUNK_SIZE};
use crate::task::model::{TaskId, TaskLayout, TaskState, extension_for_content_type};
use crate::task::storage::{StatusStore, TaskClaim};

pub type IdGenerator = Arc<dyn Fn() -> TaskId + Send + Sync>;

/// Creates tasks, reports their state and hands out finished results.
///
/// Cheap to clone; clones share the queue handle and nothing else, so every
/// operation may run concurrently with any other.
#[derive(Clone)]
pub struct TaskManager {
    layout: TaskLayout,
    blobs: BlobStore,
    statuses: StatusStore,
    queue: Arc<dyn TaskQueue>,
    id_gen: IdGenerator,
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("layout", &self.layout)
            .field("blobs", &self.blobs)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, queue: Arc<dyn TaskQueue>) -> Self {
        let layout = TaskLayout::new(root.into());
        Self {
            statuses: StatusStore::new(layout.clone()),
            blobs: BlobStore::new(DEFAULT_CHUNK_SIZE),
            layout,
            queue,
            id_gen: Arc::new(TaskId::new_random),
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.blobs = BlobStore::new(chunk_size);
        self
    }

    #[must_use]
    pub fn with_id_generator(
        mut self,
        id_gen: impl Fn() -> TaskId + Send + Sync + 'static,
    ) -> Self {
        self.id_gen = Arc::new(id_gen);
        self
    }

    #[must_use]
    pub fn layout(&self) -> &TaskLayout {
        &self.layout
    }

    #[must_use]
    pub fn statuses(&self) -> &StatusStore {
        &self.statuses
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Stores the image, records it as `QUEUED` and enqueues its id.
    ///
    /// The status record is durable before the id is pushed, so a worker that
    /// pops the id always finds the image and a `QUEUED` record. A failure after
    /// the directory exists leaves it behind as an orphan.
    pub async fn create<R>(&self, image: &mut R, content_type: &str) -> Result<TaskId>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let ext = extension_for_content_type(content_type)?;
        let id = (self.id_gen)();

        let root = self.layout.root();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(SegtaskError::storage(root))?;

        let dir = self.layout.task_dir(&id);
        if let Err(e) = tokio::fs::create_dir(&dir).await {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                error!(task_id = %id, "task id collision, refusing to reuse directory");
            }
            return Err(SegtaskError::storage(&dir)(e));
        }

        let image_path = self.layout.image_path(&id, ext);
        let bytes = self.blobs.write_streamed(&image_path, image).await?;
        self.statuses.write(&id, TaskState::Queued).await?;
        self.queue.push(&id).await?;

        info!(task_id = %id, content_type, bytes, "task created");
        Ok(id)
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskState> {
        let id: TaskId = task_id.parse()?;
        self.statuses.read(&id).await
    }

    /// Opens the finished artifact and returns it with its byte length.
    pub async fn result(&self, task_id: &str) -> Result<(File, u64)> {
        let id: TaskId = task_id.parse()?;
        let state = self.statuses.read(&id).await?;
        if state != TaskState::Done {
            debug!(task_id = %id, %state, "result requested before completion");
            return Err(SegtaskError::ResultNotReady(id.to_string()));
        }
        match self.blobs.read_with_size(&self.layout.result_path(&id)).await {
            Err(SegtaskError::NotFound(_)) => Err(SegtaskError::ResultNotReady(id.to_string())),
            other => other,
        }
    }

    /// See [`StatusStore::claim`].
    pub async fn claim(&self, id: &TaskId) -> Result<Option<TaskClaim>> {
        self.statuses.claim(id).await
    }

    pub async fn mark_processing(&self, id: &TaskId) -> Result<()> {
        self.statuses.advance(id, TaskState::Processing).await?;
        Ok(())
    }

    /// Stores the artifact and then records `DONE`, so `DONE` is only ever
    /// observed alongside a complete artifact.
    ///
    /// The artifact is staged beside `mask.png` and renamed over it only once
    /// the task is known to be allowed to finish; a task that is already
    /// terminal keeps whatever result it has.
    pub async fn complete<R>(&self, id: &TaskId, artifact: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.statuses.check_transition(id, TaskState::Done).await?;

        let path = self.layout.result_path(id);
        let staged = self.blobs.stage(&path, artifact).await?;
        // The state may have moved while the artifact streamed in.
        self.statuses.check_transition(id, TaskState::Done).await?;

        let bytes = staged.publish().await?;
        if let Err(e) = self.statuses.advance(id, TaskState::Done).await {
            error!(task_id = %id, error = %e, "withdrawing published result");
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(bytes)
    }

    pub async fn fail(&self, id: &TaskId) -> Result<()> {
        self.statuses.advance(id, TaskState::Failed).await?;
        Ok(())
    }
}
