#![forbid(unsafe_code)]

use std::path::PathBuf;

use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info};

use crate::error::{Result, SegtaskError};
use crate::task::blob::{scratch_path, sync_dir};
use crate::task::model::{TaskId, TaskLayout, TaskState};

/// Per-task status record, replaced atomically on every write.
///
/// Writers are the producer once, then whichever worker holds the task's
/// [`TaskClaim`]. Readers may run concurrently with any write.
#[derive(Debug, Clone)]
pub struct StatusStore {
    layout: TaskLayout,
}

impl StatusStore {
    #[must_use]
    pub fn new(layout: TaskLayout) -> Self {
        Self { layout }
    }

    pub async fn write(&self, id: &TaskId, state: TaskState) -> Result<()> {
        let path = self.layout.status_path(id);
        let tmp = scratch_path(&path);

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SegtaskError::TaskNotFound(id.to_string()));
            }
            Err(e) => return Err(SegtaskError::storage(&tmp)(e)),
        };

        let staged = async {
            file.write_all(state.as_str().as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = staged {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SegtaskError::storage(&tmp)(e));
        }

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SegtaskError::storage(&path)(e));
        }
        sync_dir(&self.layout.task_dir(id)).await?;

        debug!(task_id = %id, %state, "status written");
        Ok(())
    }

    pub async fn read(&self, id: &TaskId) -> Result<TaskState> {
        let path = self.layout.status_path(id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SegtaskError::TaskNotFound(id.to_string()));
            }
            Err(e) => return Err(SegtaskError::storage(&path)(e)),
        };
        raw.parse().map_err(|_| SegtaskError::CorruptStatus {
            path,
            value: raw.trim().to_owned(),
        })
    }

    /// Reads the current state and fails unless it may move to `next`.
    pub async fn check_transition(&self, id: &TaskId, next: TaskState) -> Result<TaskState> {
        let current = self.read(id).await?;
        if !current.can_advance_to(next) {
            return Err(SegtaskError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: next,
            });
        }
        Ok(current)
    }

    /// Moves the task to `next`, refusing backward or post-terminal moves.
    /// Returns the state it moved from.
    pub async fn advance(&self, id: &TaskId, next: TaskState) -> Result<TaskState> {
        let current = self.check_transition(id, next).await?;
        self.write(id, next).await?;
        info!(task_id = %id, from = %current, to = %next, "task state changed");
        Ok(current)
    }

    /// Takes the task's exclusive processing claim, or `None` when another
    /// worker already holds it.
    pub async fn claim(&self, id: &TaskId) -> Result<Option<TaskClaim>> {
        let path = self.layout.claim_path(id);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => {
                debug!(task_id = %id, "task claimed");
                Ok(Some(TaskClaim { path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SegtaskError::TaskNotFound(id.to_string()))
            }
            Err(e) => Err(SegtaskError::storage(&path)(e)),
        }
    }
}

/// Exclusive right to move a task out of `QUEUED`; released on drop.
#[derive(Debug)]
pub struct TaskClaim {
    path: PathBuf,
}

impl Drop for TaskClaim {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::Arc;

    fn store_with_task(root: &Path) -> (StatusStore, TaskId) {
        let layout = TaskLayout::new(root.to_path_buf());
        let id = TaskId::new_random();
        std::fs::create_dir(layout.task_dir(&id)).unwrap();
        (StatusStore::new(layout), id)
    }

    #[tokio::test]
    async fn writes_and_reads_plain_tokens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, id) = store_with_task(dir.path());

        store.write(&id, TaskState::Queued).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), TaskState::Queued);

        let on_disk = std::fs::read_to_string(dir.path().join(id.to_string()).join("status.txt"))
            .unwrap();
        assert_eq!(on_disk, "QUEUED");

        store.write(&id, TaskState::Processing).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), TaskState::Processing);

        let entries: Vec<_> = std::fs::read_dir(dir.path().join(id.to_string()))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("status.txt")]);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StatusStore::new(TaskLayout::new(dir.path().to_path_buf()));
        let id = TaskId::new_random();

        assert!(matches!(
            store.read(&id).await,
            Err(SegtaskError::TaskNotFound(_))
        ));
        assert!(matches!(
            store.write(&id, TaskState::Done).await,
            Err(SegtaskError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn directory_without_record_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, id) = store_with_task(dir.path());
        assert!(matches!(
            store.read(&id).await,
            Err(SegtaskError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn garbage_record_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, id) = store_with_task(dir.path());
        std::fs::write(dir.path().join(id.to_string()).join("status.txt"), "QUEU").unwrap();

        let err = store.read(&id).await.unwrap_err();
        assert!(
            matches!(err, SegtaskError::CorruptStatus { ref value, .. } if value == "QUEU"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn advance_enforces_forward_only_moves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, id) = store_with_task(dir.path());
        store.write(&id, TaskState::Queued).await.unwrap();

        assert_eq!(
            store.advance(&id, TaskState::Processing).await.unwrap(),
            TaskState::Queued
        );
        assert_eq!(
            store.advance(&id, TaskState::Failed).await.unwrap(),
            TaskState::Processing
        );

        let err = store.advance(&id, TaskState::Queued).await.unwrap_err();
        assert!(
            matches!(
                err,
                SegtaskError::InvalidTransition {
                    from: TaskState::Failed,
                    to: TaskState::Queued,
                    ..
                }
            ),
            "{err}"
        );
        assert_eq!(store.read(&id).await.unwrap(), TaskState::Failed);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, id) = store_with_task(dir.path());

        let held = store.claim(&id).await.unwrap().expect("first claim");
        assert!(store.claim(&id).await.unwrap().is_none());

        drop(held);
        assert!(!dir.path().join(id.to_string()).join(".claim").exists());
        assert!(store.claim(&id).await.unwrap().is_some());

        let missing = TaskId::new_random();
        assert!(matches!(
            store.claim(&missing).await,
            Err(SegtaskError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn transition_check_does_not_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, id) = store_with_task(dir.path());
        store.write(&id, TaskState::Done).await.unwrap();

        assert!(matches!(
            store.check_transition(&id, TaskState::Done).await,
            Err(SegtaskError::InvalidTransition {
                from: TaskState::Done,
                ..
            })
        ));
        assert_eq!(store.read(&id).await.unwrap(), TaskState::Done);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_never_see_a_torn_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, id) = store_with_task(dir.path());
        store.write(&id, TaskState::Queued).await.unwrap();
        let store = Arc::new(store);

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..200 {
                    let state = if i % 2 == 0 {
                        TaskState::Processing
                    } else {
                        TaskState::Queued
                    };
                    store.write(&id, state).await.unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let state = store.read(&id).await.unwrap();
                    assert!(matches!(state, TaskState::Queued | TaskState::Processing));
                }
            }));
        }

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }
}
