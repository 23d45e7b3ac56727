#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, error, info, warn};

use crate::error::SegtaskError;
use crate::task::manager::TaskManager;
use crate::task::model::{TaskId, TaskState};

pub type Artifact = Box<dyn AsyncRead + Send + Unpin>;

/// Turns a task's source image into its result artifact.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, task_id: &TaskId, image: &Path) -> anyhow::Result<Artifact>;
}

/// Runs an external program as `<program> <image> <output>` and streams the
/// file it wrote back as the artifact.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    pub program: String,
    pub timeout: Duration,
}

impl CommandProcessor {
    #[must_use]
    pub fn new(program: String, timeout: Duration) -> Self {
        Self { program, timeout }
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(&self, task_id: &TaskId, image: &Path) -> anyhow::Result<Artifact> {
        let output = image.with_file_name(format!(".mask.{task_id}.out"));
        let scratch = ScratchGuard(output.clone());

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg(image).arg(&output);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;

        let Ok(res) = tokio::time::timeout(self.timeout, child.wait_with_output()).await else {
            anyhow::bail!("processor timed out after {:?}", self.timeout);
        };
        let out = res.with_context(|| format!("failed to wait for {}", self.program))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!(
                "processor exited with code {:?}: {}",
                out.status.code(),
                stderr.trim()
            );
        }

        let file = tokio::fs::File::open(&output)
            .await
            .with_context(|| format!("processor did not produce {}", output.display()))?;
        Ok(Box::new(ScratchFile {
            file,
            _guard: scratch,
        }))
    }
}

/// Removes the processor's output file once the worker is done with it.
struct ScratchGuard(PathBuf);

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

struct ScratchFile {
    file: tokio::fs::File,
    _guard: ScratchGuard,
}

impl AsyncRead for ScratchFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub parallel: usize,
    pub poll_interval: Duration,
    /// Keep waiting for new ids instead of exiting once the queue drains.
    pub wait: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallel: 1,
            poll_interval: Duration::from_secs(1),
            wait: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done { bytes: u64 },
    Failed,
    /// Unknown task or one that is no longer queued (e.g. a redelivered id).
    Skipped,
}

#[derive(Clone)]
pub struct Worker {
    manager: TaskManager,
    processor: Arc<dyn Processor>,
    cfg: WorkerConfig,
}

impl Worker {
    #[must_use]
    pub fn new(manager: TaskManager, processor: Arc<dyn Processor>, cfg: WorkerConfig) -> Self {
        Self {
            manager,
            processor,
            cfg,
        }
    }

    /// Pops and processes ids until ctrl-c, or until the queue has stayed empty
    /// for two polls when `wait` is off. In-flight tasks are always finished.
    pub async fn run(&self) -> anyhow::Result<()> {
        let parallel = self.cfg.parallel.max(1);
        let mut joinset: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();
        let mut empty_polls = 0u32;

        info!(parallel, "worker started");
        loop {
            // Opportunistically reap completed tasks.
            while let Some(res) = joinset.try_join_next() {
                log_join(res);
            }

            if joinset.len() >= parallel {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    Some(res) = joinset.join_next() => log_join(res),
                }
                continue;
            }

            let popped = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                res = self.manager.queue().pop(self.cfg.poll_interval) => res,
            };

            match popped {
                Ok(Some(id)) => {
                    empty_polls = 0;
                    let worker = self.clone();
                    joinset.spawn(async move {
                        if let Err(e) = worker.process_one(&id).await {
                            error!(task_id = %id, error = %e, "task processing aborted");
                        }
                    });
                }
                Ok(None) => {
                    if joinset.is_empty() {
                        empty_polls += 1;
                        if !self.cfg.wait && empty_polls >= 2 {
                            break;
                        }
                    }
                }
                Err(SegtaskError::QueuePayload(payload)) => {
                    warn!(payload = %payload, "dropping malformed queue entry");
                }
                Err(e) => {
                    warn!(error = %e, "queue pop failed");
                    if joinset.is_empty() {
                        empty_polls += 1;
                        if !self.cfg.wait && empty_polls >= 2 {
                            return Err(e.into());
                        }
                    }
                    tokio::time::sleep(self.cfg.poll_interval).await;
                }
            }
        }

        // Graceful shutdown: wait for in-flight tasks.
        while let Some(res) = joinset.join_next().await {
            log_join(res);
        }
        info!("worker stopped");
        Ok(())
    }

    /// Runs one task through `PROCESSING` to `DONE` or `FAILED`.
    ///
    /// The task's claim is held for the whole run, so concurrent deliveries of
    /// the same id process it at most once.
    pub async fn process_one(&self, id: &TaskId) -> Result<Outcome, SegtaskError> {
        let _claim = match self.manager.claim(id).await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                debug!(task_id = %id, "task claimed by another worker, skipping");
                return Ok(Outcome::Skipped);
            }
            Err(SegtaskError::TaskNotFound(_)) => {
                warn!(task_id = %id, "popped id has no task directory, skipping");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let state = match self.manager.statuses().read(id).await {
            Ok(state) => state,
            Err(SegtaskError::TaskNotFound(_)) => {
                warn!(task_id = %id, "popped id has no status record, skipping");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        if state != TaskState::Queued {
            debug!(task_id = %id, %state, "task is not queued, skipping redelivery");
            return Ok(Outcome::Skipped);
        }

        self.manager.mark_processing(id).await?;

        let artifact = match self.manager.layout().find_image(id).await? {
            Some(image) => self.processor.process(id, &image).await,
            None => Err(anyhow::anyhow!("task has no source image")),
        };
        let mut artifact = match artifact {
            Ok(a) => a,
            Err(e) => {
                warn!(task_id = %id, error = %e, "processing failed");
                self.manager.fail(id).await?;
                return Ok(Outcome::Failed);
            }
        };

        match self.manager.complete(id, &mut artifact).await {
            Ok(bytes) => {
                info!(task_id = %id, bytes, "task done");
                Ok(Outcome::Done { bytes })
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "failed to store result");
                self.manager.fail(id).await?;
                Ok(Outcome::Failed)
            }
        }
    }
}

fn log_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        error!("task join error: {e}");
    }
}
