//! Image processing behind the worker queue.
//!
//! [`QueuedProcessor`] is the thin orchestration layer between the HTTP
//! handler and the render workers: resolve source bytes through the source
//! cache, wrap them with the validated parameters into a [`RenditionTask`],
//! submit to the [`WorkQueue`] and hand back the encoded bytes. The pixel
//! work itself lives behind [`RasterBackend`].

mod backend;

pub use backend::{BackendError, ImageBackend, RasterBackend};

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::SourceCache;
use crate::params::{Extension, Params};
use crate::queue::{JobHandler, QueueError, WorkQueue};
use crate::storage::{Storage, StorageError};

/// Target encoding for a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    WebP,
}

impl From<Extension> for OutputFormat {
    fn from(extension: Extension) -> Self {
        match extension {
            Extension::Jpg => Self::Jpeg,
            Extension::Webp => Self::WebP,
        }
    }
}

/// Everything a worker needs to produce one rendition.
#[derive(Debug, Clone)]
pub struct RenditionTask {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub blur: Option<u8>,
    pub grayscale: bool,
    pub format: OutputFormat,
}

impl RenditionTask {
    pub fn from_params(params: &Params) -> Self {
        Self {
            id: params.id.clone(),
            width: params.width,
            height: params.height,
            blur: params.blur,
            grayscale: params.grayscale,
            format: params.extension.into(),
        }
    }
}

/// Processing failures, classified for the handler's status mapping.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The render queue had no free intake slot.
    #[error("render queue is full")]
    QueueFull,
    /// The service is shutting down.
    #[error("render queue has been shut down")]
    Shutdown,
    /// The caller stopped waiting before the rendition finished.
    #[error("processing cancelled")]
    Cancelled,
    /// Source bytes could not be resolved.
    #[error("source image: {0}")]
    Source(#[from] StorageError),
    /// The raster backend rejected or failed the job.
    #[error("render failed: {0}")]
    Render(#[from] BackendError),
}

/// Produces encoded rendition bytes for a task.
pub trait ImageProcessor: Send + Sync + 'static {
    fn process_image(
        &self,
        cancel: &CancellationToken,
        task: RenditionTask,
    ) -> impl Future<Output = Result<Vec<u8>, ProcessError>> + Send;
}

/// A render job: resolved source bytes plus the task.
pub struct RenderJob {
    pub source: Arc<Vec<u8>>,
    pub task: RenditionTask,
}

/// Queue handler invoking the raster backend on the worker thread.
pub struct RenderHandler {
    backend: Arc<dyn RasterBackend>,
}

impl RenderHandler {
    pub fn new(backend: Arc<dyn RasterBackend>) -> Self {
        Self { backend }
    }
}

impl JobHandler for RenderHandler {
    type Job = RenderJob;
    type Output = Vec<u8>;
    type Error = BackendError;

    fn run(&self, _cancel: &CancellationToken, job: RenderJob) -> Result<Vec<u8>, BackendError> {
        self.backend.render(&job.source, &job.task)
    }
}

/// The production processor: source cache in front, worker queue behind.
pub struct QueuedProcessor<S> {
    sources: Arc<SourceCache<S>>,
    queue: Arc<WorkQueue<RenderHandler>>,
}

impl<S: Storage> QueuedProcessor<S> {
    pub fn new(sources: Arc<SourceCache<S>>, queue: Arc<WorkQueue<RenderHandler>>) -> Self {
        Self { sources, queue }
    }
}

impl<S: Storage> ImageProcessor for QueuedProcessor<S> {
    fn process_image(
        &self,
        cancel: &CancellationToken,
        task: RenditionTask,
    ) -> impl Future<Output = Result<Vec<u8>, ProcessError>> + Send {
        async move {
            let source = self.sources.get(&task.id).await?;
            let job = RenderJob { source, task };
            match self.queue.process(cancel, job).await {
                Ok(bytes) => Ok(bytes),
                Err(QueueError::Full) => Err(ProcessError::QueueFull),
                Err(QueueError::Shutdown) => Err(ProcessError::Shutdown),
                Err(QueueError::Cancelled) => Err(ProcessError::Cancelled),
                Err(QueueError::Handler(e)) => Err(ProcessError::Render(e)),
            }
        }
    }
}
