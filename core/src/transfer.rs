//! Upload and download tasks.
//!
//! Both wrap a `RequestTask` and reuse its lifecycle, cancellation and
//! credential refresh. An upload reads its body from a file right before
//! dispatch; a download writes the response body to a file and hands back
//! the location instead of the bytes.
//!
//! A download is written to a hidden sibling of the destination and renamed
//! into place once complete, so the destination never holds a partial body.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;
use uuid::Uuid;

use crate::client::Dispatch;
use crate::error::TaskError;
use crate::http::{HttpRequest, HttpResponse};
use crate::task::{DownloadCompletionHandler, RequestTask, TaskState, UploadCompletionHandler};

/// Result of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    /// Status and headers of the response. The body has been moved to
    /// `path` and is empty here.
    pub response: HttpResponse,
}

/// Sends the contents of a file as the request body.
#[derive(Debug)]
pub struct UploadTask {
    task: RequestTask,
    source: PathBuf,
}

impl UploadTask {
    pub fn new(
        request: HttpRequest,
        source: impl Into<PathBuf>,
        client: Arc<dyn Dispatch>,
    ) -> Result<Self, TaskError> {
        Ok(Self {
            task: RequestTask::new(request, client)?,
            source: source.into(),
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn task(&self) -> &RequestTask {
        &self.task
    }

    pub fn execute(&self, on_complete: UploadCompletionHandler) -> Result<(), TaskError> {
        let handle = Handle::try_current().map_err(|_| TaskError::NoRuntime)?;
        let source = self.source.clone();
        self.task.launch(
            &handle,
            move |client, mut request, refresh| async move {
                let body = tokio::fs::read(&source).await?;
                debug!(path = %source.display(), bytes = body.len(), "uploading file");
                request.body = Some(body);
                refresh.run(client.as_ref(), &request).await
            },
            on_complete,
        )
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }
}

/// Stores the response body in a file.
#[derive(Debug)]
pub struct DownloadTask {
    task: RequestTask,
    destination: PathBuf,
}

impl DownloadTask {
    pub fn new(
        request: HttpRequest,
        destination: impl Into<PathBuf>,
        client: Arc<dyn Dispatch>,
    ) -> Result<Self, TaskError> {
        Ok(Self {
            task: RequestTask::new(request, client)?,
            destination: destination.into(),
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn task(&self) -> &RequestTask {
        &self.task
    }

    pub fn execute(&self, on_complete: DownloadCompletionHandler) -> Result<(), TaskError> {
        let handle = Handle::try_current().map_err(|_| TaskError::NoRuntime)?;
        let destination = self.destination.clone();
        self.task.launch(
            &handle,
            move |client, request, refresh| async move {
                let mut response = refresh.run(client.as_ref(), &request).await?;
                let body = std::mem::take(&mut response.body);
                debug!(path = %destination.display(), bytes = body.len(), "writing download");
                let partial = PartialFile::next_to(&destination);
                tokio::fs::write(partial.path(), body).await?;
                partial.persist(&destination).await?;
                Ok(DownloadedFile {
                    path: destination,
                    response,
                })
            },
            on_complete,
        )
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }
}

/// Scratch file beside a download destination. Removed on drop unless
/// persisted.
struct PartialFile {
    path: PathBuf,
    persisted: bool,
}

impl PartialFile {
    fn next_to(destination: &Path) -> Self {
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let scratch = format!(".{name}.{}.part", Uuid::new_v4().simple());
        Self {
            path: destination.with_file_name(scratch),
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(mut self, destination: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, destination).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
