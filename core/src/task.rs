//! Single-shot execution of one request through a client.
//!
//! # Design
//! A `RequestTask` owns its request and shares its client. Nothing runs
//! until `execute` is called; that call flips the task from `Idle` to
//! `InFlight`, creates the inner `TaskHandle` (a cancellation token plus the
//! shared state cell) and spawns the operation on the tokio runtime. The
//! runtime owns the running future; the task only keeps what it needs to
//! cancel it.
//!
//! The spawned future races the operation against the token with a
//! `biased` select, so a cancel that arrives before the operation finishes
//! always wins. The completion handler is an `FnOnce` held by a
//! `Completer`, which makes "called exactly once" a property of the types.
//! If the runtime drops the future before it reports (the operation
//! panicked, or the runtime shut down), the completer's `Drop` delivers
//! `Cancelled` instead.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::client::Dispatch;
use crate::error::TaskError;
use crate::http::{HttpRequest, HttpResponse};
use crate::refresh::RefreshPolicy;
use crate::transport::{RawDownloadCompletionHandler, RawUploadCompletionHandler};

/// Outcome delivered to a request task's completion handler.
pub type TaskResult = Result<HttpResponse, TaskError>;

/// Boxed handler for the generic request/response flow.
pub type HttpRequestCompletionHandler = Box<dyn FnOnce(TaskResult) + Send + 'static>;

/// Handler invoked when an upload completes.
pub type UploadCompletionHandler = RawUploadCompletionHandler;

/// Handler invoked when a download completes.
pub type DownloadCompletionHandler = RawDownloadCompletionHandler;

/// Lifecycle of a task. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    InFlight,
    /// Finished with a response or with an error other than cancellation.
    Completed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

/// Reference to a running operation, sufficient to cancel it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancel: CancellationToken,
    state: Arc<Mutex<TaskState>>,
}

impl TaskHandle {
    /// Request cancellation. Does nothing once the operation has finished.
    pub fn cancel(&self) {
        let state = lock(&self.state);
        if *state == TaskState::InFlight {
            debug!("cancellation requested");
            self.cancel.cancel();
        }
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }
}

/// Binds one request to one client and runs it at most once.
pub struct RequestTask {
    id: Uuid,
    request: HttpRequest,
    client: Arc<dyn Dispatch>,
    refresh: RefreshPolicy,
    state: Arc<Mutex<TaskState>>,
    inner: OnceLock<TaskHandle>,
}

impl RequestTask {
    /// Create a task. Fails if the request URL is not an absolute
    /// `http`/`https` URL or a header has an empty name.
    pub fn new(request: HttpRequest, client: Arc<dyn Dispatch>) -> Result<Self, TaskError> {
        validate(&request)?;
        let refresh = client.refresh_policy();
        Ok(Self {
            id: Uuid::new_v4(),
            request,
            client,
            refresh,
            state: Arc::new(Mutex::new(TaskState::Idle)),
            inner: OnceLock::new(),
        })
    }

    pub fn with_refresh_policy(mut self, refresh: RefreshPolicy) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn client(&self) -> &Arc<dyn Dispatch> {
        &self.client
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    /// Handle to the in-flight (or finished) operation; `None` before
    /// `execute`.
    pub fn inner_task(&self) -> Option<&TaskHandle> {
        self.inner.get()
    }

    /// Start the request on the current tokio runtime and return
    /// immediately. `on_complete` runs exactly once on a runtime thread.
    pub fn execute<F>(&self, on_complete: F) -> Result<(), TaskError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|_| TaskError::NoRuntime)?;
        self.execute_on(&handle, on_complete)
    }

    /// Like `execute`, but spawns on an explicit runtime.
    pub fn execute_on<F>(&self, handle: &Handle, on_complete: F) -> Result<(), TaskError>
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.launch(
            handle,
            |client, request, refresh| async move { refresh.run(client.as_ref(), &request).await },
            on_complete,
        )
    }

    /// Start the request and return a future resolving to its outcome.
    pub fn execute_async(&self) -> Result<Completion, TaskError> {
        let (tx, rx) = oneshot::channel();
        self.execute(move |result| {
            let _ = tx.send(result);
        })?;
        Ok(Completion { rx })
    }

    /// Cancel the running operation. A no-op before `execute` and after
    /// completion.
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.get() {
            inner.cancel();
        }
    }

    /// Shared by the request, upload and download flows: moves the task to
    /// `InFlight`, then spawns `op` raced against cancellation.
    pub(crate) fn launch<T, Op, Fut, F>(
        &self,
        handle: &Handle,
        op: Op,
        on_complete: F,
    ) -> Result<(), TaskError>
    where
        T: Send + 'static,
        Op: FnOnce(Arc<dyn Dispatch>, HttpRequest, RefreshPolicy) -> Fut,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let token = CancellationToken::new();
        {
            let mut state = lock(&self.state);
            if *state != TaskState::Idle {
                return Err(TaskError::AlreadyExecuted);
            }
            *state = TaskState::InFlight;
        }
        // Guarded by the Idle check above, so this is the only set.
        let _ = self.inner.set(TaskHandle {
            cancel: token.clone(),
            state: Arc::clone(&self.state),
        });

        let operation = op(Arc::clone(&self.client), self.request.clone(), self.refresh);
        let completer = Completer {
            state: Arc::clone(&self.state),
            on_complete: Some(on_complete),
            _outcome: PhantomData,
        };
        let span = info_span!(
            "request_task",
            task_id = %self.id,
            method = %self.request.method,
            url = %self.request.url,
        );

        handle.spawn(
            async move {
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(TaskError::Cancelled),
                    result = operation => result,
                };
                completer.complete(outcome);
            }
            .instrument(span),
        );
        Ok(())
    }
}

/// Owns the completion handler until the outcome is delivered.
struct Completer<T, F>
where
    F: FnOnce(Result<T, TaskError>),
{
    state: Arc<Mutex<TaskState>>,
    on_complete: Option<F>,
    _outcome: PhantomData<fn(T)>,
}

impl<T, F> Completer<T, F>
where
    F: FnOnce(Result<T, TaskError>),
{
    fn complete(mut self, outcome: Result<T, TaskError>) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: Result<T, TaskError>) {
        let Some(on_complete) = self.on_complete.take() else {
            return;
        };
        let terminal = match &outcome {
            Ok(_) => {
                debug!("task completed");
                TaskState::Completed
            }
            Err(TaskError::Cancelled) => {
                debug!("task cancelled");
                TaskState::Cancelled
            }
            Err(err) => {
                warn!(error = %err, "task failed");
                TaskState::Completed
            }
        };
        *lock(&self.state) = terminal;
        on_complete(outcome);
    }
}

impl<T, F> Drop for Completer<T, F>
where
    F: FnOnce(Result<T, TaskError>),
{
    fn drop(&mut self) {
        if self.on_complete.is_some() {
            warn!("task dropped before reporting an outcome");
            self.deliver(Err(TaskError::Cancelled));
        }
    }
}

impl std::fmt::Debug for RequestTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTask")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Future returned by `RequestTask::execute_async`.
///
/// Resolves to `TaskError::Cancelled` if the runtime drops the operation
/// before it reports.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<TaskResult>,
}

impl Future for Completion {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TaskResult> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(TaskError::Cancelled)))
    }
}

fn validate(request: &HttpRequest) -> Result<(), TaskError> {
    let url = url::Url::parse(&request.url)
        .map_err(|e| TaskError::InvalidRequest(format!("{}: {e}", request.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TaskError::InvalidRequest(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    if request.headers.iter().any(|(name, _)| name.trim().is_empty()) {
        return Err(TaskError::InvalidRequest("empty header name".to_string()));
    }
    Ok(())
}

fn lock(state: &Mutex<TaskState>) -> MutexGuard<'_, TaskState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
