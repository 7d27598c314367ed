//! In-process channel dispatching requests to a local service.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable, BoxFuture};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

use conduit_core::{
    Channel, ConduitError, NullControl, RequestControl, Response, SendOptions, SharedControl,
    SharedHandler, SharedRequest,
};

use crate::mux::Multiplexer;

/// Trait for serving requests sent through a [`LocalChannel`].
pub trait Service: Send + Sync + 'static {
    /// Handle a request.
    fn handle(&self, request: SharedRequest) -> BoxFuture<'static, Result<Response, ConduitError>>;
}

/// A [`Service`] backed by a closure. See [`service_fn`].
pub struct ServiceFn<F> {
    f: F,
}

/// Build a [`Service`] from an async closure.
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(SharedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, ConduitError>> + Send + 'static,
{
    ServiceFn { f }
}

impl<F, Fut> Service for ServiceFn<F>
where
    F: Fn(SharedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, ConduitError>> + Send + 'static,
{
    fn handle(&self, request: SharedRequest) -> BoxFuture<'static, Result<Response, ConduitError>> {
        Box::pin((self.f)(request))
    }
}

/// Configuration for a local channel.
#[derive(Debug, Clone)]
pub struct LocalChannelConfig {
    /// Name reported as the endpoint description.
    pub name: String,

    /// Request timeout used when neither options nor request carry one.
    pub default_timeout: Option<Duration>,
}

impl Default for LocalChannelConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            default_timeout: None,
        }
    }
}

impl LocalChannelConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

struct LocalInner<S> {
    service: S,
    config: LocalChannelConfig,
    mux: Multiplexer,
    terminated: Mutex<Option<ConduitError>>,
    runtime: Option<Handle>,
    sends: AtomicUsize,
}

/// Base channel serving requests with an in-process [`Service`].
///
/// Each request runs as its own task on the ambient tokio runtime. The
/// channel enforces the effective timeout, honors cancellation and
/// acknowledges requests on acceptance when asked to.
///
/// ## Example
///
/// ```rust
/// use conduit_core::{ChannelExt, Request, Response, SendOptions};
/// use conduit_transport::{LocalChannel, service_fn};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let channel = LocalChannel::new(service_fn(|request| async move {
///     Ok(Response::new(request.body.clone()))
/// }));
///
/// let request = Request::new("echo", "Echo").with_body("hello").shared();
/// let response = channel.call(request, SendOptions::new()).await.unwrap();
/// assert_eq!(&response.body[..], b"hello");
/// # }
/// ```
pub struct LocalChannel<S> {
    inner: Arc<LocalInner<S>>,
}

impl<S: Service> LocalChannel<S> {
    /// Create a local channel with default configuration.
    pub fn new(service: S) -> Self {
        Self::with_config(LocalChannelConfig::default(), service)
    }

    /// Create a local channel with custom configuration.
    pub fn with_config(config: LocalChannelConfig, service: S) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                service,
                config,
                mux: Multiplexer::new(),
                terminated: Mutex::new(None),
                runtime: Handle::try_current().ok(),
                sends: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of `send` calls accepted or rejected so far.
    #[must_use]
    pub fn send_count(&self) -> usize {
        self.inner.sends.load(Ordering::SeqCst)
    }

    /// Number of requests still in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.mux.pending_count()
    }

    /// Check whether the channel has been terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.lock().is_some()
    }
}

impl<S> Clone for LocalChannel<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Service> Channel for LocalChannel<S> {
    fn endpoint_description(&self) -> String {
        self.inner.config.name.clone()
    }

    fn send(
        &self,
        request: SharedRequest,
        handler: SharedHandler,
        options: SendOptions,
    ) -> SharedControl {
        self.inner.sends.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.inner.terminated.lock().clone() {
            handler.on_error(ConduitError::terminated(error));
            return NullControl::shared();
        }

        let Some(runtime) = Handle::try_current().ok().or_else(|| self.inner.runtime.clone())
        else {
            handler.on_error(ConduitError::unavailable("no async runtime to serve request"));
            return NullControl::shared();
        };

        // Accepted requests are acknowledged before anything else can reach
        // the handler.
        if options.request_ack {
            handler.on_acknowledgement();
        }

        let timeout = options
            .effective_timeout(&request)
            .or(self.inner.config.default_timeout);
        let (deadline_tx, deadline_rx) = watch::channel(timeout.and_then(deadline_after));
        let (abort, registration) = AbortHandle::new_pair();
        let id = self.inner.mux.register(handler, abort);

        // A terminate that ran between the check above and registration has
        // already swept the multiplexer.
        if let Some(error) = self.inner.terminated.lock().clone() {
            self.inner
                .mux
                .dispatch_error(id, ConduitError::terminated(error));
            return NullControl::shared();
        }

        tracing::trace!(
            id,
            request_id = request.request_id,
            method = %request.method,
            "Dispatching local request"
        );

        let inner = self.inner.clone();
        let task = Abortable::new(serve(inner, id, request, deadline_rx), registration);
        runtime.spawn(task);

        Arc::new(LocalControl {
            inner: self.inner.clone(),
            id,
            deadline: deadline_tx,
        })
    }

    fn terminate(&self, error: ConduitError) -> BoxFuture<'static, ()> {
        let first = {
            let mut terminated = self.inner.terminated.lock();
            if terminated.is_none() {
                *terminated = Some(error.clone());
                true
            } else {
                false
            }
        };

        if first {
            tracing::debug!(
                endpoint = %self.inner.config.name,
                pending = self.inner.mux.pending_count(),
                "Terminating local channel"
            );
            self.inner
                .mux
                .cancel_all(&ConduitError::terminated(error));
        }

        Box::pin(async {})
    }
}

type Deadline = Option<(Duration, Instant)>;

/// Deadline `timeout` from now, or none if it lies beyond what `Instant` can represent.
fn deadline_after(timeout: Duration) -> Deadline {
    Instant::now()
        .checked_add(timeout)
        .map(|at| (timeout, at))
}

async fn serve<S: Service>(
    inner: Arc<LocalInner<S>>,
    id: u64,
    request: SharedRequest,
    mut deadline: watch::Receiver<Deadline>,
) {
    let mut call = inner.service.handle(request);

    loop {
        let current = *deadline.borrow_and_update();
        let expired = async {
            match current {
                Some((_, at)) => tokio::time::sleep_until(at).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = &mut call => {
                match result {
                    Ok(response) => inner.mux.dispatch(id, response),
                    Err(error) => inner.mux.dispatch_error(id, error),
                };
                return;
            }
            () = expired => {
                let timeout = current.map(|(t, _)| t).unwrap_or_default();
                inner.mux.dispatch_error(id, ConduitError::Timeout(timeout));
                return;
            }
            changed = deadline.changed() => {
                if changed.is_err() {
                    // Control dropped: keep the last deadline and stop watching.
                    let result = match current {
                        Some((t, at)) => tokio::time::timeout_at(at, &mut call)
                            .await
                            .unwrap_or(Err(ConduitError::Timeout(t))),
                        None => call.await,
                    };
                    match result {
                        Ok(response) => inner.mux.dispatch(id, response),
                        Err(error) => inner.mux.dispatch_error(id, error),
                    };
                    return;
                }
            }
        }
    }
}

/// Control for a request served by a [`LocalChannel`].
struct LocalControl<S> {
    inner: Arc<LocalInner<S>>,
    id: u64,
    deadline: watch::Sender<Deadline>,
}

impl<S: Service> RequestControl for LocalControl<S> {
    fn cancel(&self) {
        self.inner.mux.cancel(self.id);
    }

    fn set_timeout(&self, timeout: Duration) {
        let _ = self.deadline.send(deadline_after(timeout));
    }
}
