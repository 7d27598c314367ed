//! Channel trait definitions.
//!
//! A [`Channel`] is a logical RPC destination. Concrete transports and the
//! resilience decorators built on top of them all implement the same trait,
//! so decorators nest in any order.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::ConduitError;
use crate::message::{Response, SharedRequest};

/// Callback sink receiving the outcome of a single request.
///
/// Every request ends with exactly one call to either
/// [`on_response`](Self::on_response) or [`on_error`](Self::on_error),
/// optionally preceded by one [`on_acknowledgement`](Self::on_acknowledgement).
pub trait ResponseHandler: Send + Sync + 'static {
    /// The peer has accepted the request for processing.
    fn on_acknowledgement(&self) {}

    /// The request completed successfully.
    fn on_response(&self, response: Response);

    /// The request failed.
    fn on_error(&self, error: ConduitError);
}

/// Shared response handler.
pub type SharedHandler = Arc<dyn ResponseHandler>;

/// Handle returned synchronously from [`Channel::send`].
pub trait RequestControl: Send + Sync + 'static {
    /// Cancel the request. The handler receives [`ConduitError::Cancelled`]
    /// unless the request has already completed.
    fn cancel(&self);

    /// Change the timeout of the in-flight request.
    fn set_timeout(&self, timeout: Duration);
}

/// Shared request control.
pub type SharedControl = Arc<dyn RequestControl>;

/// Control for requests that never reached a transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullControl;

impl NullControl {
    /// Shared instance.
    #[must_use]
    pub fn shared() -> SharedControl {
        Arc::new(Self)
    }
}

impl RequestControl for NullControl {
    fn cancel(&self) {}

    fn set_timeout(&self, _timeout: Duration) {}
}

/// Per-send options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Timeout for this send. Falls back to [`Request::timeout`](crate::Request).
    pub timeout: Option<Duration>,

    /// Ask the peer for an acknowledgement before the response.
    pub request_ack: bool,
}

impl SendOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Request an acknowledgement.
    #[must_use]
    pub fn request_ack(mut self, enabled: bool) -> Self {
        self.request_ack = enabled;
        self
    }

    /// Timeout that applies to `request` when sent with these options.
    #[must_use]
    pub fn effective_timeout(&self, request: &SharedRequest) -> Option<Duration> {
        self.timeout.or(request.timeout)
    }
}

/// Core channel trait.
///
/// Implementations must be callable concurrently from any number of callers.
/// `send` never blocks and never reports failure through its return value:
/// every outcome reaches the handler.
pub trait Channel: Send + Sync + 'static {
    /// Human-readable description of the destination, used in logs.
    fn endpoint_description(&self) -> String;

    /// Send a request. The returned control is valid even when the real
    /// transport is not known yet.
    fn send(
        &self,
        request: SharedRequest,
        handler: SharedHandler,
        options: SendOptions,
    ) -> SharedControl;

    /// Terminate the channel.
    ///
    /// Idempotent. Once called, every later `send` fails immediately with
    /// [`ConduitError::ChannelTerminated`] wrapping `error`.
    fn terminate(&self, error: ConduitError) -> BoxFuture<'static, ()>;
}

/// Shared channel.
pub type SharedChannel = Arc<dyn Channel>;

/// Handler that resolves a oneshot with the request outcome.
struct FutureHandler {
    sender: parking_lot::Mutex<Option<oneshot::Sender<Result<Response, ConduitError>>>>,
}

impl FutureHandler {
    fn complete(&self, result: Result<Response, ConduitError>) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(result);
        }
    }
}

impl ResponseHandler for FutureHandler {
    fn on_response(&self, response: Response) {
        self.complete(Ok(response));
    }

    fn on_error(&self, error: ConduitError) {
        self.complete(Err(error));
    }
}

/// Awaitable adapters over the callback API.
pub trait ChannelExt: Channel {
    /// Send `request` and wait for its outcome.
    ///
    /// The request is dispatched before the returned future is first polled.
    fn call(
        &self,
        request: SharedRequest,
        options: SendOptions,
    ) -> BoxFuture<'static, Result<Response, ConduitError>> {
        let (tx, rx) = oneshot::channel();
        let handler = Arc::new(FutureHandler {
            sender: parking_lot::Mutex::new(Some(tx)),
        });
        let _control = self.send(request, handler, options);

        Box::pin(async move { rx.await.unwrap_or(Err(ConduitError::Cancelled)) })
    }
}

impl<C: Channel + ?Sized> ChannelExt for C {}
