//! Request tracing channel.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{Span, info_span};

use conduit_core::{
    Channel, ConduitError, Request, Response, ResponseHandler, SendOptions, SharedChannel,
    SharedControl, SharedHandler, SharedRequest,
};

/// Channel wrapping every request in a tracing span.
///
/// This channel:
/// - Creates an `rpc` span per request carrying its id, service and method
/// - Runs the wrapped `send` inside that span so inner decorators log into it
/// - Logs the outcome with the elapsed time
///
/// ## Example
///
/// ```rust,ignore
/// use conduit_middleware::TracingChannel;
///
/// let channel = TracingChannel::new(inner);
/// ```
pub struct TracingChannel {
    inner: SharedChannel,
}

impl TracingChannel {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: SharedChannel) -> Self {
        Self { inner }
    }
}

impl Channel for TracingChannel {
    fn endpoint_description(&self) -> String {
        self.inner.endpoint_description()
    }

    fn send(
        &self,
        request: SharedRequest,
        handler: SharedHandler,
        options: SendOptions,
    ) -> SharedControl {
        let span = request.span(&self.inner.endpoint_description());
        let handler = Arc::new(TracingHandler {
            inner: handler,
            span: span.clone(),
            started: Instant::now(),
        });

        span.in_scope(|| {
            tracing::debug!(timeout = ?options.effective_timeout(&request), "Sending request");
            self.inner.send(request, handler, options)
        })
    }

    fn terminate(&self, error: ConduitError) -> BoxFuture<'static, ()> {
        tracing::debug!(
            endpoint = %self.inner.endpoint_description(),
            error = %error,
            "Terminating channel"
        );
        self.inner.terminate(error)
    }
}

struct TracingHandler {
    inner: SharedHandler,
    span: Span,
    started: Instant,
}

impl ResponseHandler for TracingHandler {
    fn on_acknowledgement(&self) {
        self.span.in_scope(|| tracing::trace!("Request acknowledged"));
        self.inner.on_acknowledgement();
    }

    fn on_response(&self, response: Response) {
        self.span.in_scope(|| {
            tracing::debug!(
                elapsed = ?self.started.elapsed(),
                bytes = response.body.len(),
                "Request succeeded"
            );
        });
        self.inner.on_response(response);
    }

    fn on_error(&self, error: ConduitError) {
        self.span.in_scope(|| {
            tracing::error!(
                elapsed = ?self.started.elapsed(),
                kind = %error.kind(),
                error = %error,
                "RPC request failed"
            );
        });
        self.inner.on_error(error);
    }
}

/// Extension trait for creating spans from requests.
pub trait RequestSpanExt {
    /// Create a tracing span for this request sent to `endpoint`.
    fn span(&self, endpoint: &str) -> Span;
}

impl RequestSpanExt for Request {
    fn span(&self, endpoint: &str) -> Span {
        info_span!(
            "rpc",
            request_id = self.request_id,
            service = %self.service,
            method = %self.method,
            endpoint = endpoint,
        )
    }
}
