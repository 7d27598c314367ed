//! Channel supplying a default timeout to requests that carry none.

use std::time::Duration;

use futures::future::BoxFuture;

use conduit_core::{
    Channel, ConduitError, NullControl, SendOptions, SharedChannel, SharedControl, SharedHandler,
    SharedRequest,
};

/// Channel that ensures every send has a timeout.
///
/// Sends without a timeout (neither in their options nor on the request) get
/// the default one. If a maximum is configured, longer timeouts are clamped
/// to it.
///
/// ## Example
///
/// ```rust
/// use conduit_core::{Response, SharedRequest};
/// use conduit_middleware::DefaultTimeoutChannel;
/// use conduit_transport::{LocalChannel, service_fn};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let base = LocalChannel::new(service_fn(|_request: SharedRequest| async {
///     Ok(Response::default())
/// }));
/// let channel = DefaultTimeoutChannel::new(Arc::new(base), Duration::from_secs(30))
///     .with_max(Duration::from_secs(60));
/// assert_eq!(channel.default_timeout(), Duration::from_secs(30));
/// ```
pub struct DefaultTimeoutChannel {
    inner: SharedChannel,
    /// Timeout for sends that carry none.
    default_timeout: Duration,
    /// Upper bound enforced even if a send asks for longer.
    max_timeout: Option<Duration>,
}

impl DefaultTimeoutChannel {
    /// Wrap `inner` with the given default timeout.
    #[must_use]
    pub fn new(inner: SharedChannel, default_timeout: Duration) -> Self {
        Self {
            inner,
            default_timeout,
            max_timeout: None,
        }
    }

    /// Set a maximum timeout enforced even if a send asks for longer.
    #[must_use]
    pub fn with_max(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = Some(max_timeout);
        self
    }

    /// Get the default timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn resolve_timeout(&self, requested: Option<Duration>) -> Duration {
        let timeout = requested.unwrap_or(self.default_timeout);
        match self.max_timeout {
            Some(max) => timeout.min(max),
            None => timeout,
        }
    }
}

impl Channel for DefaultTimeoutChannel {
    fn endpoint_description(&self) -> String {
        self.inner.endpoint_description()
    }

    fn send(
        &self,
        request: SharedRequest,
        handler: SharedHandler,
        mut options: SendOptions,
    ) -> SharedControl {
        let timeout = self.resolve_timeout(options.effective_timeout(&request));

        // Already expired
        if timeout.is_zero() {
            handler.on_error(ConduitError::Timeout(timeout));
            return NullControl::shared();
        }

        options.timeout = Some(timeout);
        self.inner.send(request, handler, options)
    }

    fn terminate(&self, error: ConduitError) -> BoxFuture<'static, ()> {
        self.inner.terminate(error)
    }
}
