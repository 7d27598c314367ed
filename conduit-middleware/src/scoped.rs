//! Scoped channel draining in-flight requests on termination.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use conduit_core::{
    Channel, ConduitError, NullControl, Response, ResponseHandler, SendOptions, SharedChannel,
    SharedControl, SharedHandler, SharedRequest,
};

type SharedSignal = Shared<BoxFuture<'static, ()>>;

struct ScopeState {
    outstanding: u32,
    terminated: Option<ConduitError>,
    drain: Option<oneshot::Sender<()>>,
}

struct ScopeInner {
    channel: SharedChannel,
    state: Mutex<ScopeState>,
    drained: SharedSignal,
    termination: Mutex<Option<SharedSignal>>,
}

impl ScopeInner {
    fn release(&self) {
        let drain = {
            let mut state = self.state.lock();
            state.outstanding -= 1;
            if state.terminated.is_some() && state.outstanding == 0 {
                state.drain.take()
            } else {
                None
            }
        };

        if let Some(drain) = drain {
            tracing::debug!(
                endpoint = %self.channel.endpoint_description(),
                "Scoped channel drained"
            );
            let _ = drain.send(());
        }
    }
}

/// Channel tracking outstanding requests so termination can wait for them.
///
/// After [`terminate`](Channel::terminate) every new send fails immediately
/// with [`ConduitError::ChannelTerminated`]. The returned future resolves once
/// every request sent before termination has delivered its terminal callback;
/// the wrapped channel is then terminated with the same error. Await it
/// before releasing anything the wrapped channel depends on.
pub struct ScopedChannel {
    inner: Arc<ScopeInner>,
}

impl ScopedChannel {
    /// Wrap `channel`.
    #[must_use]
    pub fn new(channel: SharedChannel) -> Self {
        let (tx, rx) = oneshot::channel();
        let drained = async move {
            let _ = rx.await;
        }
        .boxed()
        .shared();

        Self {
            inner: Arc::new(ScopeInner {
                channel,
                state: Mutex::new(ScopeState {
                    outstanding: 0,
                    terminated: None,
                    drain: Some(tx),
                }),
                drained,
                termination: Mutex::new(None),
            }),
        }
    }

    /// Number of requests sent and not yet completed.
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.inner.state.lock().outstanding
    }

    /// Check whether termination has started.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated.is_some()
    }
}

impl Channel for ScopedChannel {
    fn endpoint_description(&self) -> String {
        self.inner.channel.endpoint_description()
    }

    fn send(
        &self,
        request: SharedRequest,
        handler: SharedHandler,
        options: SendOptions,
    ) -> SharedControl {
        let rejected = {
            let mut state = self.inner.state.lock();
            match &state.terminated {
                Some(error) => Some(ConduitError::terminated(error.clone())),
                None => {
                    state.outstanding += 1;
                    None
                }
            }
        };

        if let Some(error) = rejected {
            handler.on_error(error);
            return NullControl::shared();
        }

        let handler = Arc::new(ScopedHandler {
            inner: handler,
            scope: self.inner.clone(),
            finished: AtomicBool::new(false),
        });
        self.inner.channel.send(request, handler, options)
    }

    fn terminate(&self, error: ConduitError) -> BoxFuture<'static, ()> {
        let drain = {
            let mut state = self.inner.state.lock();
            if state.terminated.is_none() {
                tracing::info!(
                    outstanding = state.outstanding,
                    error = %error,
                    "Terminating scoped channel"
                );
                state.terminated = Some(error.clone());
            }
            if state.outstanding == 0 {
                state.drain.take()
            } else {
                None
            }
        };
        if let Some(drain) = drain {
            let _ = drain.send(());
        }

        let termination = self
            .inner
            .termination
            .lock()
            .get_or_insert_with(|| {
                let drained = self.inner.drained.clone();
                let channel = self.inner.channel.clone();
                async move {
                    drained.await;
                    channel.terminate(error).await;
                }
                .boxed()
                .shared()
            })
            .clone();

        termination.boxed()
    }
}

/// Handler observing the terminal callback for bookkeeping.
struct ScopedHandler {
    inner: SharedHandler,
    scope: Arc<ScopeInner>,
    finished: AtomicBool,
}

impl ScopedHandler {
    fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.scope.release();
        }
    }
}

impl Drop for ScopedHandler {
    fn drop(&mut self) {
        // Discarded by the wrapped channel without a terminal callback.
        self.finish();
    }
}

impl ResponseHandler for ScopedHandler {
    fn on_acknowledgement(&self) {
        self.inner.on_acknowledgement();
    }

    fn on_response(&self, response: Response) {
        self.inner.on_response(response);
        self.finish();
    }

    fn on_error(&self, error: ConduitError) {
        self.inner.on_error(error);
        self.finish();
    }
}
