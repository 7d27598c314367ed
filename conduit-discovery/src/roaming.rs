//! Roaming channel resolving its destination lazily per service.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use parking_lot::RwLock;
use tokio::runtime::Handle;

use conduit_core::{
    Channel, ConduitError, ControlThunk, NullControl, SendOptions, SharedChannel, SharedControl,
    SharedHandler, SharedRequest,
};

use crate::provider::ChannelProvider;

type DiscoveryFuture = Shared<BoxFuture<'static, Result<SharedChannel, ConduitError>>>;

/// A memoized discovery for one service.
///
/// `generation` tells apart a failed promise from the one replacing it, so a
/// late eviction never removes a newer promise.
#[derive(Clone)]
struct DiscoveryPromise {
    generation: u64,
    future: DiscoveryFuture,
}

/// Counters describing how a [`RoamingChannel`] dispatched its sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoamingStats {
    /// Discovery promises created.
    pub discoveries: u64,
    /// Sends dispatched synchronously on an already-resolved channel.
    pub fast_path_sends: u64,
    /// Sends that returned a pending control and waited for discovery.
    pub pending_sends: u64,
}

#[derive(Default)]
struct Termination {
    error: Option<ConduitError>,
    future: Option<Shared<BoxFuture<'static, ()>>>,
}

struct RoamingInner {
    provider: Arc<dyn ChannelProvider>,
    promises: DashMap<String, DiscoveryPromise>,
    next_generation: AtomicU64,
    /// Sends hold it shared while admitting a discovery; `terminate` holds it
    /// exclusively while snapshotting `promises`.
    termination: RwLock<Termination>,
    runtime: Option<Handle>,
    discoveries: AtomicU64,
    fast_path_sends: AtomicU64,
    pending_sends: AtomicU64,
}

impl RoamingInner {
    /// Get the promise for `service`, starting a discovery if none is cached.
    fn discovery(&self, service: &str) -> DiscoveryPromise {
        if let Some(promise) = self.promises.get(service) {
            return promise.value().clone();
        }

        self.promises
            .entry(service.to_string())
            .or_insert_with(|| {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                self.discoveries.fetch_add(1, Ordering::Relaxed);

                let provider = self.provider.clone();
                let name = service.to_string();
                let future = async move {
                    tracing::debug!(
                        service = %name,
                        provider = %provider.endpoint_description(),
                        "Discovering channel"
                    );
                    provider.get_channel(&name).await
                }
                .boxed()
                .shared();

                DiscoveryPromise { generation, future }
            })
            .value()
            .clone()
    }

    /// Like [`discovery`](Self::discovery), replacing a failed promise whose
    /// waiters have not evicted it yet.
    fn live_discovery(&self, service: &str) -> DiscoveryPromise {
        let promise = self.discovery(service);
        if matches!(promise.future.peek(), Some(Err(_))) {
            self.evict(service, promise.generation);
            return self.discovery(service);
        }
        promise
    }

    /// Drop the cached promise for `service` if it is still `generation`.
    fn evict(&self, service: &str, generation: u64) {
        if self
            .promises
            .remove_if(service, |_, promise| promise.generation == generation)
            .is_some()
        {
            tracing::debug!(service = %service, "Evicted failed discovery");
        }
    }

    fn termination_error(&self) -> Option<ConduitError> {
        self.termination.read().error.clone()
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) -> bool {
        match Handle::try_current().ok().or_else(|| self.runtime.clone()) {
            Some(runtime) => {
                runtime.spawn(task);
                true
            }
            None => false,
        }
    }
}

/// Channel whose destination is discovered on first use.
///
/// Each request is routed by its `service`. The first send for a service asks
/// the [`ChannelProvider`] for a channel; concurrent sends for the same
/// service share that single discovery. Once it has resolved, sends are
/// dispatched synchronously on the discovered channel.
///
/// While discovery is pending, `send` returns a control that queues `cancel`
/// and `set_timeout` and replays them once the request is dispatched. A
/// request cancelled before that point is never sent.
///
/// A failed discovery is reported unchanged to every waiting request and then
/// evicted, so the next send tries again.
///
/// ## Example
///
/// ```rust,ignore
/// use conduit_discovery::{RoamingChannel, StaticProvider};
///
/// let provider = StaticProvider::new();
/// provider.add_channel("users", users_channel);
///
/// let channel = RoamingChannel::new(provider);
/// let response = channel.call(Request::new("users", "Get").shared(), SendOptions::new()).await?;
/// ```
pub struct RoamingChannel {
    inner: Arc<RoamingInner>,
}

impl RoamingChannel {
    /// Create a roaming channel over `provider`.
    pub fn new(provider: impl ChannelProvider) -> Self {
        Self::from_shared(Arc::new(provider))
    }

    /// Create a roaming channel over a shared provider.
    #[must_use]
    pub fn from_shared(provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            inner: Arc::new(RoamingInner {
                provider,
                promises: DashMap::new(),
                next_generation: AtomicU64::new(0),
                termination: RwLock::new(Termination::default()),
                runtime: Handle::try_current().ok(),
                discoveries: AtomicU64::new(0),
                fast_path_sends: AtomicU64::new(0),
                pending_sends: AtomicU64::new(0),
            }),
        }
    }

    /// Snapshot of the dispatch counters.
    #[must_use]
    pub fn stats(&self) -> RoamingStats {
        RoamingStats {
            discoveries: self.inner.discoveries.load(Ordering::Relaxed),
            fast_path_sends: self.inner.fast_path_sends.load(Ordering::Relaxed),
            pending_sends: self.inner.pending_sends.load(Ordering::Relaxed),
        }
    }

    /// Check whether `service` has a successfully discovered channel.
    #[must_use]
    pub fn is_resolved(&self, service: &str) -> bool {
        self.inner
            .promises
            .get(service)
            .is_some_and(|promise| matches!(promise.future.peek(), Some(Ok(_))))
    }

    /// Check whether the channel has been terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.termination.read().error.is_some()
    }
}

impl Channel for RoamingChannel {
    fn endpoint_description(&self) -> String {
        format!("roaming({})", self.inner.provider.endpoint_description())
    }

    fn send(
        &self,
        request: SharedRequest,
        handler: SharedHandler,
        options: SendOptions,
    ) -> SharedControl {
        let admitted = {
            let termination = self.inner.termination.read();
            match &termination.error {
                Some(error) => Err(error.clone()),
                None => Ok(self.inner.live_discovery(&request.service)),
            }
        };
        let promise = match admitted {
            Ok(promise) => promise,
            Err(error) => {
                handler.on_error(ConduitError::terminated(error));
                return NullControl::shared();
            }
        };

        if let Some(Ok(channel)) = promise.future.peek() {
            self.inner.fast_path_sends.fetch_add(1, Ordering::Relaxed);
            return channel.send(request, handler, options);
        }

        self.inner.pending_sends.fetch_add(1, Ordering::Relaxed);
        let thunk = ControlThunk::with_cancel_hook({
            let handler = handler.clone();
            move || handler.on_error(ConduitError::Cancelled)
        });

        let task = {
            let inner = self.inner.clone();
            let thunk = thunk.clone();
            let handler = handler.clone();
            async move {
                let service = request.service.clone();
                match promise.future.await {
                    Ok(channel) => {
                        if !thunk.claim() {
                            tracing::trace!(service = %service, "Request cancelled during discovery");
                            return;
                        }
                        // The termination snapshot holds this promise and closes the channel.
                        if let Some(error) = inner.termination_error() {
                            handler.on_error(ConduitError::terminated(error));
                            return;
                        }
                        let control = channel.send(request, handler, options);
                        thunk.attach(control);
                    }
                    Err(error) => {
                        inner.evict(&service, promise.generation);
                        if thunk.claim() {
                            tracing::warn!(service = %service, error = %error, "Discovery failed");
                            handler.on_error(error);
                        }
                    }
                }
            }
            .boxed()
        };

        if !self.inner.spawn(task) {
            if thunk.claim() {
                handler.on_error(ConduitError::unavailable("no async runtime for discovery"));
            }
            return NullControl::shared();
        }

        thunk
    }

    fn terminate(&self, error: ConduitError) -> BoxFuture<'static, ()> {
        let mut termination = self.inner.termination.write();
        if termination.error.is_none() {
            tracing::info!(
                provider = %self.inner.provider.endpoint_description(),
                services = self.inner.promises.len(),
                error = %error,
                "Terminating roaming channel"
            );
            termination.error = Some(error.clone());
        }

        termination
            .future
            .get_or_insert_with(|| {
                let promises: Vec<DiscoveryFuture> = self
                    .inner
                    .promises
                    .iter()
                    .map(|entry| entry.value().future.clone())
                    .collect();
                let provider = self.inner.provider.clone();

                async move {
                    let channels = promises.into_iter().map(|future| {
                        let error = error.clone();
                        async move {
                            // Pending discoveries are awaited; failed ones have nothing to close.
                            if let Ok(channel) = future.await {
                                channel.terminate(error).await;
                            }
                        }
                    });
                    join_all(channels).await;
                    provider.terminate(error).await;
                }
                .boxed()
                .shared()
            })
            .clone()
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{StaticProvider, provider_fn};
    use conduit_core::{ChannelExt, ErrorKind, Request, Response};
    use conduit_transport::{LocalChannel, Service, service_fn};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn echo() -> Arc<LocalChannel<impl Service>> {
        Arc::new(LocalChannel::new(service_fn(|request: SharedRequest| async move {
            Ok(Response::new(request.body.clone()))
        })))
    }

    /// Provider waiting on `gate` before handing out `channel`.
    fn gated_provider(
        channel: SharedChannel,
        gate: Arc<Notify>,
        calls: Arc<AtomicUsize>,
    ) -> impl ChannelProvider {
        provider_fn(move |_service: String| {
            let channel = channel.clone();
            let gate = gate.clone();
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                gate.notified().await;
                Ok(channel)
            }
        })
    }

    #[tokio::test]
    async fn test_concurrent_sends_share_discovery() {
        let base = echo();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let roaming = RoamingChannel::new(gated_provider(base.clone(), gate.clone(), calls.clone()));

        let first = roaming.call(
            Request::new("svc", "A").with_body("one").shared(),
            SendOptions::new(),
        );
        let second = roaming.call(
            Request::new("svc", "B").with_body("two").shared(),
            SendOptions::new(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(base.send_count(), 0);
        gate.notify_one();

        assert_eq!(&first.await.unwrap().body[..], b"one");
        assert_eq!(&second.await.unwrap().body[..], b"two");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(base.send_count(), 2);

        let stats = roaming.stats();
        assert_eq!(stats.discoveries, 1);
        assert_eq!(stats.pending_sends, 2);
        assert_eq!(stats.fast_path_sends, 0);
    }

    #[tokio::test]
    async fn test_fast_path_after_resolution() {
        let provider = StaticProvider::new();
        provider.add_channel("svc", echo());
        let roaming = RoamingChannel::new(provider);

        roaming
            .call(Request::new("svc", "A").shared(), SendOptions::new())
            .await
            .unwrap();
        assert!(roaming.is_resolved("svc"));

        roaming
            .call(Request::new("svc", "B").shared(), SendOptions::new())
            .await
            .unwrap();

        let stats = roaming.stats();
        assert_eq!(stats.discoveries, 1);
        assert_eq!(stats.pending_sends, 1);
        assert_eq!(stats.fast_path_sends, 1);
    }

    #[tokio::test]
    async fn test_services_discovered_independently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let base = echo();
        let provider = provider_fn(move |_service: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            let channel: SharedChannel = base.clone();
            async move { Ok(channel) }
        });
        let roaming = RoamingChannel::new(provider);

        for service in ["users", "orders", "users"] {
            roaming
                .call(Request::new(service, "Get").shared(), SendOptions::new())
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(roaming.stats().discoveries, 2);
    }

    #[tokio::test]
    async fn test_discovery_failure_reported_and_retried() {
        let base = echo();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let channel: SharedChannel = base.clone();
        let provider = provider_fn(move |service: String| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let channel = channel.clone();
            async move {
                if attempt == 0 {
                    Err(ConduitError::no_route(service, "registry unreachable"))
                } else {
                    Ok(channel)
                }
            }
        });
        let roaming = RoamingChannel::new(provider);

        let error = roaming
            .call(Request::new("svc", "A").shared(), SendOptions::new())
            .await
            .unwrap_err();
        match error {
            ConduitError::NoRoute { service, reason } => {
                assert_eq!(service, "svc");
                assert_eq!(reason, "registry unreachable");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(base.send_count(), 0);

        // The failed promise was evicted, so discovery runs again.
        roaming
            .call(Request::new("svc", "B").shared(), SendOptions::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(base.send_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_discovery_suppresses_send() {
        let base = echo();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let roaming = RoamingChannel::new(gated_provider(base.clone(), gate.clone(), calls));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let control = roaming.send(
            Request::new("svc", "A").shared(),
            Arc::new(OneshotHandler::new(tx)),
            SendOptions::new(),
        );
        control.cancel();

        let error = rx.await.unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cancelled);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(base.send_count(), 0);
        assert!(roaming.is_resolved("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_timeout_replayed() {
        let slow = Arc::new(LocalChannel::new(service_fn(|_request: SharedRequest| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Response::default())
        })));
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let roaming = RoamingChannel::new(gated_provider(slow.clone(), gate.clone(), calls));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let control = roaming.send(
            Request::new("svc", "A").shared(),
            Arc::new(OneshotHandler::new(tx)),
            SendOptions::new(),
        );
        control.set_timeout(Duration::from_millis(50));
        gate.notify_one();

        let error = rx.await.unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(slow.send_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_closes_discovered_channels() {
        let base = echo();
        let provider = StaticProvider::new();
        provider.add_channel("svc", base.clone());
        let roaming = RoamingChannel::new(provider);

        roaming
            .call(Request::new("svc", "A").shared(), SendOptions::new())
            .await
            .unwrap();

        roaming.terminate(ConduitError::unavailable("shutdown")).await;
        roaming.terminate(ConduitError::unavailable("again")).await;
        assert!(roaming.is_terminated());
        assert!(base.is_terminated());

        let error = roaming
            .call(Request::new("svc", "B").shared(), SendOptions::new())
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ChannelTerminated);
        assert_eq!(base.send_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_waits_for_pending_discovery() {
        let base = echo();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let roaming = RoamingChannel::new(gated_provider(base.clone(), gate.clone(), calls));

        let pending = roaming.call(Request::new("svc", "A").shared(), SendOptions::new());
        let mut terminating = tokio::spawn(roaming.terminate(ConduitError::Cancelled));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!terminating.is_finished());

        gate.notify_one();
        (&mut terminating).await.unwrap();
        assert!(base.is_terminated());

        // Dispatch found the channel terminated; either layer may report it.
        let error = pending.await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ChannelTerminated);
    }

    #[tokio::test]
    async fn test_terminate_after_failed_pending_discovery() {
        let gate = Arc::new(Notify::new());
        let provider = {
            let gate = gate.clone();
            provider_fn(move |service: String| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Err(ConduitError::no_route(service, "not registered"))
                }
            })
        };
        let roaming = RoamingChannel::new(provider);

        let pending = roaming.call(Request::new("svc", "A").shared(), SendOptions::new());
        let mut terminating = tokio::spawn(roaming.terminate(ConduitError::Cancelled));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!terminating.is_finished());

        gate.notify_one();
        (&mut terminating).await.unwrap();

        let error = pending.await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NoRoute);
    }

    /// Answers immediately and remembers whether it was terminated.
    #[derive(Default)]
    struct FlagChannel {
        terminated: AtomicBool,
    }

    impl Channel for FlagChannel {
        fn endpoint_description(&self) -> String {
            "flag".to_string()
        }

        fn send(
            &self,
            _request: SharedRequest,
            handler: SharedHandler,
            _options: SendOptions,
        ) -> SharedControl {
            handler.on_response(Response::default());
            NullControl::shared()
        }

        fn terminate(&self, _error: ConduitError) -> BoxFuture<'static, ()> {
            self.terminated.store(true, Ordering::SeqCst);
            futures::future::ready(()).boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_terminate_covers_every_admitted_discovery() {
        let created: Arc<Mutex<Vec<Arc<FlagChannel>>>> = Arc::new(Mutex::new(Vec::new()));
        let provider = {
            let created = created.clone();
            provider_fn(move |_service: String| {
                let channel = Arc::new(FlagChannel::default());
                created.lock().push(channel.clone());
                async move { Ok(channel as SharedChannel) }
            })
        };
        let roaming = Arc::new(RoamingChannel::new(provider));

        let senders: Vec<_> = (0..4)
            .map(|worker| {
                let roaming = roaming.clone();
                tokio::spawn(async move {
                    for i in 0..200 {
                        let _ = roaming.call(
                            Request::new(format!("svc-{worker}-{i}"), "Get").shared(),
                            SendOptions::new(),
                        );
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        roaming.terminate(ConduitError::Cancelled).await;
        let discovered = created.lock().clone();
        assert!(discovered.iter().all(|channel| channel.terminated.load(Ordering::SeqCst)));

        for sender in senders {
            sender.await.unwrap();
        }
        // Sends arriving after termination never reach the provider.
        assert_eq!(created.lock().len(), discovered.len());
    }

    struct OneshotHandler {
        sender: Mutex<Option<tokio::sync::oneshot::Sender<Result<Response, ConduitError>>>>,
    }

    impl OneshotHandler {
        fn new(sender: tokio::sync::oneshot::Sender<Result<Response, ConduitError>>) -> Self {
            Self {
                sender: Mutex::new(Some(sender)),
            }
        }
    }

    impl conduit_core::ResponseHandler for OneshotHandler {
        fn on_response(&self, response: Response) {
            if let Some(sender) = self.sender.lock().take() {
                let _ = sender.send(Ok(response));
            }
        }

        fn on_error(&self, error: ConduitError) {
            if let Some(sender) = self.sender.lock().take() {
                let _ = sender.send(Err(error));
            }
        }
    }
}
