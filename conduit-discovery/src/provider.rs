//! Channel provider trait and common implementations.

use std::future::Future;

use dashmap::DashMap;
use futures::future::BoxFuture;

use conduit_core::{ConduitError, SharedChannel};

/// Trait for discovery backends resolving a service name to a channel.
///
/// Implementations decide *how* a destination is found (static table,
/// registry lookup, peer discovery...). [`RoamingChannel`](crate::RoamingChannel)
/// decides *when* to ask and caches the answer.
///
/// ## Example
///
/// ```rust
/// use conduit_core::{Response, SharedRequest};
/// use conduit_discovery::StaticProvider;
/// use conduit_transport::{LocalChannel, service_fn};
/// use std::sync::Arc;
///
/// let provider = StaticProvider::new();
/// provider.add_channel(
///     "echo",
///     Arc::new(LocalChannel::new(service_fn(|request: SharedRequest| async move {
///         Ok(Response::new(request.body.clone()))
///     }))),
/// );
/// assert!(provider.contains("echo"));
/// ```
pub trait ChannelProvider: Send + Sync + 'static {
    /// Human-readable description of the discovery source, used in logs.
    fn endpoint_description(&self) -> String;

    /// Resolve `service` to a channel.
    fn get_channel(&self, service: &str) -> BoxFuture<'static, Result<SharedChannel, ConduitError>>;

    /// Release resources held by the provider.
    fn terminate(&self, error: ConduitError) -> BoxFuture<'static, ()> {
        let _ = error;
        Box::pin(async {})
    }
}

/// A provider returning pre-registered channels.
///
/// Useful for testing or when destinations are known at wiring time.
pub struct StaticProvider {
    channels: DashMap<String, SharedChannel>,
}

impl StaticProvider {
    /// Create a new empty static provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Register the channel serving `service`.
    pub fn add_channel(&self, service: impl Into<String>, channel: SharedChannel) {
        self.channels.insert(service.into(), channel);
    }

    /// Check whether `service` has a registered channel.
    #[must_use]
    pub fn contains(&self, service: &str) -> bool {
        self.channels.contains_key(service)
    }
}

impl Default for StaticProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelProvider for StaticProvider {
    fn endpoint_description(&self) -> String {
        "static".to_string()
    }

    fn get_channel(&self, service: &str) -> BoxFuture<'static, Result<SharedChannel, ConduitError>> {
        let result = self
            .channels
            .get(service)
            .map(|channel| channel.value().clone())
            .ok_or_else(|| ConduitError::no_route(service, "service not registered"));
        Box::pin(async move { result })
    }
}

/// A provider backed by a closure. See [`provider_fn`].
pub struct ProviderFn<F> {
    f: F,
}

/// Build a [`ChannelProvider`] from an async closure taking the service name.
pub fn provider_fn<F, Fut>(f: F) -> ProviderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SharedChannel, ConduitError>> + Send + 'static,
{
    ProviderFn { f }
}

impl<F, Fut> ChannelProvider for ProviderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SharedChannel, ConduitError>> + Send + 'static,
{
    fn endpoint_description(&self) -> String {
        "dynamic".to_string()
    }

    fn get_channel(&self, service: &str) -> BoxFuture<'static, Result<SharedChannel, ConduitError>> {
        Box::pin((self.f)(service.to_string()))
    }
}
