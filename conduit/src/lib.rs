//! # Conduit
//!
//! Composable resilience decorators for client-side RPC channels.
//!
//! Conduit provides:
//! - **One channel abstraction**: callback-based `send` returning a control
//!   that can cancel or re-time the request, even before it is dispatched
//! - **Retries** with backoff, a retry predicate and an overall deadline
//! - **Roaming**: lazy, deduplicated discovery of the destination per service
//! - **Scoping**: termination that waits for in-flight requests to drain
//! - **In-process transport** for wiring services and tests without a network
//!
//! ## Quick Start
//!
//! ```rust
//! use conduit::{LocalChannel, Request, Response, SendOptions, SharedRequest, service_fn};
//! use conduit::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let channel = LocalChannel::new(service_fn(|request: SharedRequest| async move {
//!     Ok(Response::new(request.body.clone()))
//! }));
//!
//! let request = Request::new("echo", "Echo").with_body("hello").shared();
//! let response = channel.call(request, SendOptions::new()).await.unwrap();
//! assert_eq!(&response.body[..], b"hello");
//! # }
//! ```
//!
//! ## Features
//!
//! - `tracing` (default) - Enable the per-request `TracingChannel`
//!
//! ## Architecture
//!
//! Conduit is composed of several crates:
//!
//! - [`conduit-core`] - Channel traits, messages, errors and `ControlThunk`
//! - [`conduit-middleware`] - Retrying, scoped, timeout and tracing decorators
//! - [`conduit-discovery`] - Channel providers and `RoamingChannel`
//! - [`conduit-transport`] - In-process `LocalChannel` and `Multiplexer`

// Re-export core types
pub use conduit_core::{
    Channel, ChannelExt, ConduitError, ControlThunk, ErrorKind, Metadata, NullControl,
    RequestControl, ResponseHandler, SendOptions, SharedChannel, SharedControl, SharedHandler,
    TransportError,
};

// Re-export message types
pub use conduit_core::{Request, Response, SharedRequest};

// Re-export middleware
pub use conduit_middleware::{
    Backoff, DefaultTimeoutChannel, RetryConfig, RetryPredicate, RetryingChannel, ScopedChannel,
};

#[cfg(feature = "tracing")]
pub use conduit_middleware::{RequestSpanExt, TracingChannel};

// Re-export discovery
pub use conduit_discovery::{
    ChannelProvider, ProviderFn, RoamingChannel, RoamingStats, StaticProvider, provider_fn,
};

// Re-export transport
pub use conduit_transport::{
    LocalChannel, LocalChannelConfig, Multiplexer, Service, ServiceFn, service_fn,
};

/// Prelude module for convenient imports.
///
/// ```rust
/// use conduit::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Channel, ChannelExt, ConduitError, Request, RequestControl, Response, ResponseHandler,
        SendOptions,
    };
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
