//! # conduit-middleware
//!
//! Resilience decorators for conduit channels.
//!
//! This crate provides:
//! - `RetryingChannel` for automatic retries with backoff and a deadline
//! - `ScopedChannel` for graceful termination with in-flight draining
//! - `DefaultTimeoutChannel` for enforcing request timeouts
//! - `TracingChannel` for per-request tracing spans (with `tracing` feature)
//!
//! Every decorator implements `conduit_core::Channel`, so they nest in any
//! order.

mod retry;
mod scoped;
mod timeout;

#[cfg(feature = "tracing")]
mod tracing_middleware;

pub use retry::{Backoff, RetryConfig, RetryPredicate, RetryingChannel};
pub use scoped::ScopedChannel;
pub use timeout::DefaultTimeoutChannel;

#[cfg(feature = "tracing")]
pub use tracing_middleware::{RequestSpanExt, TracingChannel};
