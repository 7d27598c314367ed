//! # conduit-transport
//!
//! Base channels for conduit.
//!
//! This crate provides:
//! - `LocalChannel` - In-process channel serving requests with a `Service`
//! - `Multiplexer` - Pending request bookkeeping shared by base channels
//!
//! Socket transports are supplied by the embedding application; anything
//! implementing `conduit_core::Channel` can sit underneath the decorators.

mod local;
mod mux;

pub use local::{LocalChannel, LocalChannelConfig, Service, ServiceFn, service_fn};
pub use mux::Multiplexer;
