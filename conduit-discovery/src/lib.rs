//! # conduit-discovery
//!
//! Destination discovery for conduit channels.
//!
//! This crate provides:
//! - `ChannelProvider` trait for custom discovery backends
//! - `StaticProvider` and `provider_fn` for fixed or closure-based lookup
//! - `RoamingChannel`, which discovers a channel per service on first use,
//!   deduplicates concurrent lookups and caches the result

mod provider;
mod roaming;

pub use provider::{ChannelProvider, ProviderFn, StaticProvider, provider_fn};
pub use roaming::{RoamingChannel, RoamingStats};
