//! # conduit-core
//!
//! Core types, traits, and error definitions for conduit channels.
//!
//! This crate provides:
//! - The `Channel` trait implemented by transports and decorators alike
//! - Request/response values (`Request`, `Response`, `SendOptions`)
//! - The callback contract (`ResponseHandler`, `RequestControl`)
//! - `ControlThunk`, a control usable before the real send has happened
//! - Error types (`ConduitError`, `TransportError`, `ErrorKind`)

mod channel;
mod control;
mod error;
mod message;

pub use channel::{
    Channel, ChannelExt, NullControl, RequestControl, ResponseHandler, SendOptions, SharedChannel,
    SharedControl, SharedHandler,
};
pub use control::ControlThunk;
pub use error::{ConduitError, ErrorKind, TransportError};
pub use message::{Metadata, Request, Response, SharedRequest};
