//! Request and response values carried through channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

/// Global request ID counter for unique IDs.
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Metadata key-value pairs attached to a request.
pub type Metadata = HashMap<String, String>;

/// Shared, immutable request handed to [`Channel::send`](crate::Channel::send).
pub type SharedRequest = Arc<Request>;

/// Immutable description of a single RPC call.
///
/// A request is built once by the caller and then shared (`Arc`) with every
/// decorator and every physical attempt made on its behalf. Retries re-send
/// the same value, so the request id stays stable across attempts.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique identifier for this request.
    pub request_id: u64,

    /// Target service name. Discovery is keyed by this value.
    pub service: String,

    /// Target method name.
    pub method: String,

    /// Optional object path the call addresses.
    pub path: Option<String>,

    /// Serialized request body.
    pub body: Bytes,

    /// Additional binary attachments.
    pub attachments: Vec<Bytes>,

    /// Custom key-value metadata.
    pub metadata: Metadata,

    /// Per-call timeout. Overridden by [`SendOptions::timeout`](crate::SendOptions).
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a request for `service.method` with an empty body.
    #[must_use]
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            request_id: next_request_id(),
            service: service.into(),
            method: method.into(),
            path: None,
            body: Bytes::new(),
            attachments: Vec::new(),
            metadata: HashMap::new(),
            timeout: None,
        }
    }

    /// Set the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the object path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Append an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: impl Into<Bytes>) -> Self {
        self.attachments.push(attachment.into());
        self
    }

    /// Add metadata to the request.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Get a metadata value.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Freeze the request for sending.
    #[must_use]
    pub fn shared(self) -> SharedRequest {
        Arc::new(self)
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Serialized response body.
    pub body: Bytes,

    /// Binary attachments returned by the peer.
    pub attachments: Vec<Bytes>,
}

impl Response {
    /// Create a response with the given body.
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    /// Append an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: impl Into<Bytes>) -> Self {
        self.attachments.push(attachment.into());
        self
    }
}
