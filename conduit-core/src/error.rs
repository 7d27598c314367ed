//! Error types for conduit channels.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Main error type delivered to response handlers.
///
/// Errors are `Clone` so that a single failure can be fanned out to every
/// subscriber of a shared discovery promise or replayed into an aggregate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConduitError {
    /// Transport-level error (connection, IO, etc.)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Request timed out
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Request was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,

    /// Peer is temporarily unable to serve the request
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Peer rejected the request because its queue is full
    #[error("request queue size limit exceeded")]
    Overloaded,

    /// Application error returned by the remote handler
    #[error("service error [{code}]: {message}")]
    Service {
        /// Error code for programmatic handling
        code: u32,
        /// Human-readable error message
        message: String,
    },

    /// Caller is not allowed to perform the request
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Discovery could not find a destination for the service
    #[error("no route to {service}: {reason}")]
    NoRoute {
        /// Service name that was looked up
        service: String,
        /// Reason reported by the provider
        reason: String,
    },

    /// Channel was terminated; carries the termination error
    #[error("channel terminated: {0}")]
    ChannelTerminated(Box<ConduitError>),

    /// Every allowed attempt failed with a retriable error
    #[error("request failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Errors of the individual attempts, oldest first
        inner: Vec<ConduitError>,
    },

    /// The retry deadline left no room for another attempt
    #[error("request retries timed out after {attempts} attempts")]
    RetryDeadlineExceeded {
        /// Number of attempts made
        attempts: u32,
        /// Errors of the individual attempts, oldest first
        inner: Vec<ConduitError>,
    },
}

/// Transport-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// IO error from the underlying transport
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Connection was closed unexpectedly
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to connect to the remote endpoint
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Flat classification of a [`ConduitError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Cancelled,
    Unavailable,
    Overloaded,
    Service,
    Unauthorized,
    InvalidRequest,
    NoRoute,
    ChannelTerminated,
    RetriesExhausted,
    RetryDeadlineExceeded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ConduitError {
    /// Create a service error with code and message.
    #[must_use]
    pub fn service(code: u32, message: impl Into<String>) -> Self {
        Self::Service {
            code,
            message: message.into(),
        }
    }

    /// Create an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create a discovery failure for `service`.
    #[must_use]
    pub fn no_route(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoRoute {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a termination error.
    #[must_use]
    pub fn terminated(reason: ConduitError) -> Self {
        Self::ChannelTerminated(Box::new(reason))
    }

    /// Flat kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Overloaded => ErrorKind::Overloaded,
            Self::Service { .. } => ErrorKind::Service,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::NoRoute { .. } => ErrorKind::NoRoute,
            Self::ChannelTerminated(_) => ErrorKind::ChannelTerminated,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::RetryDeadlineExceeded { .. } => ErrorKind::RetryDeadlineExceeded,
        }
    }

    /// Check if this error is transient and the request may be re-sent.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(TransportError::Io(_)) => true,
            Self::Transport(TransportError::ConnectionClosed) => true,
            Self::Transport(TransportError::ConnectionFailed(_)) => true,
            Self::Timeout(_) | Self::Unavailable(_) | Self::Overloaded => true,
            _ => false,
        }
    }

    /// Errors of individual attempts carried by an aggregate error.
    ///
    /// Empty for every non-aggregate variant.
    #[must_use]
    pub fn inner_errors(&self) -> &[ConduitError] {
        match self {
            Self::RetriesExhausted { inner, .. } | Self::RetryDeadlineExceeded { inner, .. } => {
                inner
            }
            _ => &[],
        }
    }
}
