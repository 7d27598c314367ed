//! Pending request bookkeeping for concurrent calls on one channel.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::future::AbortHandle;

use conduit_core::{ConduitError, Response, SharedHandler};

/// A request waiting for its terminal outcome.
struct PendingRequest {
    handler: SharedHandler,
    abort: AbortHandle,
}

/// Multiplexer correlating in-flight requests with their handlers.
///
/// Whoever removes an entry delivers its terminal callback, so a request
/// racing between completion, cancellation, timeout and termination is
/// answered exactly once.
///
/// ## Example
///
/// ```rust
/// use conduit_transport::Multiplexer;
///
/// let mux = Multiplexer::new();
/// assert!(!mux.has_pending());
///
/// // Dispatching to an unknown id is a no-op.
/// assert!(!mux.dispatch(42, Default::default()));
/// ```
pub struct Multiplexer {
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
}

impl Multiplexer {
    /// Create a new multiplexer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new pending request.
    ///
    /// `abort` stops the work serving the request once it is cancelled.
    pub fn register(&self, handler: SharedHandler, abort: AbortHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(id, PendingRequest { handler, abort });
        id
    }

    fn take(&self, id: u64) -> Option<PendingRequest> {
        self.pending.remove(&id).map(|(_, pending)| pending)
    }

    /// Dispatch a response to a pending request.
    ///
    /// Returns `true` if the response was delivered, `false` if no
    /// pending request with that ID was found (e.g., it timed out).
    pub fn dispatch(&self, id: u64, response: Response) -> bool {
        match self.take(id) {
            Some(pending) => {
                pending.handler.on_response(response);
                true
            }
            None => {
                tracing::trace!(id, "No pending request found for response");
                false
            }
        }
    }

    /// Dispatch an error to a pending request.
    pub fn dispatch_error(&self, id: u64, error: ConduitError) -> bool {
        match self.take(id) {
            Some(pending) => {
                pending.handler.on_error(error);
                true
            }
            None => false,
        }
    }

    /// Cancel a pending request.
    pub fn cancel(&self, id: u64) {
        if let Some(pending) = self.take(id) {
            pending.abort.abort();
            pending.handler.on_error(ConduitError::Cancelled);
        }
    }

    /// Fail all pending requests with `error` (e.g., on termination).
    pub fn cancel_all(&self, error: &ConduitError) {
        // Collect keys first to avoid holding shard locks during callbacks
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();

        for id in keys {
            if let Some(pending) = self.take(id) {
                pending.abort.abort();
                pending.handler.on_error(error.clone());
            }
        }
    }

    /// Get the number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if there are any pending requests.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}
