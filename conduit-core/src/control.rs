//! Request control that can be used before the real control exists.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{RequestControl, SharedControl};

/// Operation issued against a thunk before its control was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeferredOp {
    Cancel,
    SetTimeout(Duration),
}

impl DeferredOp {
    fn apply(self, control: &SharedControl) {
        match self {
            Self::Cancel => control.cancel(),
            Self::SetTimeout(timeout) => control.set_timeout(timeout),
        }
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

enum ThunkState {
    /// No control yet. Until `claimed`, a cancel wins outright.
    Pending {
        ops: VecDeque<DeferredOp>,
        claimed: bool,
        on_cancel: Option<CancelHook>,
    },
    /// Control known, deferred ops still being replayed.
    Attaching { ops: VecDeque<DeferredOp> },
    Resolved(SharedControl),
    /// Cancelled before any dispatch began.
    Cancelled,
}

/// A [`RequestControl`] returned before the underlying send has happened.
///
/// `cancel` and `set_timeout` calls made while the thunk is pending are
/// queued and replayed, in order, onto the control passed to
/// [`attach`](Self::attach). The dispatching side must call
/// [`claim`](Self::claim) right before it sends: a cancel that lands earlier
/// suppresses the send entirely, a cancel that lands later is forwarded.
///
/// ## Example
///
/// ```rust
/// use conduit_core::{ControlThunk, NullControl};
///
/// let thunk = ControlThunk::new();
/// assert!(thunk.claim());
/// thunk.attach(NullControl::shared());
/// assert!(thunk.is_resolved());
/// ```
pub struct ControlThunk {
    state: Mutex<ThunkState>,
}

impl ControlThunk {
    /// Create an empty thunk.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Create a thunk running `hook` if it is cancelled before being claimed.
    ///
    /// The hook runs at most once, outside the thunk lock. Dispatchers use it
    /// to deliver the cancellation error to the response handler.
    #[must_use]
    pub fn with_cancel_hook(hook: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Self::build(Some(Box::new(hook)))
    }

    fn build(on_cancel: Option<CancelHook>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ThunkState::Pending {
                ops: VecDeque::new(),
                claimed: false,
                on_cancel,
            }),
        })
    }

    /// Reserve the thunk for a dispatch.
    ///
    /// Returns `false` if the thunk was cancelled first (or already claimed),
    /// in which case the caller must not send.
    pub fn claim(&self) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            ThunkState::Pending {
                claimed, on_cancel, ..
            } if !*claimed => {
                *claimed = true;
                on_cancel.take();
                true
            }
            _ => false,
        }
    }

    /// Attach the real control and replay deferred operations onto it.
    ///
    /// Only the first attach has any effect.
    pub fn attach(&self, control: SharedControl) {
        {
            let mut state = self.state.lock();
            let ThunkState::Pending { ops, .. } = &mut *state else {
                return;
            };
            let ops = std::mem::take(ops);
            *state = ThunkState::Attaching { ops };
        }

        // Replay outside the lock; ops arriving meanwhile join the queue.
        loop {
            let batch = {
                let mut state = self.state.lock();
                match &mut *state {
                    ThunkState::Attaching { ops } if ops.is_empty() => {
                        *state = ThunkState::Resolved(control.clone());
                        return;
                    }
                    ThunkState::Attaching { ops } => std::mem::take(ops),
                    _ => return,
                }
            };
            for op in batch {
                op.apply(&control);
            }
        }
    }

    /// Check whether the real control has been attached.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), ThunkState::Resolved(_))
    }

    /// Check whether the thunk was cancelled before dispatch.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), ThunkState::Cancelled)
    }

    fn submit(&self, op: DeferredOp) {
        let mut hook = None;
        let target = {
            let mut state = self.state.lock();
            match &mut *state {
                ThunkState::Pending {
                    claimed: false,
                    on_cancel,
                    ..
                } if op == DeferredOp::Cancel => {
                    hook = on_cancel.take();
                    *state = ThunkState::Cancelled;
                    None
                }
                ThunkState::Pending { ops, .. } | ThunkState::Attaching { ops } => {
                    ops.push_back(op);
                    None
                }
                ThunkState::Resolved(control) => Some(control.clone()),
                ThunkState::Cancelled => None,
            }
        };

        if let Some(control) = target {
            op.apply(&control);
        }
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl RequestControl for ControlThunk {
    fn cancel(&self) {
        self.submit(DeferredOp::Cancel);
    }

    fn set_timeout(&self, timeout: Duration) {
        self.submit(DeferredOp::SetTimeout(timeout));
    }
}
