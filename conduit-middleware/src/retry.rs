//! Retrying channel with backoff and a per-request deadline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;

use conduit_core::{
    Channel, ConduitError, RequestControl, Response, ResponseHandler, SendOptions, SharedChannel,
    SharedControl, SharedHandler, SharedRequest,
};

/// Predicate deciding whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&ConduitError) -> bool + Send + Sync>;

/// Delay policy between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),

    /// Delay growing by `multiplier` per retry, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Maximum delay between retries.
        max: Duration,
        /// Multiplier applied per retry.
        multiplier: f64,
        /// Add up to 25% random jitter.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed(Duration::from_millis(100))
    }
}

impl Backoff {
    /// Exponential backoff starting at `initial`, doubling up to `max`.
    #[must_use]
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial,
            max,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Calculate the delay before retry number `retry` (zero-based).
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed(interval) => interval,
            Self::Exponential {
                initial,
                max,
                multiplier,
                jitter,
            } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let base_delay = initial.as_secs_f64() * multiplier.powi(exponent);
                let delay = Duration::from_secs_f64(base_delay.min(max.as_secs_f64()));

                if jitter {
                    let jitter_factor = 1.0 + (rand_simple() * 0.25);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor)
                } else {
                    delay
                }
            }
        }
    }
}

/// Cheap pseudo-random value in `[0, 1)` for jitter. Not cryptographically secure.
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / f64::from(u32::MAX)
}

/// Configuration for retry behavior.
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,

    /// Delay policy between attempts.
    pub backoff: Backoff,

    /// Total time budget across all attempts. When unset the effective send
    /// timeout doubles as the budget.
    pub retry_timeout: Option<Duration>,

    retriable: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            retry_timeout: None,
            retriable: Arc::new(ConduitError::is_retriable),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retry_timeout", &self.retry_timeout)
            .finish_non_exhaustive()
    }
}

impl RetryConfig {
    /// Create a new retry configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum attempts.
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Use a fixed delay between attempts.
    #[must_use]
    pub fn backoff_interval(mut self, interval: Duration) -> Self {
        self.backoff = Backoff::Fixed(interval);
        self
    }

    /// Set the total time budget across attempts.
    #[must_use]
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    /// Replace the retriability predicate.
    #[must_use]
    pub fn retriable(
        mut self,
        predicate: impl Fn(&ConduitError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retriable = Arc::new(predicate);
        self
    }

    /// Check if an error may be retried under this configuration.
    #[must_use]
    pub fn is_retriable(&self, error: &ConduitError) -> bool {
        (self.retriable)(error)
    }
}

/// Channel that re-sends requests failing with retriable errors.
///
/// The caller's handler sees at most one acknowledgement and exactly one
/// terminal callback no matter how many attempts are made underneath.
/// Non-retriable errors are forwarded unchanged; when retriable failures
/// exhaust the attempt budget or the deadline, a single aggregate error
/// carrying every attempt's error is delivered.
///
/// ## Example
///
/// ```rust
/// use conduit_core::{Response, SharedRequest};
/// use conduit_middleware::{RetryConfig, RetryingChannel};
/// use conduit_transport::{LocalChannel, service_fn};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let base = LocalChannel::new(service_fn(|_request: SharedRequest| async {
///     Ok(Response::default())
/// }));
/// let channel = RetryingChannel::new(
///     Arc::new(base),
///     RetryConfig::new()
///         .max_attempts(5)
///         .backoff_interval(Duration::from_millis(10)),
/// );
/// assert_eq!(channel.config().max_attempts, 5);
/// ```
pub struct RetryingChannel {
    inner: SharedChannel,
    config: Arc<RetryConfig>,
    runtime: Option<Handle>,
}

impl RetryingChannel {
    /// Wrap `inner` with the given retry configuration.
    #[must_use]
    pub fn new(inner: SharedChannel, config: RetryConfig) -> Self {
        Self {
            inner,
            config: Arc::new(config),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Get the retry configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Channel for RetryingChannel {
    fn endpoint_description(&self) -> String {
        self.inner.endpoint_description()
    }

    fn send(
        &self,
        request: SharedRequest,
        handler: SharedHandler,
        options: SendOptions,
    ) -> SharedControl {
        let send_timeout = options.effective_timeout(&request);
        let deadline = self
            .config
            .retry_timeout
            .or(send_timeout)
            .and_then(|budget| Instant::now().checked_add(budget));

        let retrying = Arc::new(RetryingRequest {
            channel: self.inner.clone(),
            config: self.config.clone(),
            request,
            handler,
            options,
            send_timeout,
            runtime: Handle::try_current().ok().or_else(|| self.runtime.clone()),
            state: Mutex::new(RetryState {
                attempt: 1,
                inner_errors: Vec::new(),
                deadline,
                phase: Phase::Sent,
                current: None,
            }),
        });

        retrying.send_attempt();
        retrying
    }

    fn terminate(&self, error: ConduitError) -> BoxFuture<'static, ()> {
        self.inner.terminate(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sent,
    Acked,
    Done,
}

struct RetryState {
    /// One-based number of the attempt currently owning the request.
    attempt: u32,
    inner_errors: Vec<ConduitError>,
    deadline: Option<Instant>,
    phase: Phase,
    current: Option<SharedControl>,
}

impl RetryState {
    fn finish(&mut self) {
        self.phase = Phase::Done;
        self.current = None;
    }
}

/// One logical request and all of its physical attempts.
struct RetryingRequest {
    channel: SharedChannel,
    config: Arc<RetryConfig>,
    request: SharedRequest,
    handler: SharedHandler,
    options: SendOptions,
    send_timeout: Option<Duration>,
    runtime: Option<Handle>,
    state: Mutex<RetryState>,
}

impl RetryingRequest {
    fn send_attempt(self: &Arc<Self>) {
        let (attempt, timeout) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Done {
                return;
            }

            let deadline = state.deadline;
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        let error = ConduitError::RetryDeadlineExceeded {
                            attempts: state.attempt - 1,
                            inner: std::mem::take(&mut state.inner_errors),
                        };
                        state.finish();
                        drop(state);
                        self.fail(error);
                        return;
                    }
                    Some(self.send_timeout.map_or(remaining, |t| t.min(remaining)))
                }
                None => self.send_timeout,
            };
            (state.attempt, timeout)
        };

        tracing::trace!(
            request_id = self.request.request_id,
            attempt,
            timeout = ?timeout,
            "Sending attempt"
        );

        let options = SendOptions {
            timeout,
            ..self.options.clone()
        };
        let handler = Arc::new(AttemptHandler {
            owner: self.clone(),
            attempt,
        });
        let control = self.channel.send(self.request.clone(), handler, options);

        let cancel_now = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Done => true,
                _ if state.attempt == attempt => {
                    state.current = Some(control.clone());
                    false
                }
                // Superseded by a synchronous failure: nothing to track.
                _ => false,
            }
        };
        if cancel_now {
            control.cancel();
        }
    }

    fn schedule_retry(self: &Arc<Self>, backoff: Duration) {
        if backoff.is_zero() {
            self.send_attempt();
            return;
        }

        match &self.runtime {
            Some(runtime) => {
                let this = self.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(backoff).await;
                    this.send_attempt();
                });
            }
            None => {
                tracing::warn!(
                    request_id = self.request.request_id,
                    "No async runtime to schedule retry, giving up"
                );
                let error = {
                    let mut state = self.state.lock();
                    if state.phase == Phase::Done {
                        return;
                    }
                    let error = ConduitError::RetriesExhausted {
                        attempts: state.attempt - 1,
                        inner: std::mem::take(&mut state.inner_errors),
                    };
                    state.finish();
                    error
                };
                self.fail(error);
            }
        }
    }

    fn fail(&self, error: ConduitError) {
        tracing::warn!(
            request_id = self.request.request_id,
            service = %self.request.service,
            method = %self.request.method,
            error = %error,
            "Request failed after retries"
        );
        self.handler.on_error(error);
    }

    fn on_attempt_acknowledged(&self, attempt: u32) {
        {
            let mut state = self.state.lock();
            if state.attempt != attempt || state.phase != Phase::Sent {
                return;
            }
            state.phase = Phase::Acked;
        }
        if self.options.request_ack {
            self.handler.on_acknowledgement();
        }
    }

    fn on_attempt_response(&self, attempt: u32, response: Response) {
        {
            let mut state = self.state.lock();
            if state.attempt != attempt || state.phase == Phase::Done {
                return;
            }
            state.finish();
        }
        self.handler.on_response(response);
    }

    fn on_attempt_error(self: &Arc<Self>, attempt: u32, error: ConduitError) {
        enum Next {
            Forward(ConduitError),
            Fail(ConduitError),
            Retry(Duration),
        }

        let next = {
            let mut state = self.state.lock();
            if state.attempt != attempt || state.phase == Phase::Done {
                return;
            }

            if !self.config.is_retriable(&error) {
                state.finish();
                Next::Forward(error)
            } else if attempt >= self.config.max_attempts {
                state.inner_errors.push(error);
                let inner = std::mem::take(&mut state.inner_errors);
                state.finish();
                Next::Fail(ConduitError::RetriesExhausted {
                    attempts: attempt,
                    inner,
                })
            } else {
                let backoff = self.config.backoff.delay_for_attempt(attempt - 1);
                let out_of_time = state.deadline.is_some_and(|deadline| {
                    Instant::now()
                        .checked_add(backoff)
                        .is_none_or(|resume| resume >= deadline)
                });

                state.inner_errors.push(error);
                if out_of_time {
                    let inner = std::mem::take(&mut state.inner_errors);
                    state.finish();
                    Next::Fail(ConduitError::RetryDeadlineExceeded {
                        attempts: attempt,
                        inner,
                    })
                } else {
                    state.attempt += 1;
                    state.current = None;
                    Next::Retry(backoff)
                }
            }
        };

        match next {
            Next::Forward(error) => self.handler.on_error(error),
            Next::Fail(error) => self.fail(error),
            Next::Retry(backoff) => {
                tracing::debug!(
                    request_id = self.request.request_id,
                    service = %self.request.service,
                    method = %self.request.method,
                    attempt,
                    backoff = ?backoff,
                    "Attempt failed, retrying"
                );
                self.schedule_retry(backoff);
            }
        }
    }
}

impl RequestControl for RetryingRequest {
    fn cancel(&self) {
        let current = {
            let mut state = self.state.lock();
            if state.phase == Phase::Done {
                return;
            }
            let current = state.current.take();
            state.finish();
            current
        };

        if let Some(control) = current {
            control.cancel();
        }
        self.handler.on_error(ConduitError::Cancelled);
    }

    /// Re-times the attempt in flight only. The retry deadline fixed when the
    /// request entered the channel is left as is, and later attempts keep
    /// deriving their timeout from it.
    fn set_timeout(&self, timeout: Duration) {
        let current = {
            let state = self.state.lock();
            if state.phase == Phase::Done {
                return;
            }
            state.current.clone()
        };

        if let Some(control) = current {
            control.set_timeout(timeout);
        }
    }
}

/// Handler bound to a single physical attempt.
struct AttemptHandler {
    owner: Arc<RetryingRequest>,
    attempt: u32,
}

impl ResponseHandler for AttemptHandler {
    fn on_acknowledgement(&self) {
        self.owner.on_attempt_acknowledged(self.attempt);
    }

    fn on_response(&self, response: Response) {
        self.owner.on_attempt_response(self.attempt, response);
    }

    fn on_error(&self, error: ConduitError) {
        self.owner.on_attempt_error(self.attempt, error);
    }
}
