//! Decorator stacks composed the way clients wire them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use conduit::prelude::*;
use conduit::{
    ErrorKind, LocalChannel, RetryConfig, RetryingChannel, RoamingChannel, ScopedChannel,
    SharedChannel, SharedRequest, StaticProvider, provider_fn, service_fn,
};

/// Handler recording every callback it receives.
#[derive(Default)]
struct Recorder {
    acks: AtomicUsize,
    outcomes: Mutex<Vec<Result<Response, ConduitError>>>,
    done: Notify,
}

impl Recorder {
    fn outcome_count(&self) -> usize {
        self.outcomes.lock().len()
    }

    async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            if self.outcome_count() > 0 {
                return;
            }
            notified.await;
        }
    }
}

impl ResponseHandler for Recorder {
    fn on_acknowledgement(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    fn on_response(&self, response: Response) {
        self.outcomes.lock().push(Ok(response));
        self.done.notify_waiters();
    }

    fn on_error(&self, error: ConduitError) {
        self.outcomes.lock().push(Err(error));
        self.done.notify_waiters();
    }
}

/// Service failing with `Unavailable` for its first `failures` calls.
fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> SharedChannel {
    Arc::new(LocalChannel::new(service_fn(move |request: SharedRequest| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if call < failures {
                Err(ConduitError::unavailable("warming up"))
            } else {
                Ok(Response::new(request.body.clone()))
            }
        }
    })))
}

fn retry_config() -> RetryConfig {
    RetryConfig::new()
        .max_attempts(4)
        .backoff_interval(Duration::from_millis(1))
}

#[tokio::test]
async fn test_full_stack_recovers_from_transient_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = StaticProvider::new();
    provider.add_channel("users", flaky(2, calls.clone()));

    let roaming = Arc::new(RoamingChannel::new(provider));
    let retrying = Arc::new(RetryingChannel::new(roaming.clone(), retry_config()));
    let scoped = ScopedChannel::new(retrying);

    let recorder = Arc::new(Recorder::default());
    let _control = scoped.send(
        Request::new("users", "Get").with_body("alice").shared(),
        recorder.clone(),
        SendOptions::new(),
    );
    recorder.wait().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcomes = recorder.outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        Ok(response) => assert_eq!(&response.body[..], b"alice"),
        Err(error) => panic!("unexpected error: {error}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(roaming.stats().discoveries, 1);
    assert_eq!(scoped.outstanding(), 0);
}

#[tokio::test]
async fn test_full_stack_exhausts_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = StaticProvider::new();
    provider.add_channel("users", flaky(usize::MAX, calls.clone()));

    let roaming = Arc::new(RoamingChannel::new(provider));
    let channel = ScopedChannel::new(Arc::new(RetryingChannel::new(roaming, retry_config())));

    let error = channel
        .call(Request::new("users", "Get").shared(), SendOptions::new())
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::RetriesExhausted);
    assert_eq!(error.inner_errors().len(), 4);
    assert!(
        error
            .inner_errors()
            .iter()
            .all(|inner| inner.kind() == ErrorKind::Unavailable)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unknown_service_is_not_retried() {
    let provider = StaticProvider::new();
    let roaming = Arc::new(RoamingChannel::new(provider));
    let channel = RetryingChannel::new(roaming.clone(), retry_config());

    let error = channel
        .call(Request::new("missing", "Get").shared(), SendOptions::new())
        .await
        .unwrap_err();

    match error {
        ConduitError::NoRoute { service, .. } => assert_eq!(service, "missing"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(roaming.stats().discoveries, 1);
}

#[tokio::test]
async fn test_cancel_during_discovery_delivers_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let target = flaky(0, calls.clone());
    let gate = Arc::new(Notify::new());
    let provider = {
        let gate = gate.clone();
        provider_fn(move |_service: String| {
            let gate = gate.clone();
            let target = target.clone();
            async move {
                gate.notified().await;
                Ok(target)
            }
        })
    };

    let roaming = Arc::new(RoamingChannel::new(provider));
    let scoped = ScopedChannel::new(Arc::new(RetryingChannel::new(roaming, retry_config())));

    let recorder = Arc::new(Recorder::default());
    let control = scoped.send(
        Request::new("users", "Get").shared(),
        recorder.clone(),
        SendOptions::new(),
    );
    control.cancel();
    control.cancel();

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcomes = recorder.outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        Err(error) => assert_eq!(error.kind(), ErrorKind::Cancelled),
        Ok(_) => panic!("cancelled request succeeded"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(scoped.outstanding(), 0);
}

#[tokio::test]
async fn test_acknowledged_once_across_layers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = StaticProvider::new();
    provider.add_channel("users", flaky(1, calls.clone()));

    let roaming = Arc::new(RoamingChannel::new(provider));
    let scoped = ScopedChannel::new(Arc::new(RetryingChannel::new(roaming, retry_config())));

    let recorder = Arc::new(Recorder::default());
    let _control = scoped.send(
        Request::new("users", "Get").shared(),
        recorder.clone(),
        SendOptions::new().request_ack(true),
    );
    recorder.wait().await;

    assert_eq!(recorder.acks.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.outcome_count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_scoped_shutdown_drains_full_stack() {
    let gate = Arc::new(Notify::new());
    let base = {
        let gate = gate.clone();
        Arc::new(LocalChannel::new(service_fn(move |_request: SharedRequest| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(Response::new("done"))
            }
        })))
    };
    let provider = StaticProvider::new();
    provider.add_channel("users", base.clone());

    let roaming = Arc::new(RoamingChannel::new(provider));
    let scoped = ScopedChannel::new(Arc::new(RetryingChannel::new(
        roaming.clone(),
        retry_config(),
    )));

    let pending = scoped.call(Request::new("users", "Get").shared(), SendOptions::new());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(base.pending_count(), 1);

    let mut shutdown = tokio::spawn(scoped.terminate(ConduitError::unavailable("shutdown")));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!shutdown.is_finished());
    assert!(!roaming.is_terminated());

    gate.notify_one();
    assert_eq!(&pending.await.unwrap().body[..], b"done");
    (&mut shutdown).await.unwrap();

    assert!(roaming.is_terminated());
    assert!(base.is_terminated());

    let late = scoped
        .call(Request::new("users", "Get").shared(), SendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(late.kind(), ErrorKind::ChannelTerminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_complete_exactly_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let base: SharedChannel = Arc::new(LocalChannel::new(service_fn(
        move |request: SharedRequest| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                // Every third call fails once; the retry absorbs it.
                if call % 3 == 0 {
                    Err(ConduitError::Overloaded)
                } else {
                    Ok(Response::new(request.body.clone()))
                }
            }
        },
    )));
    let provider = StaticProvider::new();
    provider.add_channel("users", base);

    let roaming = Arc::new(RoamingChannel::new(provider));
    let channel = Arc::new(ScopedChannel::new(Arc::new(RetryingChannel::new(
        roaming.clone(),
        RetryConfig::new()
            .max_attempts(10)
            .backoff_interval(Duration::ZERO),
    ))));

    let recorders: Vec<Arc<Recorder>> = (0..64).map(|_| Arc::new(Recorder::default())).collect();
    let mut tasks = Vec::new();
    for (index, recorder) in recorders.iter().enumerate() {
        let channel = channel.clone();
        let recorder = recorder.clone();
        tasks.push(tokio::spawn(async move {
            let _control = channel.send(
                Request::new("users", "Get")
                    .with_body(index.to_string())
                    .shared(),
                recorder,
                SendOptions::new(),
            );
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    for recorder in &recorders {
        recorder.wait().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    for (index, recorder) in recorders.iter().enumerate() {
        let outcomes = recorder.outcomes.lock();
        assert_eq!(outcomes.len(), 1, "request {index} completed more than once");
        match &outcomes[0] {
            Ok(response) => assert_eq!(response.body, index.to_string().as_bytes()),
            Err(error) => panic!("request {index} failed: {error}"),
        }
    }
    assert_eq!(roaming.stats().discoveries, 1);
    assert_eq!(channel.outstanding(), 0);
}
