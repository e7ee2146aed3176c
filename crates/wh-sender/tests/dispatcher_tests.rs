//! WebhookDispatcher Integration Tests
//!
//! Tests for:
//! - Single successful delivery with a valid signature
//! - Retry counts against failing destinations
//! - 410 Gone and non-retryable responses
//! - Circuit breaker rejection without network I/O
//! - Panicking hooks during a half-open probe
//! - Timeouts and refused connections retried until exhausted
//! - Batch cancellation and shutdown drain
//! - Bounded completion time under a slow destination
//! - Concurrent sends never exceeding the pool size

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use common::*;
use wh_sender::{
    sign, CircuitState, DispatcherConfig, ManualClock, PolicyConfig, PolicyRegistry, SIGNATURE_HEADER,
};

const IDLE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_success_on_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = dispatcher(fast_config(3), registry(5), hooks.clone());
    let dest = destination("d1", format!("{}/hook", server.uri()));
    let item = work_item(&dest).with_id("item-1");

    dispatcher.submit(vec![item]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(hooks.successes.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.retries.load(Ordering::SeqCst), 0);
    assert_eq!(hooks.failures.load(Ordering::SeqCst), 0);
    assert_eq!(
        hooks.events(),
        vec![
            HookEvent::Attempt { id: "item-1".into(), attempt: 0 },
            HookEvent::Success { id: "item-1".into(), status: 200 },
        ]
    );

    let stats = dispatcher.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.retries, 0);
}

#[tokio::test]
async fn test_signature_matches_received_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = dispatcher(fast_config(0), registry(5), hooks.clone());
    let dest = destination("d1", server.uri());

    let mut properties = serde_json::Map::new();
    properties.insert("tenant".into(), serde_json::json!("acme"));
    dispatcher
        .submit(vec![work_item(&dest).with_id("abc").with_properties(properties)])
        .unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert_eq!(signature, sign(SECRET, &request.body).unwrap());

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["id"], "abc");
    assert_eq!(body["attempt"], 1);
    assert_eq!(body["properties"]["tenant"], "acme");
    assert_eq!(body["notifications"][0]["eventType"], "order.created");
}

#[tokio::test]
async fn test_custom_headers_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-tenant", "acme"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = dispatcher(fast_config(0), registry(5), hooks.clone());
    let dest = Arc::new(
        wh_sender::Destination::new("d1", server.uri(), SECRET).with_header("X-Tenant", "acme"),
    );

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);
    assert_eq!(hooks.successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_error_retried_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let registry = registry(10);
    let dispatcher = dispatcher(fast_config(3), registry.clone(), hooks.clone());
    let dest = destination("d1", server.uri());

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(hooks.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(hooks.retries.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.failures.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.failure_kinds(), vec!["delivery_failed"]);
    assert_eq!(hooks.successes.load(Ordering::SeqCst), 0);

    let attempts: Vec<u64> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).unwrap()["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);

    assert_eq!(registry.get("d1").unwrap().consecutive_failures(), 4);
    assert_eq!(dispatcher.stats().failed, 1);
}

#[tokio::test]
async fn test_gone_stops_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let registry = registry(5);
    let dispatcher = dispatcher(fast_config(3), registry.clone(), hooks.clone());
    let dest = destination("d1", server.uri());

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(hooks.gones.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.retries.load(Ordering::SeqCst), 0);
    assert_eq!(hooks.failures.load(Ordering::SeqCst), 0);
    assert_eq!(registry.get("d1").unwrap().consecutive_failures(), 0);
    assert_eq!(dispatcher.stats().gone, 1);
}

#[tokio::test]
async fn test_client_error_is_terminal_and_counted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let registry = registry(5);
    let dispatcher = dispatcher(fast_config(3), registry.clone(), hooks.clone());
    let dest = destination("d1", server.uri());

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(hooks.failure_kinds(), vec!["unexpected_status"]);
    assert_eq!(hooks.retries.load(Ordering::SeqCst), 0);
    assert_eq!(registry.get("d1").unwrap().consecutive_failures(), 1);
}

#[tokio::test]
async fn test_open_circuit_rejects_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let registry = registry(2);
    let dispatcher = dispatcher(fast_config(1), registry.clone(), hooks.clone());
    let dest = destination("d1", server.uri());

    // Two failed attempts trip the circuit
    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);
    assert_eq!(registry.get("d1").unwrap().circuit_state(), CircuitState::Open);

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(hooks.failure_kinds(), vec!["delivery_failed", "circuit_open"]);
    assert_eq!(hooks.attempts.load(Ordering::SeqCst), 2);

    let stats = dispatcher.stats();
    assert_eq!(stats.circuit_rejections, 1);
    assert_eq!(stats.failed, 2);

    let snapshot = registry.get("d1").unwrap().snapshot();
    assert_eq!(snapshot.consecutive_failures, 2);
    assert_eq!(snapshot.rejected_calls, 1);
}

#[tokio::test]
async fn test_hook_errors_do_not_affect_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::failing());
    let dispatcher = dispatcher(fast_config(3), registry(5), hooks.clone());
    let dest = destination("d1", server.uri());

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(hooks.successes.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.stats().delivered, 1);
}

#[tokio::test]
async fn test_panicking_hook_does_not_wedge_half_open_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let clock = ManualClock::new();
    let registry = Arc::new(PolicyRegistry::with_clock(
        PolicyConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
        },
        Arc::new(clock.clone()),
    ));
    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = dispatcher(fast_config(0), registry.clone(), hooks.clone());
    let dest = destination("d1", server.uri());

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);
    assert_eq!(registry.get("d1").unwrap().circuit_state(), CircuitState::Open);

    // The half-open probe runs with a hook that panics
    clock.advance(Duration::from_secs(31));
    hooks.panic_on_attempt.store(true, Ordering::SeqCst);
    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(dispatcher.stats().in_flight, 0);
    assert_eq!(dispatcher.stats().delivered, 1);
    assert_eq!(registry.get("d1").unwrap().circuit_state(), CircuitState::Closed);

    hooks.panic_on_attempt.store(false, Ordering::SeqCst);
    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    let stats = dispatcher.stats();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.circuit_rejections, 0);
}

#[tokio::test]
async fn test_timeout_retried_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let config = DispatcherConfig {
        request_timeout: Duration::from_millis(100),
        ..fast_config(3)
    };
    let registry = registry(10);
    let dispatcher = dispatcher(config, registry.clone(), hooks.clone());
    let dest = destination("d1", server.uri());

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(hooks.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(hooks.retries.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.failure_kinds(), vec!["delivery_failed"]);
    assert_eq!(registry.get("d1").unwrap().consecutive_failures(), 4);
}

#[tokio::test]
async fn test_refused_connection_retried_until_exhausted() {
    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = dispatcher(fast_config(3), registry(10), hooks.clone());
    let dest = destination("d1", "http://127.0.0.1:1/hook".to_string());

    dispatcher.submit(vec![work_item(&dest)]).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);

    assert_eq!(hooks.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(hooks.retries.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.failure_kinds(), vec!["delivery_failed"]);
    assert_eq!(dispatcher.stats().failed, 1);
}

/// Records when each request reaches the server, then answers after `delay`
struct ArrivalRecorder {
    arrivals: Arc<Mutex<Vec<Instant>>>,
    delay: Duration,
}

impl Respond for ArrivalRecorder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.arrivals.lock().push(Instant::now());
        ResponseTemplate::new(200).set_delay(self.delay)
    }
}

#[tokio::test]
async fn test_concurrent_sends_bounded_by_pool_size() {
    let delay = Duration::from_millis(150);
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ArrivalRecorder {
            arrivals: arrivals.clone(),
            delay,
        })
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let config = DispatcherConfig {
        concurrency: 2,
        ..fast_config(0)
    };
    let dispatcher = dispatcher(config, registry(5), hooks.clone());
    let dest = destination("d1", server.uri());

    let items: Vec<_> = (0..8).map(|_| work_item(&dest)).collect();
    dispatcher.submit(items).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);
    assert_eq!(dispatcher.stats().delivered, 8);

    // A new send starts only after an earlier one has held its slot for `delay`
    let arrivals = arrivals.lock().clone();
    assert_eq!(arrivals.len(), 8);
    let window = delay / 2;
    let max_overlap = arrivals
        .iter()
        .map(|at| {
            arrivals
                .iter()
                .filter(|other| *other <= at && at.duration_since(**other) < window)
                .count()
        })
        .max()
        .unwrap_or(0);
    assert!(max_overlap <= 2, "{} sends started together", max_overlap);
}

#[tokio::test]
async fn test_cancelled_batch_is_abandoned_not_counted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let registry = registry(5);
    let config = DispatcherConfig {
        request_timeout: Duration::from_secs(10),
        ..fast_config(3)
    };
    let dispatcher = dispatcher(config, registry.clone(), hooks.clone());
    let dest = destination("d1", server.uri());

    let cancel = CancellationToken::new();
    dispatcher
        .submit_with_cancellation(vec![work_item(&dest)], cancel.clone())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    assert!(dispatcher.wait_idle(IDLE).await);

    let stats = dispatcher.stats();
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(hooks.failures.load(Ordering::SeqCst), 0);

    let policy = registry.get("d1").unwrap();
    assert_eq!(policy.consecutive_failures(), 0);
    assert_eq!(policy.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(3)
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = dispatcher(fast_config(0), registry(5), hooks.clone());
    let dest = destination("d1", server.uri());

    dispatcher
        .submit(vec![work_item(&dest), work_item(&dest), work_item(&dest)])
        .unwrap();
    dispatcher.shutdown().await;

    assert_eq!(dispatcher.stats().delivered, 3);
    assert_eq!(hooks.successes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_timeout_cancels_remaining() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let config = DispatcherConfig {
        request_timeout: Duration::from_secs(30),
        shutdown_timeout: Duration::from_millis(200),
        ..fast_config(0)
    };
    let dispatcher = dispatcher(config, registry(5), hooks.clone());
    let dest = destination("d1", server.uri());

    dispatcher.submit(vec![work_item(&dest)]).unwrap();

    let started = Instant::now();
    dispatcher.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(dispatcher.stats().abandoned, 1);
    assert_eq!(dispatcher.stats().in_flight, 0);
}

#[tokio::test]
async fn test_slow_destination_completes_in_bounded_time() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let hooks = Arc::new(RecordingHooks::default());
    let config = DispatcherConfig {
        concurrency: 8,
        request_timeout: Duration::from_millis(100),
        ..fast_config(0)
    };
    let dispatcher = dispatcher(config, registry(10_000), hooks.clone());
    let dest = destination("slow", server.uri());

    let items: Vec<_> = (0..40).map(|_| work_item(&dest)).collect();

    let started = Instant::now();
    dispatcher.submit(items).unwrap();
    assert!(dispatcher.wait_idle(IDLE).await);
    let elapsed = started.elapsed();

    // 40 sequential timeouts would take 4s; 8 workers need about 5 rounds
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    assert_eq!(hooks.failures.load(Ordering::SeqCst), 40);
    assert!(hooks.failure_kinds().iter().all(|k| *k == "delivery_failed"));
}
