use async_trait::async_trait;
use std::convert::Infallible;
use std::time::Duration;
use tollgate::{
    AdmissionEngine, AllowReason, Bucket, BucketStore, ConnectionEvent, ConnectionLifecycle,
    ConnectionState, Decision, InMemoryBucketStore, LimiterConfig, LogSink, ManualClock, PeerAddr,
    RateLimitLayer, StoreError,
};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use tower_layer::Layer;

fn ready_engine(
    config: LimiterConfig,
) -> (AdmissionEngine<InMemoryBucketStore>, InMemoryBucketStore, ManualClock) {
    let clock = ManualClock::new(1_700_000_000_000);
    let store = InMemoryBucketStore::new(clock.clone());
    let engine = AdmissionEngine::new(
        config,
        store.clone(),
        ConnectionLifecycle::starting_in(ConnectionState::Ready),
    )
    .with_clock(clock.clone());
    (engine, store, clock)
}

#[tokio::test]
async fn denial_arithmetic_for_ten_token_bucket() {
    let (engine, _, clock) = ready_engine(LimiterConfig::new(1.0, 10.0, 10.0, 3600).unwrap());

    assert!(engine.check(Some("203.0.113.9")).await.is_allowed());

    let denial = match engine.check(Some("203.0.113.9")).await {
        Decision::Denied(d) => d,
        other => panic!("expected denial, got {:?}", other),
    };
    assert_eq!(denial.available_tokens, 0.0);
    assert_eq!(denial.required_tokens, 10.0);
    assert_eq!(denial.retry_after_secs, 10);

    clock.advance(10_000);
    assert!(engine.check(Some("203.0.113.9")).await.is_allowed());
}

#[tokio::test]
async fn denial_reports_two_decimal_tokens() {
    let (engine, _, clock) = ready_engine(LimiterConfig::new(1.0, 10.0, 10.0, 3600).unwrap());
    engine.check(Some("a")).await;
    clock.advance(3_337);

    let denial = engine.check(Some("a")).await.denial().cloned().expect("denied");
    assert_eq!(denial.available_tokens, 3.34);
    assert_eq!(denial.retry_after_secs, 7);
}

#[tokio::test]
async fn identities_do_not_share_buckets() {
    let (engine, _, _) = ready_engine(LimiterConfig::new(1.0, 5.0, 5.0, 60).unwrap());
    assert!(engine.check(Some("a")).await.is_allowed());
    assert!(!engine.check(Some("a")).await.is_allowed());
    assert!(engine.check(Some("b")).await.is_allowed());
}

#[tokio::test]
async fn tokens_never_exceed_ceiling() {
    let (engine, _, clock) = ready_engine(LimiterConfig::new(5.0, 10.0, 1.0, 3600).unwrap());
    engine.check(Some("a")).await;
    clock.advance(3_600_000);
    match engine.check(Some("a")).await {
        Decision::Allowed { remaining, .. } => assert_eq!(remaining, Some(9.0)),
        other => panic!("expected admission, got {:?}", other),
    }
}

#[tokio::test]
async fn every_write_refreshes_ttl() {
    let (engine, store, clock) = ready_engine(LimiterConfig::new(1.0, 10.0, 10.0, 120).unwrap());
    let key = engine.config().key_for("a");

    engine.check(Some("a")).await;
    assert_eq!(store.ttl_of(&key), Some(Duration::from_secs(120)));

    clock.advance(3_000);
    assert!(!engine.check(Some("a")).await.is_allowed());
    assert_eq!(store.ttl_of(&key), Some(Duration::from_secs(120)), "deny rewrites the record");

    clock.advance(100_000);
    assert!(engine.check(Some("a")).await.is_allowed());
    assert_eq!(store.ttl_of(&key), Some(Duration::from_secs(120)));
}

#[tokio::test]
async fn expired_record_starts_full() {
    let (engine, store, clock) = ready_engine(LimiterConfig::new(0.001, 10.0, 10.0, 60).unwrap());
    engine.check(Some("a")).await;
    clock.advance(61_000);
    assert!(store.is_empty());
    assert!(engine.check(Some("a")).await.is_allowed());
}

#[tokio::test]
async fn outage_admits_every_request() {
    let clock = ManualClock::new(0);
    let store = InMemoryBucketStore::new(clock.clone());
    let lifecycle = ConnectionLifecycle::starting_in(ConnectionState::Ready);
    let engine = AdmissionEngine::new(
        LimiterConfig::new(1.0, 1.0, 1.0, 60).unwrap(),
        store.clone(),
        lifecycle.clone(),
    )
    .with_clock(clock);

    lifecycle.apply(ConnectionEvent::Reconnecting).await.unwrap();
    for _ in 0..20 {
        assert_eq!(
            engine.check(Some("a")).await,
            Decision::Allowed { remaining: None, reason: AllowReason::StoreUnavailable }
        );
    }
    assert!(store.is_empty(), "no store traffic while unavailable");

    lifecycle.apply(ConnectionEvent::Ready).await.unwrap();
    assert!(engine.check(Some("a")).await.is_allowed());
    assert!(!engine.check(Some("a")).await.is_allowed());
}

#[tokio::test]
async fn failing_store_still_admits() {
    let (engine, store, _) = ready_engine(LimiterConfig::new(1.0, 1.0, 1.0, 60).unwrap());
    store.set_failing(Some(StoreError::Unavailable("connection reset".into())));
    for _ in 0..5 {
        assert!(engine.check(Some("a")).await.is_allowed());
    }
}

#[tokio::test]
async fn shutdown_closes_only_a_ready_store() {
    let (engine, store, _) = ready_engine(LimiterConfig::default());
    engine.shutdown().await.unwrap();
    engine.shutdown().await.unwrap();
    assert_eq!(store.close_count(), 1);
    assert_eq!(engine.lifecycle().state(), ConnectionState::Disconnected);
    assert_eq!(
        engine.check(Some("a")).await,
        Decision::Allowed { remaining: None, reason: AllowReason::StoreUnavailable }
    );
}

/// Never answers.
struct HungStore;

#[async_trait]
impl BucketStore for HungStore {
    async fn get(&self, _key: &str) -> Result<Option<Bucket>, StoreError> {
        futures::future::pending().await
    }

    async fn set(&self, _key: &str, _bucket: &Bucket, _ttl_secs: u64) -> Result<(), StoreError> {
        futures::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn hung_store_is_bounded_by_timeout() {
    let config = LimiterConfig::builder()
        .store_timeout(Duration::from_millis(20))
        .build()
        .expect("valid config");
    let engine = AdmissionEngine::new(
        config,
        HungStore,
        ConnectionLifecycle::starting_in(ConnectionState::Ready),
    );

    let started = tokio::time::Instant::now();
    let decision = engine.check(Some("a")).await;
    let elapsed = started.elapsed();

    assert_eq!(decision, Decision::Allowed { remaining: Some(0.0), reason: AllowReason::Metered });
    assert!(elapsed >= Duration::from_millis(40), "read and write each wait out the timeout");
    assert!(elapsed < Duration::from_millis(100), "took {:?}", elapsed);
    assert!(engine.stats("a").await.is_none(), "a hung read yields no stats");
}

/// Reads its snapshot, then yields before returning it.
struct YieldingStore(InMemoryBucketStore);

#[async_trait]
impl BucketStore for YieldingStore {
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let snapshot = self.0.get(key).await;
        tokio::task::yield_now().await;
        snapshot
    }

    async fn set(&self, key: &str, bucket: &Bucket, ttl_secs: u64) -> Result<(), StoreError> {
        self.0.set(key, bucket, ttl_secs).await
    }
}

// The read-modify-write is not atomic; two interleaved checks can both spend
// the same tokens.
#[tokio::test]
async fn concurrent_checks_can_over_admit() {
    let clock = ManualClock::new(0);
    let engine = AdmissionEngine::new(
        LimiterConfig::new(1.0, 10.0, 10.0, 60).unwrap(),
        YieldingStore(InMemoryBucketStore::new(clock.clone())),
        ConnectionLifecycle::starting_in(ConnectionState::Ready),
    )
    .with_clock(clock);

    let (first, second) = tokio::join!(engine.check(Some("a")), engine.check(Some("a")));
    assert!(first.is_allowed());
    assert!(second.is_allowed());
    assert!(!engine.check(Some("a")).await.is_allowed());
}

fn limited_service(
    engine: AdmissionEngine<InMemoryBucketStore>,
) -> impl tower_service::Service<
    http::Request<()>,
    Response = http::Response<String>,
    Error = tollgate::RateLimitError<Infallible>,
> + Clone {
    RateLimitLayer::new(engine).layer(tower::service_fn(|_req: http::Request<()>| async {
        Ok::<_, Infallible>(http::Response::new("ok".to_string()))
    }))
}

#[tokio::test]
async fn middleware_answers_denials_with_429() {
    let (engine, _, _) = ready_engine(LimiterConfig::new(1.0, 10.0, 10.0, 3600).unwrap());
    let svc = limited_service(engine);
    let request = || {
        http::Request::builder()
            .header("x-forwarded-for", "198.51.100.4, 10.0.0.1")
            .body(())
            .unwrap()
    };

    let ok = svc.clone().oneshot(request()).await.unwrap();
    assert_eq!(ok.into_body(), "ok");

    let denial = svc.clone().oneshot(request()).await.unwrap_err().denial().cloned().unwrap();
    let response: http::Response<String> = denial.into_response();
    assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[http::header::RETRY_AFTER], "10");

    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(body["retryAfterSeconds"], 10);
    assert_eq!(body["availableTokens"], 0.0);
    assert_eq!(body["requiredTokens"], 10.0);
    assert!(body["message"].as_str().is_some());
}

#[tokio::test]
async fn middleware_falls_back_to_peer_address() {
    let (engine, store, _) = ready_engine(LimiterConfig::new(1.0, 10.0, 10.0, 3600).unwrap());
    let svc = limited_service(engine);
    let request = || {
        let mut req = http::Request::new(());
        req.extensions_mut().insert(PeerAddr("192.0.2.44:51000".parse().unwrap()));
        req
    };

    assert!(svc.clone().oneshot(request()).await.is_ok());
    assert!(svc.clone().oneshot(request()).await.unwrap_err().is_denied());
    assert!(store.ttl_of("ratelimit:192.0.2.44").is_some());
}

#[tokio::test]
async fn middleware_passes_unidentified_requests() {
    let (engine, store, _) = ready_engine(LimiterConfig::new(1.0, 1.0, 1.0, 60).unwrap());
    let svc = limited_service(engine);
    for _ in 0..10 {
        assert!(svc.clone().oneshot(http::Request::new(())).await.is_ok());
    }
    assert!(store.is_empty());
}

#[derive(Clone)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn log_sink_records_decisions_through_middleware() {
    let logs = CapturedLogs(Arc::new(Mutex::new(Vec::new())));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let clock = ManualClock::new(1_700_000_000_000);
    let engine = AdmissionEngine::new(
        LimiterConfig::new(1.0, 10.0, 10.0, 3600).unwrap(),
        InMemoryBucketStore::new(clock.clone()),
        ConnectionLifecycle::starting_in(ConnectionState::Ready),
    )
    .with_clock(clock)
    .with_sink(LogSink);
    let layer = RateLimitLayer::new(engine);
    let svc = layer.layer(tower::service_fn(
        |_req: http::Request<()>| async { Ok::<_, Infallible>(()) },
    ));
    let request = || {
        http::Request::builder().header("x-forwarded-for", "198.51.100.7").body(()).unwrap()
    };

    assert!(svc.clone().oneshot(request()).await.is_ok());
    assert!(svc.clone().oneshot(request()).await.unwrap_err().is_denied());
    assert!(svc.clone().oneshot(http::Request::new(())).await.is_ok());
    layer.engine().shutdown().await.unwrap();

    let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    let lines: Vec<&str> = text.lines().filter(|l| l.contains("tollgate::events")).collect();
    assert!(lines.iter().any(|l| l.contains("DEBUG") && l.contains("admitted")), "{}", text);
    assert!(lines
        .iter()
        .any(|l| l.contains("INFO") && l.contains("denied") && l.contains("retry_after_secs=10")));
    assert!(lines.iter().any(|l| l.contains("WARN") && l.contains("cause=unidentified")));
    assert!(lines.iter().any(|l| l.contains("WARN") && l.contains("store connection lost")));
}
