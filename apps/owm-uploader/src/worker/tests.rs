use super::*;
use crate::config::SiteConfig;
use crate::protocol::OpenWeatherMap;
use crate::queue::{ingest_queue, IngestSender};
use crate::record::{Observation, UnitSystem};
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::AtomicU16;

const MEASUREMENTS_PATH: &str = "/data/3.0/measurements";
const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Hit {
    query: Option<String>,
    content_type: Option<String>,
    body: JsonValue,
    at: Instant,
}

#[derive(Clone)]
struct FakeApiState {
    hits: Arc<Mutex<Vec<Hit>>>,
    status: Arc<AtomicU16>,
}

/// Stand-in for the measurements endpoint: records every POST and answers
/// with a configurable status.
struct FakeApi {
    url: Url,
    state: FakeApiState,
    handle: JoinHandle<()>,
}

impl FakeApi {
    async fn start(status: StatusCode) -> Option<Self> {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            // Sandbox environments can block binding attempts.
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return None,
            Err(err) => panic!("failed to bind fake api: {err}"),
        };
        let addr = listener.local_addr().unwrap();
        let state = FakeApiState {
            hits: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(AtomicU16::new(status.as_u16())),
        };
        let app = Router::new()
            .route(MEASUREMENTS_PATH, post(record_hit))
            .with_state(state.clone());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        let url = Url::parse(&format!("http://{addr}{MEASUREMENTS_PATH}")).unwrap();
        Some(Self { url, state, handle })
    }

    fn hits(&self) -> Vec<Hit> {
        self.state.hits.lock().unwrap().clone()
    }

    fn hit_count(&self) -> usize {
        self.state.hits.lock().unwrap().len()
    }
}

impl Drop for FakeApi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn record_hit(
    State(state): State<FakeApiState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // Read the reply first so a test flipping the status after seeing the hit
    // only affects later requests.
    let status = StatusCode::from_u16(state.status.load(Ordering::Relaxed))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let hit = Hit {
        query,
        content_type: headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(&body).unwrap_or(JsonValue::Null),
        at: Instant::now(),
    };
    state.hits.lock().unwrap().push(hit);
    status
}

struct Harness {
    tx: IngestSender<Record>,
    stats: Arc<WorkerStats>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Harness {
    /// Records in `preload` are queued before the worker starts, so they land
    /// in a single drain.
    fn start(server_url: Url, policy: PostPolicy, preload: Vec<Record>) -> Self {
        let (tx, rx) = ingest_queue();
        for record in preload {
            tx.enqueue(record);
        }
        let stats = Arc::new(WorkerStats::new());
        let worker = UploadWorker::new(
            OpenWeatherMap::new(&site(server_url)),
            policy,
            rx,
            stats.clone(),
            tracing::info_span!("upload", protocol = "OWM", station_id = "test-station"),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let handle = worker.spawn(cancel.clone());
        Self {
            tx,
            stats,
            cancel,
            handle,
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        tokio::time::timeout(WAIT_LIMIT, self.handle)
            .await
            .expect("worker stops after cancel")
            .unwrap();
    }
}

fn site(server_url: Url) -> SiteConfig {
    SiteConfig {
        appid: "secret-appid".to_string(),
        station_id: "test-station".to_string(),
        latitude: 52.0,
        longitude: 4.0,
        altitude: 2.0,
        server_url,
        policy: PostPolicy::default(),
    }
}

fn fast_policy() -> PostPolicy {
    PostPolicy {
        timeout: Duration::from_secs(5),
        retry_wait: Duration::from_millis(20),
        ..PostPolicy::default()
    }
}

fn offline_url() -> Url {
    Url::parse("http://127.0.0.1:9/data/3.0/measurements").unwrap()
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn reading(ts: i64, temp: f64) -> Record {
    Record::new(ts, UnitSystem::Metric).with(Observation::OutTemp, temp)
}

fn offline_worker(policy: PostPolicy) -> (UploadWorker<OpenWeatherMap>, Arc<WorkerStats>) {
    worker_for(offline_url(), policy)
}

fn worker_for(server_url: Url, policy: PostPolicy) -> (UploadWorker<OpenWeatherMap>, Arc<WorkerStats>) {
    let (_tx, rx) = ingest_queue();
    let stats = Arc::new(WorkerStats::new());
    let worker = UploadWorker::new(
        OpenWeatherMap::new(&site(server_url)),
        policy,
        rx,
        stats.clone(),
        tracing::Span::none(),
    )
    .unwrap();
    (worker, stats)
}

/// Log output of the current thread, formatted without colours.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
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

fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn trim_backlog_keeps_newest_k() {
    for n in 1..=6usize {
        for k in 0..=7usize {
            let batch: Vec<usize> = (0..n).collect();
            let (kept, dropped) = trim_backlog(batch, k);
            if k == 0 || k >= n {
                assert_eq!(dropped, 0);
                assert_eq!(kept.len(), n);
            } else {
                assert_eq!(dropped, n - k);
                assert_eq!(kept, ((n - k)..n).collect::<Vec<_>>());
            }
        }
    }
}

#[test]
fn newest_is_last_arrival() {
    assert_eq!(select_newest(vec![1, 2, 3]), Some(3));
    assert_eq!(select_newest(Vec::<u8>::new()), None);
}

#[test]
fn stale_check_honours_threshold() {
    let stale = Some(Duration::from_secs(600));
    assert!(check_stale(1_000, 1_600, stale).is_ok());
    let err = check_stale(1_000, 1_601, stale).unwrap_err();
    assert!(matches!(
        err,
        UploadError::StaleData {
            age_secs: 601,
            threshold_secs: 600
        }
    ));
    assert!(check_stale(0, 1_000_000, None).is_ok());
}

#[test]
fn stale_check_saturates_on_extreme_timestamps() {
    let stale = Some(Duration::from_secs(600));
    assert!(matches!(
        check_stale(i64::MIN, 1_000, stale),
        Err(UploadError::StaleData { age_secs: i64::MAX, .. })
    ));
    assert!(check_stale(i64::MAX, i64::MIN, stale).is_ok());
    assert!(check_stale(0, 1_000, Some(Duration::from_secs(u64::MAX))).is_ok());
}

#[test]
fn truncates_error_bodies_on_char_boundary() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("ééé", 3), "é…");
}

#[tokio::test]
async fn skip_upload_builds_without_network() {
    let policy = PostPolicy {
        skip_upload: true,
        ..fast_policy()
    };
    let (mut worker, stats) = offline_worker(policy);
    let cancel = CancellationToken::new();

    let outcome = worker
        .run_cycle(vec![reading(now(), 18.0)], &cancel)
        .await;

    assert_eq!(outcome, CycleOutcome::DryRun);
    let status = stats.snapshot();
    assert_eq!(status.dry_runs, 1);
    assert_eq!(status.attempts, 0);
    assert!(status.last_post_unix.is_some());
}

#[tokio::test]
async fn stale_records_are_skipped_not_posted() {
    let policy = PostPolicy {
        stale: Some(Duration::from_secs(60)),
        ..fast_policy()
    };
    let (mut worker, stats) = offline_worker(policy);
    let cancel = CancellationToken::new();

    let outcome = worker
        .run_cycle(vec![reading(now() - 3600, 18.0)], &cancel)
        .await;

    assert!(matches!(outcome, CycleOutcome::Stale { age_secs } if age_secs >= 3600));
    let status = stats.snapshot();
    assert_eq!(status.skipped_stale, 1);
    assert_eq!(status.attempts, 0);
    assert_eq!(status.last_post_unix, None);
}

#[tokio::test]
async fn backlog_trim_is_counted() {
    let policy = PostPolicy {
        skip_upload: true,
        max_backlog: 2,
        ..fast_policy()
    };
    let (mut worker, stats) = offline_worker(policy);
    let cancel = CancellationToken::new();
    let t = now();
    let batch = (0..5).map(|i| reading(t + i, i as f64)).collect();

    assert_eq!(worker.run_cycle(batch, &cancel).await, CycleOutcome::DryRun);
    let status = stats.snapshot();
    assert_eq!(status.drained, 5);
    assert_eq!(status.dropped_backlog, 3);
}

#[tokio::test]
async fn unlimited_backlog_drops_nothing() {
    let policy = PostPolicy {
        skip_upload: true,
        ..fast_policy()
    };
    let (mut worker, stats) = offline_worker(policy);
    let cancel = CancellationToken::new();
    let t = now();
    let batch = (0..50).map(|i| reading(t + i, 1.0)).collect();

    worker.run_cycle(batch, &cancel).await;
    assert_eq!(stats.snapshot().dropped_backlog, 0);
}

#[tokio::test]
async fn log_flags_gate_post_lines_only() {
    let Some(api) = FakeApi::start(StatusCode::OK).await else {
        return;
    };
    let (logs, _guard) = capture_logs();
    let cancel = CancellationToken::new();
    let quiet = PostPolicy {
        log_success: false,
        log_failure: false,
        max_tries: 1,
        ..fast_policy()
    };

    let (mut worker, _) = worker_for(api.url.clone(), quiet.clone());
    assert_eq!(
        worker.run_cycle(vec![reading(now(), 1.0)], &cancel).await,
        CycleOutcome::Posted { attempts: 1 }
    );
    api.state
        .status
        .store(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), Ordering::Relaxed);
    assert_eq!(
        worker.run_cycle(vec![reading(now(), 2.0)], &cancel).await,
        CycleOutcome::Failed { attempts: 1 }
    );

    let (mut stale_worker, _) = worker_for(
        api.url.clone(),
        PostPolicy {
            stale: Some(Duration::from_secs(60)),
            ..quiet.clone()
        },
    );
    stale_worker
        .run_cycle(vec![reading(now() - 3600, 3.0)], &cancel)
        .await;
    let (mut dry_worker, _) = worker_for(
        api.url.clone(),
        PostPolicy {
            skip_upload: true,
            ..quiet
        },
    );
    dry_worker.run_cycle(vec![reading(now(), 4.0)], &cancel).await;

    let quiet_logs = logs.contents();
    assert!(!quiet_logs.contains("published record"), "{quiet_logs}");
    assert!(!quiet_logs.contains("failed to publish record"), "{quiet_logs}");
    assert!(quiet_logs.contains("skipping stale record"), "{quiet_logs}");
    assert!(quiet_logs.contains("skip_upload set"), "{quiet_logs}");

    let (mut loud_worker, _) = worker_for(
        api.url.clone(),
        PostPolicy {
            max_tries: 1,
            ..fast_policy()
        },
    );
    loud_worker.run_cycle(vec![reading(now(), 5.0)], &cancel).await;
    api.state
        .status
        .store(StatusCode::OK.as_u16(), Ordering::Relaxed);
    loud_worker.run_cycle(vec![reading(now(), 6.0)], &cancel).await;

    let all_logs = logs.contents();
    assert!(all_logs.contains("failed to publish record"), "{all_logs}");
    assert!(all_logs.contains("published record"), "{all_logs}");
}

#[tokio::test]
async fn posts_newest_record_of_drain_window() {
    let Some(api) = FakeApi::start(StatusCode::OK).await else {
        return;
    };
    let t = now();
    let harness = Harness::start(
        api.url.clone(),
        fast_policy(),
        vec![reading(t, 20.0), reading(t + 60, 21.0)],
    );

    wait_until(|| harness.stats.snapshot().posted == 1).await;
    let hits = api.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].query.as_deref(), Some("appid=secret-appid"));
    assert_eq!(hits[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(
        hits[0].body,
        json!([{"station_id": "test-station", "dt": t + 60, "temperature": 21.0}])
    );
    assert_eq!(harness.stats.snapshot().drained, 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn retries_until_max_tries_then_abandons() {
    let Some(api) = FakeApi::start(StatusCode::INTERNAL_SERVER_ERROR).await else {
        return;
    };
    let policy = fast_policy();
    let retry_wait = policy.retry_wait;
    let harness = Harness::start(api.url.clone(), policy, vec![reading(now(), 10.0)]);

    wait_until(|| harness.stats.snapshot().failed == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let hits = api.hits();
    assert_eq!(hits.len(), 3);
    for pair in hits.windows(2) {
        assert!(pair[1].at - pair[0].at >= retry_wait);
    }
    let status = harness.stats.snapshot();
    assert_eq!(status.attempts, 3);
    assert_eq!(status.posted, 0);
    assert!(status.last_error.unwrap().contains("500"));

    // The worker survives and keeps serving new records.
    harness.tx.enqueue(reading(now(), 11.0));
    wait_until(|| harness.stats.snapshot().failed == 2).await;
    assert_eq!(api.hit_count(), 6);

    harness.shutdown().await;
}

#[tokio::test]
async fn transport_errors_are_retried() {
    let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return,
        Err(err) => panic!("bind: {err}"),
    };
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let policy = PostPolicy {
        max_tries: 2,
        ..fast_policy()
    };
    let url = Url::parse(&format!("http://{addr}{MEASUREMENTS_PATH}")).unwrap();
    let harness = Harness::start(url, policy, vec![reading(now(), 10.0)]);

    wait_until(|| harness.stats.snapshot().failed == 1).await;
    let status = harness.stats.snapshot();
    assert_eq!(status.attempts, 2);
    assert!(status.last_error.unwrap().contains("transport"));

    harness.shutdown().await;
}

#[tokio::test]
async fn recovers_after_transient_rejection() {
    let Some(api) = FakeApi::start(StatusCode::SERVICE_UNAVAILABLE).await else {
        return;
    };
    let policy = PostPolicy {
        retry_wait: Duration::from_millis(200),
        ..fast_policy()
    };
    let harness = Harness::start(api.url.clone(), policy, vec![reading(now(), 10.0)]);

    wait_until(|| api.hit_count() == 1).await;
    api.state
        .status
        .store(StatusCode::OK.as_u16(), Ordering::Relaxed);

    wait_until(|| harness.stats.snapshot().posted == 1).await;
    let status = harness.stats.snapshot();
    assert_eq!(status.attempts, 2);
    assert_eq!(status.failed, 0);
    assert_eq!(status.last_error, None);

    harness.shutdown().await;
}

#[tokio::test]
async fn paces_posts_to_interval() {
    let Some(api) = FakeApi::start(StatusCode::OK).await else {
        return;
    };
    let interval = Duration::from_millis(300);
    let policy = PostPolicy {
        post_interval: Some(interval),
        ..fast_policy()
    };
    let harness = Harness::start(api.url.clone(), policy, vec![reading(now(), 1.0)]);

    wait_until(|| api.hit_count() == 1).await;
    harness.tx.enqueue(reading(now(), 2.0));
    wait_until(|| api.hit_count() == 2).await;

    let hits = api.hits();
    // The worker stamps the post just before sending, so allow for request latency.
    assert!(hits[1].at - hits[0].at >= interval - Duration::from_millis(50));
    assert_eq!(hits[1].body[0]["temperature"], json!(2.0));

    harness.shutdown().await;
}

#[tokio::test]
async fn folds_dropped_rain_into_totals() {
    let Some(api) = FakeApi::start(StatusCode::OK).await else {
        return;
    };
    let t = now();
    let batch = [t - 120, t - 60, t]
        .into_iter()
        .map(|ts| Record::new(ts, UnitSystem::Metric).with(Observation::Rain, 0.1))
        .collect();
    let harness = Harness::start(api.url.clone(), fast_policy(), batch);

    wait_until(|| api.hit_count() == 1).await;
    let body = &api.hits()[0].body[0];
    let rain_1h = body["rain_1h"].as_f64().unwrap();
    let rain_24h = body["rain_24h"].as_f64().unwrap();
    assert!((rain_1h - 3.0).abs() < 1e-9, "rain_1h was {rain_1h}");
    assert!((rain_24h - 3.0).abs() < 1e-9, "rain_24h was {rain_24h}");

    harness.shutdown().await;
}

#[tokio::test]
async fn survives_records_with_extreme_timestamps() {
    let policy = PostPolicy {
        skip_upload: true,
        ..fast_policy()
    };
    let extreme = |ts| {
        Record::new(ts, UnitSystem::Metric)
            .with(Observation::OutTemp, 1.0)
            .with(Observation::Rain, 0.1)
    };
    let harness = Harness::start(offline_url(), policy, vec![extreme(i64::MIN)]);
    wait_until(|| harness.stats.snapshot().dry_runs == 1).await;

    harness.tx.enqueue(extreme(i64::MAX));
    wait_until(|| harness.stats.snapshot().dry_runs == 2).await;
    harness.tx.enqueue(reading(now(), 12.0));
    wait_until(|| harness.stats.snapshot().dry_runs == 3).await;
    assert!(!harness.handle.is_finished());

    harness.shutdown().await;
}

#[tokio::test]
async fn stops_when_cancelled_while_idle() {
    let harness = Harness::start(offline_url(), fast_policy(), Vec::new());
    harness.shutdown().await;
}

#[tokio::test]
async fn cancel_abandons_pacing_wait() {
    let Some(api) = FakeApi::start(StatusCode::OK).await else {
        return;
    };
    let policy = PostPolicy {
        post_interval: Some(Duration::from_secs(3600)),
        ..fast_policy()
    };
    let harness = Harness::start(api.url.clone(), policy, vec![reading(now(), 1.0)]);

    wait_until(|| api.hit_count() == 1).await;
    harness.tx.enqueue(reading(now(), 2.0));
    wait_until(|| harness.stats.snapshot().drained == 2).await;

    harness.shutdown().await;
    assert_eq!(api.hit_count(), 1);
}

#[tokio::test]
async fn stops_when_producers_are_gone() {
    let harness = Harness::start(offline_url(), fast_policy(), Vec::new());
    let Harness { tx, handle, .. } = harness;
    drop(tx);
    tokio::time::timeout(WAIT_LIMIT, handle)
        .await
        .expect("worker stops once the queue closes")
        .unwrap();
}
