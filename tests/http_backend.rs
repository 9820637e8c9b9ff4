//! reqwest endpoints against a local axum backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use guardsync::config::{FieldGroupConfig, GuardsyncConfig, StreamConfig, WriteMethod};
use guardsync::source::http::{build_client, HttpFetcher, HttpWriteEndpoint, REQUEST_ID_HEADER};
use guardsync::source::Fetcher;
use guardsync::writes::{WriteEvent, WriteOptions};
use guardsync::{FieldGroup, Session, SyncError, WriteCoordinator};

#[derive(Default)]
struct Backend {
    settings: Mutex<Value>,
    writes: Mutex<Vec<(Option<String>, Value)>>,
    feed_reads: Mutex<usize>,
}

type Shared = Arc<Backend>;

async fn live_feed(
    State(backend): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer letmein");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing token".to_string()).into_response();
    }
    *backend.feed_reads.lock().unwrap() += 1;

    let limit = query
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(50);
    let events: Vec<Value> = (1..=5)
        .map(|id| json!({"id": format!("evt-{id}"), "severity": "high"}))
        .take(limit)
        .collect();
    Json(json!({
        "success": true,
        "total_events": events.len(),
        "events": events,
    }))
    .into_response()
}

async fn settings_status(State(backend): State<Shared>) -> Json<Value> {
    let settings = backend.settings.lock().unwrap().clone();
    Json(json!({"success": true, "data": settings}))
}

async fn settings_write(
    State(backend): State<Shared>,
    headers: HeaderMap,
    Json(update): Json<Value>,
) -> Json<Value> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    backend.writes.lock().unwrap().push((request_id, update.clone()));

    let mut settings = backend.settings.lock().unwrap();
    if let (Value::Object(current), Value::Object(update)) = (&mut *settings, update) {
        current.extend(update);
    }
    Json(json!({"success": true, "data": settings.clone()}))
}

async fn exclusions_write() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "database is locked")
}

async fn spawn_backend() -> (String, Shared) {
    let backend = Arc::new(Backend {
        settings: Mutex::new(json!({"threat_threshold": 80, "auto_quarantine": false})),
        ..Backend::default()
    });
    let app = Router::new()
        .route("/api/ai/live-feed", get(live_feed))
        .route("/api/protection/status", get(settings_status))
        .route("/api/protection/settings", axum::routing::post(settings_write))
        .route("/api/exclusions", axum::routing::put(exclusions_write))
        .route("/garbage", get(|| async { "<html>not json</html>" }))
        .route("/forbidden", get(|| async { (StatusCode::FORBIDDEN, "nope") }))
        .route(
            "/disabled",
            get(|| async { Json(json!({"success": false, "error": "engine offline"})) }),
        )
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), backend)
}

fn config(base_url: &str) -> GuardsyncConfig {
    let mut config = GuardsyncConfig::default();
    config.backend.base_url = base_url.to_string();
    config.backend.token = Some("letmein".to_string());
    config.poller.interval_ms = 3_600_000;
    config.writes.debounce_ms = 50;
    config.streams = vec![StreamConfig {
        name: "live-feed".into(),
        path: "/api/ai/live-feed".into(),
        identity: vec!["id".into()],
        limit: Some(3),
        items_pointer: None,
        searchable: vec![],
        topics: vec![],
    }];
    config.field_groups = vec![
        FieldGroupConfig {
            name: "protection".into(),
            write_path: "/api/protection/settings".into(),
            write_method: WriteMethod::Post,
            read_path: Some("/api/protection/status".into()),
            value_pointer: None,
        },
        FieldGroupConfig {
            name: "exclusions".into(),
            write_path: "/api/exclusions".into(),
            write_method: WriteMethod::Put,
            read_path: None,
            value_pointer: None,
        },
    ];
    config
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn writes_for(config: &GuardsyncConfig) -> WriteCoordinator {
    let client = build_client(&config.backend).unwrap();
    let endpoint = HttpWriteEndpoint::from_config(client, &config.backend, &config.field_groups);
    WriteCoordinator::new(
        Arc::new(endpoint),
        WriteOptions {
            debounce: Duration::from_millis(50),
            follow_up_read: true,
        },
    )
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_unwraps_envelope_with_limit_and_token() {
    let (base, _) = spawn_backend().await;
    let config = config(&base);
    let client = build_client(&config.backend).unwrap();
    let fetcher = HttpFetcher::for_stream(client, &config.backend, &config.streams[0]);

    let items = fetcher.fetch().await.unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["id"], "evt-1");
}

#[tokio::test]
async fn fetch_without_token_is_rejected() {
    let (base, _) = spawn_backend().await;
    let client = reqwest::Client::new();
    let fetcher = HttpFetcher::new(client, format!("{base}/api/ai/live-feed"));

    let err = fetcher.fetch().await.unwrap_err();
    assert!(matches!(err, SyncError::ServerRejected { status: Some(401), .. }));
}

#[tokio::test]
async fn fetch_classifies_failures() {
    let (base, _) = spawn_backend().await;
    let client = reqwest::Client::new();

    let garbage = HttpFetcher::new(client.clone(), format!("{base}/garbage"));
    assert!(matches!(
        garbage.fetch().await.unwrap_err(),
        SyncError::MalformedResponse(_)
    ));

    let forbidden = HttpFetcher::new(client.clone(), format!("{base}/forbidden"));
    assert_eq!(
        forbidden.fetch().await.unwrap_err(),
        SyncError::ServerRejected {
            status: Some(403),
            message: "nope".into()
        }
    );

    let disabled = HttpFetcher::new(client.clone(), format!("{base}/disabled"));
    assert_eq!(
        disabled.fetch().await.unwrap_err(),
        SyncError::ServerRejected {
            status: None,
            message: "engine offline".into()
        }
    );
}

#[tokio::test]
async fn fetch_from_closed_port_is_network_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = HttpFetcher::new(reqwest::Client::new(), format!("http://{addr}/api"));
    assert!(matches!(
        fetcher.fetch().await.unwrap_err(),
        SyncError::NetworkFailure(_)
    ));
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn debounced_write_carries_correlation_id() {
    let (base, backend) = spawn_backend().await;
    let config = config(&base);
    let writes = writes_for(&config);
    let group = FieldGroup::from("protection");
    let mut events = writes.subscribe();

    writes.load(&group).await.unwrap();
    writes.edit(&group, json!({"threat_threshold": 95})).await;
    let write_id = writes.edit(&group, json!({"threat_threshold": 90})).await;

    let confirmed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(WriteEvent::Confirmed { write_id: id, value, .. }) = events.recv().await {
                if id == write_id {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(confirmed["threat_threshold"], 90);
    assert_eq!(confirmed["auto_quarantine"], false);

    let sent = backend.writes.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.as_deref(), Some(write_id.to_string().as_str()));
    assert_eq!(sent[0].1, json!({"threat_threshold": 90}));
}

#[tokio::test]
async fn rejected_write_raises_notice() {
    let (base, _) = spawn_backend().await;
    let config = config(&base);
    let writes = writes_for(&config);
    let group = FieldGroup::from("exclusions");

    writes.edit(&group, json!({"paths": ["C:/Temp"]})).await;
    let mut notices = Vec::new();
    for _ in 0..300 {
        notices = writes.notices().await;
        if !notices.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.contains("500"));
    assert!(notices[0].message.contains("database is locked"));
    assert_eq!(writes.displayed(&group).await, None);
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_refreshes_feed_after_write() {
    let (base, backend) = spawn_backend().await;
    let config = config(&base);
    let session = Session::start(&config, &[]).unwrap();
    let feed = session.feed("live-feed").unwrap();

    assert!(wait_for(|| feed.state().snapshot.is_some()).await);
    let snapshot = feed.state().snapshot.unwrap();
    assert!(snapshot.success);
    assert_eq!(snapshot.len(), 3);

    session
        .writes()
        .edit(&FieldGroup::from("protection"), json!({"auto_quarantine": true}))
        .await;
    assert!(wait_for(|| *backend.feed_reads.lock().unwrap() >= 2).await);
    assert_eq!(backend.settings.lock().unwrap()["auto_quarantine"], true);

    session.shutdown().await;
}

#[tokio::test]
async fn session_rejects_unknown_stream() {
    let config = config("http://127.0.0.1:9");
    let err = Session::start(&config, &["nope".to_string()]).err().unwrap();
    assert!(err.to_string().contains("unknown stream"));
}
