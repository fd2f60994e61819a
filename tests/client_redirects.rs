use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use airship_events::client::{Client, ClientError, ACCEPT_VALUE};
use airship_events::events::{fetch_from_start, FetchError, Filter};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

const OPERATION_ID: &str = "c0ffee00-0000-4000-8000-000000000001";

#[derive(Debug)]
struct Seen {
    path: String,
    cookie: Option<String>,
    body: Bytes,
}

#[derive(Default)]
struct MockState {
    hits: AtomicUsize,
    seen: Mutex<Vec<Seen>>,
}

impl MockState {
    fn record(&self, uri: &Uri, headers: &HeaderMap, body: Bytes) -> usize {
        let cookie = headers
            .get(header::COOKIE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        self.seen.lock().expect("seen lock").push(Seen {
            path: uri.path().to_string(),
            cookie,
            body,
        });
        self.hits.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn client_for(addr: SocketAddr) -> Client {
    Client::new("key", SecretString::new("secret".to_string()))
        .expect("build client")
        .with_base_url(format!("http://{addr}"))
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("compress fixture");
    encoder.finish().expect("finish gzip stream")
}

async fn redirect_four_times(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let hit = state.record(&uri, &headers, body);
    if hit <= 4 {
        return (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::SET_COOKIE, "testcookie"), (header::LOCATION, "/foo")],
        )
            .into_response();
    }
    (StatusCode::OK, "done").into_response()
}

async fn redirect_forever(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let hit = state.record(&uri, &headers, body);
    (
        StatusCode::TEMPORARY_REDIRECT,
        [
            (header::SET_COOKIE, format!("cookie-{hit}")),
            (header::LOCATION, "/foo".to_string()),
        ],
    )
        .into_response()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follows_redirects_with_cookie_and_same_body() {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .fallback(redirect_four_times)
        .with_state(Arc::clone(&state));
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let body = json!({"start": "EARLIEST"});
    let response = client_for(addr)
        .post("events", Some(&body))
        .await
        .expect("post through redirects");
    assert_eq!(response.status(), StatusCode::OK);

    let seen = state.seen.lock().expect("seen lock");
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0].path, "/events/");
    assert_eq!(seen[0].cookie, None);
    for hop in &seen[1..] {
        assert_eq!(hop.path, "/foo");
        assert_eq!(hop.cookie.as_deref(), Some("testcookie"));
    }
    let sent: Value = serde_json::from_slice(&seen[0].body).expect("json body");
    assert_eq!(sent, body);
    assert!(seen.iter().all(|hop| hop.body == seen[0].body));
    drop(seen);

    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}

async fn redirect_without_location(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let hit = state.record(&uri, &headers, body);
    let cookie = format!("hop-{hit}");
    match hit {
        1 => (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::SET_COOKIE, cookie), (header::LOCATION, "/foo".to_string())],
        )
            .into_response(),
        2 => (StatusCode::TEMPORARY_REDIRECT, [(header::SET_COOKIE, cookie)]).into_response(),
        3 => (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::SET_COOKIE, cookie), (header::LOCATION, String::new())],
        )
            .into_response(),
        _ => (StatusCode::OK, "done").into_response(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_location_reuses_previous_url() {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .fallback(redirect_without_location)
        .with_state(Arc::clone(&state));
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let response = client_for(addr)
        .post("events", Some(&json!({"start": "LATEST"})))
        .await
        .expect("post through redirects");
    assert_eq!(response.status(), StatusCode::OK);

    let seen = state.seen.lock().expect("seen lock");
    let paths: Vec<&str> = seen.iter().map(|hop| hop.path.as_str()).collect();
    assert_eq!(paths, ["/events/", "/foo", "/foo", "/foo"]);
    let cookies: Vec<Option<&str>> = seen.iter().map(|hop| hop.cookie.as_deref()).collect();
    assert_eq!(
        cookies,
        [None, Some("hop-1"), Some("hop-2"), Some("hop-3")]
    );
    assert!(seen.iter().all(|hop| hop.body == seen[0].body));
    drop(seen);

    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn absolute_location_replaces_url() {
    let target_state = Arc::new(MockState::default());
    let target = Router::new()
        .fallback(
            |State(state): State<Arc<MockState>>, uri: Uri, headers: HeaderMap, body: Bytes| async move {
                state.record(&uri, &headers, body);
                (StatusCode::OK, "moved").into_response()
            },
        )
        .with_state(Arc::clone(&target_state));
    let (target_addr, target_shutdown_tx, target_task) = spawn_server(target).await;

    let origin_state = Arc::new(MockState::default());
    let location = format!("http://{target_addr}/elsewhere/events/");
    let origin = Router::new()
        .fallback(
            move |State(state): State<Arc<MockState>>, uri: Uri, headers: HeaderMap, body: Bytes| {
                let location = location.clone();
                async move {
                    state.record(&uri, &headers, body);
                    (
                        StatusCode::TEMPORARY_REDIRECT,
                        [
                            (header::SET_COOKIE, "moved-cookie".to_string()),
                            (header::LOCATION, location),
                        ],
                    )
                        .into_response()
                }
            },
        )
        .with_state(Arc::clone(&origin_state));
    let (origin_addr, origin_shutdown_tx, origin_task) = spawn_server(origin).await;

    let body = json!({"start": "EARLIEST"});
    let response = client_for(origin_addr)
        .post("events", Some(&body))
        .await
        .expect("post through absolute redirect");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(origin_state.hits.load(Ordering::SeqCst), 1);

    {
        let seen = target_state.seen.lock().expect("seen lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "/elsewhere/events/");
        assert_eq!(seen[0].cookie.as_deref(), Some("moved-cookie"));
        let sent: Value = serde_json::from_slice(&seen[0].body).expect("json body");
        assert_eq!(sent, body);
    }

    let _ = origin_shutdown_tx.send(());
    let _ = origin_task.await;
    let _ = target_shutdown_tx.send(());
    let _ = target_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gives_up_after_ten_redirects() {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .fallback(redirect_forever)
        .with_state(Arc::clone(&state));
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;
    let client = client_for(addr);

    let err = client
        .post::<Value>("events", None)
        .await
        .expect_err("redirect loop must fail");
    assert!(matches!(err, ClientError::TooManyRedirects));
    assert_eq!(state.hits.load(Ordering::SeqCst), 11);
    {
        let seen = state.seen.lock().expect("seen lock");
        assert!(seen.iter().all(|hop| hop.body.is_empty()));
        for (index, hop) in seen.iter().enumerate().skip(1) {
            let expected = format!("cookie-{index}");
            assert_eq!(hop.cookie.as_deref(), Some(expected.as_str()));
        }
    }

    state.hits.store(0, Ordering::SeqCst);
    state.seen.lock().expect("seen lock").clear();
    let err = client
        .post("events", Some(&json!({})))
        .await
        .expect_err("redirect loop must fail with a body too");
    assert!(matches!(err, ClientError::TooManyRedirects));
    assert_eq!(state.hits.load(Ordering::SeqCst), 11);
    assert!(state
        .seen
        .lock()
        .expect("seen lock")
        .iter()
        .all(|hop| hop.body.as_ref() == b"{}"));

    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decodes_gzip_bodies_transparently() {
    const REPEAT: usize = 1_000_000;
    let compressed = Bytes::from(gzip("1234567890".repeat(REPEAT).as_bytes()));

    let app = Router::new().fallback(move |headers: HeaderMap| {
        let compressed = compressed.clone();
        async move {
            let accept_encoding = headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|value| value.to_str().ok());
            if accept_encoding != Some("gzip") {
                return (StatusCode::BAD_REQUEST, "expected Accept-Encoding: gzip").into_response();
            }
            let authorized = headers
                .get(header::AUTHORIZATION)
                .is_some_and(|value| !value.is_empty());
            if !authorized {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            (
                StatusCode::OK,
                [
                    (header::CONTENT_ENCODING, "gzip"),
                    (header::HeaderName::from_static("ua-operation-id"), OPERATION_ID),
                ],
                compressed,
            )
                .into_response()
        }
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let mut response = client_for(addr)
        .post::<Value>("events", None)
        .await
        .expect("post for gzip body");
    assert_eq!(response.status(), StatusCode::OK);

    let mut total = 0;
    while let Some(chunk) = response.chunk().await.expect("read body chunk") {
        total += chunk.len();
    }
    assert_eq!(total, 10 * REPEAT);

    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_maps_error_statuses() {
    let app = Router::new().fallback(|uri: Uri| async move {
        if uri.path().starts_with("/limited") {
            StatusCode::PAYMENT_REQUIRED
        } else {
            StatusCode::NOT_FOUND
        }
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let limited = client_for(addr).with_events_url(format!("http://{addr}/limited/events/"));
    let err = fetch_from_start(&limited, Vec::new())
        .await
        .expect_err("402 must fail");
    assert!(err.is_rate_limited());

    let err = fetch_from_start(&client_for(addr), Vec::new())
        .await
        .expect_err("404 must fail");
    assert!(matches!(err, FetchError::UnexpectedStatus(StatusCode::NOT_FOUND)));
    assert_eq!(err.to_string(), "unexpected non-200 response: 404");

    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_streams_gzipped_events_from_events_url() {
    let fixture = include_bytes!("fixtures/events/all.ndjson");
    let compressed = Bytes::from(gzip(fixture));
    let seen = Arc::new(Mutex::new(None::<(HeaderMap, Value)>));

    let app = Router::new().fallback({
        let seen = Arc::clone(&seen);
        move |uri: Uri, headers: HeaderMap, body: Bytes| {
            let compressed = compressed.clone();
            let seen = Arc::clone(&seen);
            async move {
                if uri.path() != "/custom/events" {
                    return StatusCode::NOT_FOUND.into_response();
                }
                let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                *seen.lock().expect("seen lock") = Some((headers, body));
                (
                    StatusCode::OK,
                    [
                        (header::CONTENT_ENCODING, "gzip"),
                        (header::HeaderName::from_static("ua-operation-id"), OPERATION_ID),
                    ],
                    compressed,
                )
                    .into_response()
            }
        }
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    // Base URL points nowhere; the events URL override must win.
    let client = Client::new("key", SecretString::new("secret".to_string()))
        .expect("build client")
        .with_base_url("http://127.0.0.1:9/api")
        .with_events_url(format!("http://{addr}/custom/events"));
    let response = fetch_from_start(&client, [Filter::default()])
        .await
        .expect("fetch events");
    assert_eq!(response.id(), Some(OPERATION_ID));

    let mut count = 0;
    while let Some(event) = timeout(Duration::from_secs(5), response.recv())
        .await
        .expect("event in time")
    {
        assert!(!event.id.is_empty());
        count += 1;
    }
    let expected = fixture.split(|byte| *byte == b'\n').filter(|line| !line.is_empty()).count();
    assert_eq!(count, expected);
    assert!(response.err().expect("terminal error").is_end_of_stream());

    let (headers, body) = seen.lock().expect("seen lock").take().expect("request seen");
    assert_eq!(
        headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()),
        Some(ACCEPT_VALUE)
    );
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/json")
    );
    assert_eq!(body, json!({"start": "EARLIEST", "filters": [{}]}));

    response.close().await;
    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
