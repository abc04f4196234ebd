//! End-to-end tests against real HTTP backends on loopback

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use timeboard::api::TimePayload;
use timeboard::io::{HttpClient, ReqwestHttpClient};
use timeboard::query::QueryKey;
use timeboard::{App, Config};

async fn golang_handler(State(counter): State<Arc<AtomicU64>>) -> impl IntoResponse {
    let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
    Json(TimePayload {
        api: "golang-api".to_string(),
        current_time: format!("2024-01-01T00:00:{:02}Z", count % 60),
        request_count: count,
    })
}

async fn node_handler() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable")
}

async fn garbled_handler() -> impl IntoResponse {
    "<html>maintenance</html>"
}

/// Start a backend on an ephemeral port and return its base URL
async fn start_backend() -> String {
    let router = Router::new()
        .route("/api/golang/", get(golang_handler))
        .route("/api/node/", get(node_handler))
        .route("/api/garbled/", get(garbled_handler))
        .with_state(Arc::new(AtomicU64::new(0)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{}", addr)
}

fn config_for(base_url: String, endpoints: &[&str]) -> Config {
    let mut config = Config {
        base_url,
        endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        ..Config::default()
    };
    config.query.retry = 0;
    config.dashboard.enabled = false;
    config
}

fn http_client() -> Arc<dyn HttpClient> {
    Arc::new(ReqwestHttpClient::new(Duration::from_secs(2)).unwrap())
}

async fn wait_for_frame(app: &App, predicate: impl Fn(&str) -> bool) -> String {
    let mut revisions = app.cache().watch_revisions();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = app.render();
            if predicate(&frame) {
                return frame;
            }
            revisions.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("frame never matched; last frame:\n{}", app.render()))
}

#[tokio::test]
async fn renders_success_and_server_error_side_by_side() {
    let base_url = start_backend().await;
    let app = App::new(
        &config_for(base_url, &["/api/golang/", "/api/node/"]),
        http_client(),
    )
    .unwrap();

    let frame = wait_for_frame(&app, |f| {
        f.contains("Request Count: 1") && f.contains("An error has occurred")
    })
    .await;

    assert!(frame.contains("API: golang-api"));
    assert!(frame.contains("An error has occurred: Request failed with status code 500"));
    app.shutdown().await;
}

#[tokio::test]
async fn refetch_shows_increased_request_count() {
    let base_url = start_backend().await;
    let mut app = App::new(&config_for(base_url, &["/api/golang/"]), http_client()).unwrap();
    wait_for_frame(&app, |f| f.contains("Request Count: 1")).await;

    app.handle_command(timeboard::AppCommand::Refetch);

    let frame = wait_for_frame(&app, |f| f.contains("Request Count: 2")).await;
    assert!(!frame.contains("Updating..."));
    let entry = app.cache().get(&QueryKey::from("/api/golang/")).unwrap();
    assert_eq!(entry.fetch_count, 2);
    app.shutdown().await;
}

#[tokio::test]
async fn interval_refetch_while_mounted() {
    let base_url = start_backend().await;
    let mut config = config_for(base_url, &["/api/golang/"]);
    config.query.refetch_interval_seconds = 1;
    let app = App::new(&config, http_client()).unwrap();
    let cache = app.cache().clone();

    let (_commands_tx, commands_rx) = tokio::sync::mpsc::channel(1);
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(app.run(cancel.clone(), commands_rx, std::io::sink()));

    let mut revisions = cache.watch_revisions();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let count = cache
                .get(&QueryKey::from("/api/golang/"))
                .and_then(|entry| entry.data)
                .map(|payload| payload.request_count)
                .unwrap_or(0);
            if count >= 2 {
                return;
            }
            revisions.changed().await.unwrap();
        }
    })
    .await
    .expect("interval never refetched");

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert!(cache.is_shut_down());
}

#[tokio::test]
async fn unparseable_body_is_reported() {
    let base_url = start_backend().await;
    let app = App::new(&config_for(base_url, &["/api/garbled/"]), http_client()).unwrap();

    let frame = wait_for_frame(&app, |f| f.contains("An error has occurred")).await;
    assert!(frame.contains("Invalid response body"), "{frame}");
    app.shutdown().await;
}

#[tokio::test]
async fn unreachable_backend_renders_error() {
    let app = App::new(
        &config_for("http://127.0.0.1:1".to_string(), &["/api/golang/"]),
        http_client(),
    )
    .unwrap();

    let frame = wait_for_frame(&app, |f| f.contains("An error has occurred")).await;
    assert!(!frame.contains("Loading /api/golang/..."));
    app.shutdown().await;
}
