//! Web dashboard serving the latest frame and the query cache snapshot

use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;

use crate::api::TimePayload;
use crate::query::QueryCache;

/// Seconds between browser reloads of the index page
const RELOAD_SECONDS: u32 = 5;

/// Dashboard application state
#[derive(Clone)]
pub struct DashboardState {
    pub frames: watch::Receiver<String>,
    pub cache: QueryCache<TimePayload>,
}

/// Build the dashboard axum router
pub fn build_router(frames: watch::Receiver<String>, cache: QueryCache<TimePayload>) -> Router {
    let dashboard_state = DashboardState { frames, cache };

    Router::new()
        .route("/", get(index_handler))
        .route("/api/queries", get(queries_handler))
        .route("/health", get(health_handler))
        .with_state(dashboard_state)
}

async fn index_handler(State(dashboard): State<DashboardState>) -> impl IntoResponse {
    let frame = dashboard.frames.borrow().clone();

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <meta http-equiv="refresh" content="{reload}">
    <title>Timeboard</title>
</head>
<body style="font-family: system-ui, sans-serif; max-width: 960px; margin: 0 auto; padding: 1rem;">
    <pre style="font-size: 1.1em;">{frame}</pre>
</body>
</html>"#,
        reload = RELOAD_SECONDS,
        frame = escape_html(&frame),
    );

    Html(html)
}

async fn queries_handler(State(dashboard): State<DashboardState>) -> impl IntoResponse {
    axum::Json(dashboard.cache.snapshot())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
