//! Reporting endpoints: the JSON snapshot and the static stats page.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::ACCEPT_LANGUAGE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};

use crate::config::settings::StatsConfig;
use crate::models::stats::StatsSnapshot;
use crate::stats::StatsAggregator;

use super::connection::ConnectionTracker;

#[derive(Clone)]
pub struct StatsPageState {
    stats: Arc<StatsAggregator>,
    connections: Arc<ConnectionTracker>,
    static_dir: PathBuf,
    default_language: String,
    top_clients: usize,
    active_window: Duration,
}

/// Build the reporting router.
///
/// Routes: `/`, the stats path (with and without a trailing slash) and any
/// `*.html` path serve the page; `<api>/stats` and any `*.json` path serve
/// the snapshot; `*.css`, `*.js` and `*.ico` map to the page's assets.
pub fn router(
    config: &StatsConfig,
    stats: Arc<StatsAggregator>,
    connections: Arc<ConnectionTracker>,
) -> Router {
    let state = StatsPageState {
        stats,
        connections,
        static_dir: config.static_dir.clone(),
        default_language: config.default_language.clone(),
        top_clients: config.top_clients,
        active_window: Duration::from_secs(config.active_window_secs),
    };

    let stats_path = normalize_path(&config.path);
    let api_route = format!("{}/stats", normalize_path(&config.api_path).trim_end_matches('/'));

    let mut page_routes = vec!["/".to_string()];
    for candidate in [stats_path.clone(), format!("{}/", stats_path.trim_end_matches('/'))] {
        if !page_routes.contains(&candidate) && candidate != api_route {
            page_routes.push(candidate);
        }
    }

    let mut router = Router::new().route(&api_route, get(snapshot));
    for route in &page_routes {
        router = router.route(route, get(index));
    }

    router.fallback(asset).with_state(state)
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

async fn snapshot(State(state): State<StatsPageState>) -> Json<StatsSnapshot> {
    Json(build_snapshot(&state))
}

fn build_snapshot(state: &StatsPageState) -> StatsSnapshot {
    let mut snapshot = state.stats.snapshot(state.top_clients, state.active_window);
    snapshot.open_connections = state.connections.active_count();
    snapshot.active_tunnels = state.connections.tunnel_count();
    snapshot
}

async fn index(State(state): State<StatsPageState>, req: Request) -> Response {
    let language = preferred_language(req.headers(), &state.default_language);
    let localized = state.static_dir.join(format!("index.{language}.html"));

    let page = if tokio::fs::metadata(&localized).await.is_ok() {
        localized
    } else {
        state.static_dir.join("index.html")
    };
    serve_file(page, req).await
}

async fn asset(State(state): State<StatsPageState>, req: Request) -> Response {
    let extension = Path::new(req.uri().path())
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "json" => Json(build_snapshot(&state)).into_response(),
        "html" => index(State(state), req).await,
        "css" => serve_file(state.static_dir.join("styles.css"), req).await,
        "js" => serve_file(state.static_dir.join("script.js"), req).await,
        "ico" => serve_file(state.static_dir.join("favicon.svg"), req).await,
        _ => {
            debug!(path = %req.uri().path(), "No stats resource");
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
    }
}

async fn serve_file(path: PathBuf, req: Request) -> Response {
    if tokio::fs::metadata(&path).await.is_err() {
        warn!(file = %path.display(), "Stats page file missing");
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    }

    match ServeFile::new(&path).oneshot(req).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

/// First language tag of `Accept-Language`, reduced to its primary subtag.
/// Anything that is not a plain alphabetic tag falls back to `default`.
pub fn preferred_language(headers: &HeaderMap, default: &str) -> String {
    headers
        .get(ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|tag| tag.split(';').next())
        .and_then(|tag| tag.trim().split(['-', '_']).next())
        .map(str::to_ascii_lowercase)
        .filter(|tag| !tag.is_empty() && tag.len() <= 8 && tag.chars().all(|c| c.is_ascii_alphabetic()))
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    fn temp_static_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tallyproxy-static-{}-{}-{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<html>en</html>").unwrap();
        std::fs::write(dir.join("index.de.html"), "<html>de</html>").unwrap();
        std::fs::write(dir.join("styles.css"), "body{}").unwrap();
        dir
    }

    fn test_router(dir: &Path) -> (Router, Arc<StatsAggregator>) {
        let config = StatsConfig {
            static_dir: dir.to_path_buf(),
            ..crate::config::defaults::default_stats_config()
        };
        let stats = Arc::new(StatsAggregator::new());
        let connections = Arc::new(ConnectionTracker::new());
        (router(&config, Arc::clone(&stats), connections), stats)
    }

    async fn get_body(router: &Router, uri: &str, lang: Option<&str>) -> (StatusCode, String) {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(lang) = lang {
            builder = builder.header(ACCEPT_LANGUAGE, lang);
        }
        let resp = router
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[test]
    fn test_preferred_language() {
        let mut headers = HeaderMap::new();
        assert_eq!(preferred_language(&headers, "en"), "en");

        headers.insert(ACCEPT_LANGUAGE, "de-DE,de;q=0.9,en;q=0.8".parse().unwrap());
        assert_eq!(preferred_language(&headers, "en"), "de");

        headers.insert(ACCEPT_LANGUAGE, "../../etc".parse().unwrap());
        assert_eq!(preferred_language(&headers, "en"), "en");
    }

    #[tokio::test]
    async fn test_snapshot_json() {
        let dir = temp_static_dir("json");
        let (router, stats) = test_router(&dir);
        stats.log_request("10.0.0.1", "GET", "example.com", "/", 200, 1, 99);

        let (status, body) = get_body(&router, "/api/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["client_stats"][0]["ip"], "10.0.0.1");
        assert_eq!(json["client_stats"][0]["bytes_total"], 100);

        let (status, _) = get_body(&router, "/anything/data.json", None).await;
        assert_eq!(status, StatusCode::OK);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_page_language_selection() {
        let dir = temp_static_dir("lang");
        let (router, _) = test_router(&dir);

        let (status, body) = get_body(&router, "/stat", Some("de-AT,de;q=0.9")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<html>de</html>");

        let (_, body) = get_body(&router, "/", Some("fr")).await;
        assert_eq!(body, "<html>en</html>");

        let (_, body) = get_body(&router, "/stat/styles.css", None).await;
        assert_eq!(body, "body{}");

        let (status, _) = get_body(&router, "/stat/script.js", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_body(&router, "/stat/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
