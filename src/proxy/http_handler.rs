use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::access::ip_filter::strip_port;
use crate::access::AccessPolicy;
use crate::config::settings::{Settings, StatsConfig};
use crate::stats::StatsAggregator;

use super::access_log::{AccessLogger, Outcome};
use super::connection::ConnectionTracker;
use super::error::ProxyError;
use super::recorder::{Recorder, RequestMeta};
use super::relay::Relay;
use super::stats_page;
use super::tunnel::{with_default_port, Tunnel};

const DEVTOOLS_PROBE_PATH: &str = "/.well-known/appspecific/com.chrome.devtools";

/// How an incoming request is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Reporting page or API; bypasses access control.
    Stats,
    /// Anything that goes through the access gate first.
    Proxy(ProxyKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyKind {
    /// CONNECT tunnel to `target` (`host:port`).
    Connect { target: String },
    /// Browser devtools probe answered locally.
    DevtoolsProbe,
    /// Ordinary request relayed to its origin.
    Plain,
}

/// Classify a request. The first matching rule wins: stats host or stats
/// paths, then CONNECT, then the devtools probe, then plain relay.
pub fn classify<B>(req: &Request<B>, stats: &StatsConfig) -> RequestKind {
    if is_stats_request(req, stats) {
        return RequestKind::Stats;
    }

    if req.method() == Method::CONNECT {
        let target = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| header_str(req.headers(), HOST).map(str::to_string))
            .unwrap_or_default();
        return RequestKind::Proxy(ProxyKind::Connect {
            target: with_default_port(&target),
        });
    }

    if req.uri().path().contains(DEVTOOLS_PROBE_PATH) {
        return RequestKind::Proxy(ProxyKind::DevtoolsProbe);
    }

    RequestKind::Proxy(ProxyKind::Plain)
}

fn is_stats_request<B>(req: &Request<B>, stats: &StatsConfig) -> bool {
    if req.method() == Method::CONNECT {
        return false;
    }

    let host = req
        .uri()
        .host()
        .or_else(|| header_str(req.headers(), HOST).map(strip_port));
    if let Some(host) = host {
        if !stats.host.is_empty() && host.eq_ignore_ascii_case(&stats.host) {
            return true;
        }
    }

    // Path rules only apply to requests addressed to the proxy itself.
    if req.uri().authority().is_some() {
        return false;
    }
    let path = req.uri().path();
    path_has_prefix(path, &stats.path)
        || path_has_prefix(path, &stats.api_path)
        || is_stats_asset(path)
}

fn is_stats_asset(path: &str) -> bool {
    matches!(
        path.rsplit_once('.').map(|(_, ext)| ext),
        Some("css") | Some("js") | Some("ico")
    )
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    !prefix.is_empty() && prefix != "/" && path.starts_with(prefix)
}

fn header_str(headers: &HeaderMap, name: hyper::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Determine the client address used for access control and statistics.
///
/// With `trust_forwarded_for`, the left-most `X-Forwarded-For` entry wins,
/// minus any port; otherwise (or when the header is absent) the socket peer
/// is used.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = header_str(headers, hyper::header::HeaderName::from_static("x-forwarded-for"))
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(first) = forwarded {
            return strip_port(first).to_string();
        }
    }

    peer.ip().to_canonical().to_string()
}

/// Plain-text error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Entry point for every request read from a client connection.
///
/// For each request the handler:
///
/// 1. Classifies it ([`classify`]).
/// 2. Serves stats requests straight from the reporting router.
/// 3. Runs the access gate (network allow-list, then Basic auth).
/// 4. Hands admitted requests to the tunnel, the relay, or the probe answer.
pub struct HttpHandler {
    settings: Arc<Settings>,
    policy: Arc<AccessPolicy>,
    connections: Arc<ConnectionTracker>,
    recorder: Recorder,
    relay: Relay,
    tunnel: Tunnel,
    stats_router: Router,
}

impl HttpHandler {
    pub fn new(
        settings: Arc<Settings>,
        policy: Arc<AccessPolicy>,
        stats: Arc<StatsAggregator>,
        connections: Arc<ConnectionTracker>,
    ) -> Self {
        // Best-effort; the proxy runs without an access log if it cannot be opened.
        let access_log = if !settings.logging.access_log.is_empty() {
            match AccessLogger::new(&settings.logging.access_log) {
                Ok(logger) => {
                    info!("Access log enabled: {}", settings.logging.access_log);
                    Some(Arc::new(logger))
                }
                Err(e) => {
                    error!("Failed to open access log {}: {}", settings.logging.access_log, e);
                    None
                }
            }
        } else {
            None
        };

        let recorder = Recorder::new(Arc::clone(&stats), access_log);
        let relay = Relay::new(&settings.upstream, recorder.clone());
        let tunnel = Tunnel::new(
            &settings.upstream,
            &settings.tunnel,
            recorder.clone(),
            Arc::clone(&connections),
        );
        let stats_router = stats_page::router(&settings.stats, stats, Arc::clone(&connections));

        Self {
            settings,
            policy,
            connections,
            recorder,
            relay,
            tunnel,
            stats_router,
        }
    }

    /// Process a single inbound request end-to-end. Never fails: every
    /// error is turned into a status response here.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        conn_id: u64,
    ) -> Response<Body> {
        self.connections.increment_requests(conn_id);

        match classify(&req, &self.settings.stats) {
            RequestKind::Stats => self.serve_stats(req).await,
            RequestKind::Proxy(kind) => self.proxy(req, peer, kind).await,
        }
    }

    async fn serve_stats(&self, req: Request<Incoming>) -> Response<Body> {
        debug!(path = %req.uri().path(), "Stats request");
        match self.stats_router.clone().oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    async fn proxy(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        kind: ProxyKind,
    ) -> Response<Body> {
        let ip = client_ip(req.headers(), peer, self.settings.security.trust_forwarded_for);
        let meta = RequestMeta::from_request(&req, ip);

        if let Err(err) = self.admit(&meta, req.headers()) {
            return self.reject(&meta, err);
        }

        info!(
            client = %meta.client_ip,
            method = %meta.method,
            host = %meta.host,
            path = %meta.path,
            "Proxy request"
        );

        match kind {
            ProxyKind::Connect { target } => self.tunnel.open(req, meta, target).await,
            ProxyKind::DevtoolsProbe => self.devtools_probe(&meta),
            ProxyKind::Plain => self.relay.forward(req, meta).await,
        }
    }

    /// Access gate: network allow-list first, then credentials.
    fn admit(&self, meta: &RequestMeta, headers: &HeaderMap) -> Result<(), ProxyError> {
        if !self.policy.is_ip_allowed(&meta.client_ip) {
            return Err(ProxyError::AccessDenied {
                ip: meta.client_ip.clone(),
                networks: self.policy.networks().to_string(),
            });
        }

        if !self.policy.check_auth(headers) {
            return Err(ProxyError::AuthRequired);
        }

        Ok(())
    }

    fn reject(&self, meta: &RequestMeta, err: ProxyError) -> Response<Body> {
        let status = err.status();
        let (outcome, response) = match err {
            ProxyError::AuthRequired => {
                debug!(client = %meta.client_ip, "Proxy authentication required");
                (Outcome::AuthRequired, self.policy.require_auth())
            }
            other => {
                warn!(client = %meta.client_ip, host = %meta.host, "{}", other);
                (Outcome::Denied, error_response(status, &other.to_string()))
            }
        };

        self.recorder.record(meta, status.as_u16(), 0, 0, outcome);
        response
    }

    fn devtools_probe(&self, meta: &RequestMeta) -> Response<Body> {
        const BODY: &str = "{}";

        let mut response = Response::new(Body::from(BODY));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let len = BODY.len() as u64;
        self.recorder
            .record(meta, StatusCode::OK.as_u16(), len, len, Outcome::DevtoolsProbe);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::default_stats_config;

    fn kind(req: Request<()>) -> RequestKind {
        classify(&req, &default_stats_config())
    }

    #[test]
    fn test_classify_stats_host() {
        let req = Request::get("http://stats.local/").body(()).unwrap();
        assert_eq!(kind(req), RequestKind::Stats);

        let req = Request::get("/")
            .header(HOST, "STATS.local:3128")
            .body(())
            .unwrap();
        assert_eq!(kind(req), RequestKind::Stats);
    }

    #[test]
    fn test_classify_stats_paths_only_when_direct() {
        let req = Request::get("/stat").body(()).unwrap();
        assert_eq!(kind(req), RequestKind::Stats);

        let req = Request::get("/api/stats").body(()).unwrap();
        assert_eq!(kind(req), RequestKind::Stats);

        let req = Request::get("/favicon.ico").body(()).unwrap();
        assert_eq!(kind(req), RequestKind::Stats);

        let req = Request::get("/index.php")
            .header(HOST, "intranet")
            .body(())
            .unwrap();
        assert_eq!(kind(req), RequestKind::Proxy(ProxyKind::Plain));

        let req = Request::get("http://example.com/stat").body(()).unwrap();
        assert_eq!(kind(req), RequestKind::Proxy(ProxyKind::Plain));
    }

    #[test]
    fn test_classify_connect_defaults_port() {
        let req = Request::connect("example.com:8443").body(()).unwrap();
        assert_eq!(
            kind(req),
            RequestKind::Proxy(ProxyKind::Connect {
                target: "example.com:8443".to_string()
            })
        );

        let req = Request::connect("stats.local:443").body(()).unwrap();
        assert!(matches!(kind(req), RequestKind::Proxy(ProxyKind::Connect { .. })));
    }

    #[test]
    fn test_classify_devtools_and_plain() {
        let req = Request::get(
            "http://localhost:9222/.well-known/appspecific/com.chrome.devtools.json",
        )
        .body(())
        .unwrap();
        assert_eq!(kind(req), RequestKind::Proxy(ProxyKind::DevtoolsProbe));

        let req = Request::post("http://example.com/form").body(()).unwrap();
        assert_eq!(kind(req), RequestKind::Proxy(ProxyKind::Plain));
    }

    #[test]
    fn test_client_ip_sources() {
        let peer: SocketAddr = "192.168.1.9:50000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer, true), "192.168.1.9");

        headers.insert("x-forwarded-for", "10.0.0.5, 172.16.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, peer, true), "10.0.0.5");
        assert_eq!(client_ip(&headers, peer, false), "192.168.1.9");

        let mapped: SocketAddr = "[::ffff:127.0.0.1]:4000".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), mapped, false), "127.0.0.1");

        let v6: SocketAddr = "[::1]:4000".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), v6, false), "::1");
    }

    #[test]
    fn test_forwarded_for_port_is_dropped() {
        let peer: SocketAddr = "192.168.1.9:50000".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.5:1234".parse().unwrap());
        assert_eq!(client_ip(&headers, peer, true), "10.0.0.5");

        headers.insert("x-forwarded-for", "[2001:db8::7]:80, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, peer, true), "2001:db8::7");

        headers.insert("x-forwarded-for", "2001:db8::7".parse().unwrap());
        assert_eq!(client_ip(&headers, peer, true), "2001:db8::7");
    }

    #[test]
    fn test_error_response() {
        let resp = error_response(StatusCode::GATEWAY_TIMEOUT, "failed");
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
