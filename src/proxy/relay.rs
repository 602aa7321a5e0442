//! Plain (non-CONNECT) HTTP forwarding.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HOST, PROXY_AUTHORIZATION};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::config::settings::UpstreamConfig;

use super::access_log::Outcome;
use super::error::ProxyError;
use super::http_handler::error_response;
use super::recorder::{Recorder, RequestMeta};
use super::traffic::TrafficCounter;

pub type UpstreamClient = Client<HttpConnector, RequestBody>;

/// Build the shared upstream client. Canceled requests are not retried, so
/// every client request produces at most one upstream attempt.
pub fn build_client(config: &UpstreamConfig) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .retry_canceled_requests(false)
        .build(connector)
}

/// Forwards ordinary HTTP requests to their origin server.
pub struct Relay {
    client: UpstreamClient,
    recorder: Recorder,
}

impl Relay {
    pub fn new(config: &UpstreamConfig, recorder: Recorder) -> Self {
        Self {
            client: build_client(config),
            recorder,
        }
    }

    /// Forward `req` upstream, streaming the request body as it arrives and
    /// the response body back.
    ///
    /// The statistics entry for a successful relay is written by the
    /// returned body once it has been fully sent or dropped.
    pub async fn forward(&self, req: Request<Incoming>, meta: RequestMeta) -> Response<Body> {
        let (parts, body) = req.into_parts();

        let uri = match absolute_uri(&parts.uri, &parts.headers) {
            Ok(uri) => uri,
            Err(err) => return self.fail(&meta, err),
        };

        let mut headers = parts.headers;
        headers.remove(PROXY_AUTHORIZATION);

        let body = RequestBody::new(body);
        let bytes_in = body.counter();

        let mut upstream_req = Request::new(body);
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = headers;

        let response = match self.client.request(upstream_req).await {
            Ok(response) => response,
            Err(err) => {
                return self.fail(&meta, ProxyError::UpstreamProtocol(err.to_string()))
            }
        };

        let status = response.status();
        debug!(
            client = %meta.client_ip,
            host = %meta.host,
            status = status.as_u16(),
            "Upstream responded"
        );

        let (parts, body) = response.into_parts();
        let body = RelayBody::new(
            body,
            PendingRecord {
                recorder: self.recorder.clone(),
                meta,
                status: status.as_u16(),
                bytes_in,
            },
        );
        Response::from_parts(parts, Body::new(body))
    }

    /// Failed relays are recorded as zero-byte entries.
    fn fail(&self, meta: &RequestMeta, err: ProxyError) -> Response<Body> {
        warn!(
            client = %meta.client_ip,
            method = %meta.method,
            host = %meta.host,
            error = %err,
            "Relay failed"
        );
        let status = err.status();
        self.recorder
            .record(meta, status.as_u16(), 0, 0, Outcome::UpstreamFailed);
        error_response(status, &err.to_string())
    }
}

/// Turn an origin-form target into an absolute `http://` URL using the
/// `Host` header. Absolute targets are returned unchanged.
pub fn absolute_uri(uri: &Uri, headers: &HeaderMap) -> Result<Uri, ProxyError> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::UpstreamProtocol("request has no Host header".to_string()))?;

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    format!("http://{host}{path_and_query}")
        .parse::<Uri>()
        .map_err(|e| ProxyError::UpstreamProtocol(format!("invalid target URL: {e}")))
}

/// Client request body streamed to the origin. The running byte total is
/// published through a shared counter, since hyper owns the body once the
/// request is sent.
pub struct RequestBody {
    inner: TrafficCounter<Incoming>,
    total: Arc<AtomicU64>,
}

impl RequestBody {
    fn new(inner: Incoming) -> Self {
        Self {
            inner: TrafficCounter::new(inner),
            total: Arc::new(AtomicU64::new(0)),
        }
    }

    fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.total)
    }
}

impl HttpBody for RequestBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(_))) = &polled {
            this.total.store(this.inner.bytes_read(), Ordering::Relaxed);
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

struct PendingRecord {
    recorder: Recorder,
    meta: RequestMeta,
    status: u16,
    bytes_in: Arc<AtomicU64>,
}

impl PendingRecord {
    fn complete(self, bytes_out: u64) {
        self.recorder.record(
            &self.meta,
            self.status,
            self.bytes_in.load(Ordering::Relaxed),
            bytes_out,
            Outcome::Relayed,
        );
    }
}

/// Upstream response body that counts what is streamed to the client and
/// records the request exactly once: at end of stream, on a body error, or
/// when the body is dropped early (client gone).
pub struct RelayBody {
    inner: TrafficCounter<Incoming>,
    pending: Option<PendingRecord>,
}

impl RelayBody {
    fn new(inner: Incoming, pending: PendingRecord) -> Self {
        Self {
            inner: TrafficCounter::new(inner),
            pending: Some(pending),
        }
    }

    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.complete(self.inner.bytes_read());
        }
    }
}

impl HttpBody for RelayBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.finish(),
            Poll::Ready(Some(Err(err))) => {
                debug!(error = %err, "Upstream body ended with error");
                this.finish();
            }
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_uri_passthrough() {
        let uri: Uri = "http://example.com/a?b=c".parse().unwrap();
        let out = absolute_uri(&uri, &HeaderMap::new()).unwrap();
        assert_eq!(out, uri);
    }

    #[test]
    fn test_absolute_uri_from_host_header() {
        let uri: Uri = "/search?q=rust".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "intranet:8080".parse().unwrap());

        let out = absolute_uri(&uri, &headers).unwrap();
        assert_eq!(out.to_string(), "http://intranet:8080/search?q=rust");
    }

    #[test]
    fn test_absolute_uri_requires_host() {
        let uri: Uri = "/".parse().unwrap();
        let err = absolute_uri(&uri, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamProtocol(_)));
    }
}
