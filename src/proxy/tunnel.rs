//! CONNECT tunnelling: dial, answer "Connection established", then relay
//! raw bytes both ways until both directions finish.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::config::settings::{TunnelConfig, UpstreamConfig};

use super::access_log::Outcome;
use super::connection::ConnectionTracker;
use super::error::ProxyError;
use super::http_handler::error_response;
use super::recorder::{Recorder, RequestMeta};
use super::traffic::TrafficCounter;

/// Default port for CONNECT targets without one.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

pub struct Tunnel {
    connect_timeout: Duration,
    drain_timeout: Duration,
    recorder: Recorder,
    connections: Arc<ConnectionTracker>,
}

impl Tunnel {
    pub fn new(
        upstream: &UpstreamConfig,
        tunnel: &TunnelConfig,
        recorder: Recorder,
        connections: Arc<ConnectionTracker>,
    ) -> Self {
        Self {
            connect_timeout: Duration::from_secs(upstream.connect_timeout_secs),
            drain_timeout: Duration::from_secs(tunnel.drain_timeout_secs),
            recorder,
            connections,
        }
    }

    /// Handle an admitted CONNECT request.
    ///
    /// A dial failure answers 504 and records no statistics. On success the
    /// relay runs on its own task once hyper hands over the upgraded
    /// connection, and the 200 response is returned immediately.
    pub async fn open(
        &self,
        req: Request<Incoming>,
        meta: RequestMeta,
        target: String,
    ) -> Response<Body> {
        let upstream = match dial(&target, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(client = %meta.client_ip, error = %err, "CONNECT dial failed");
                self.recorder
                    .log_access(&meta, 504, 0, 0, Outcome::UpstreamFailed);
                return error_response(err.status(), &err.to_string());
            }
        };

        info!(client = %meta.client_ip, upstream = %target, "Tunnel established");

        let session = TunnelSession {
            meta,
            target,
            drain_timeout: self.drain_timeout,
            recorder: self.recorder.clone(),
            connections: Arc::clone(&self.connections),
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => session.run(TokioIo::new(upgraded), upstream).await,
                Err(err) => {
                    let err = ProxyError::HijackUnsupported(err.to_string());
                    error!(
                        client = %session.meta.client_ip,
                        upstream = %session.target,
                        error = %err,
                        "Tunnel aborted"
                    );
                }
            }
        });

        connection_established()
    }
}

fn connection_established() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    response
}

/// Append the default CONNECT port when `target` carries none.
pub fn with_default_port(target: &str) -> String {
    let has_port = if let Some(rest) = target.strip_prefix('[') {
        rest.contains("]:")
    } else {
        target.contains(':')
    };

    if has_port {
        target.to_string()
    } else {
        format!("{target}:{DEFAULT_CONNECT_PORT}")
    }
}

async fn dial(target: &str, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(err)) => Err(ProxyError::UpstreamUnreachable {
            target: target.to_string(),
            reason: err.to_string(),
        }),
        Err(_) => Err(ProxyError::UpstreamUnreachable {
            target: target.to_string(),
            reason: format!("timed out after {}s", connect_timeout.as_secs()),
        }),
    }
}

/// An established tunnel waiting for its client side.
struct TunnelSession {
    meta: RequestMeta,
    target: String,
    drain_timeout: Duration,
    recorder: Recorder,
    connections: Arc<ConnectionTracker>,
}

impl TunnelSession {
    /// Relay until both directions are done, then record one entry with
    /// status 200. Bytes from the client count as inbound, bytes from the
    /// target as outbound.
    async fn run<C>(self, client: C, upstream: TcpStream)
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let _tunnel = self.connections.track_tunnel();

        let (client_read, mut client_write) = tokio::io::split(client);
        let (upstream_read, mut upstream_write) = upstream.into_split();
        let mut uplink = TrafficCounter::new(client_read);
        let mut downlink = TrafficCounter::new(upstream_read);

        {
            let to_upstream = pipe(&mut uplink, &mut upstream_write);
            let to_client = pipe(&mut downlink, &mut client_write);
            tokio::pin!(to_upstream, to_client);

            // Once one side finishes, the other gets a bounded grace period.
            tokio::select! {
                result = &mut to_upstream => {
                    log_direction(&self.target, "client->target", &result);
                    if let Ok(result) = tokio::time::timeout(self.drain_timeout, &mut to_client).await {
                        log_direction(&self.target, "target->client", &result);
                    } else {
                        debug!(upstream = %self.target, "Drain timeout, closing tunnel");
                    }
                }
                result = &mut to_client => {
                    log_direction(&self.target, "target->client", &result);
                    if let Ok(result) = tokio::time::timeout(self.drain_timeout, &mut to_upstream).await {
                        log_direction(&self.target, "client->target", &result);
                    } else {
                        debug!(upstream = %self.target, "Drain timeout, closing tunnel");
                    }
                }
            }
        }

        let bytes_in = uplink.bytes_read();
        let bytes_out = downlink.bytes_read();
        info!(
            client = %self.meta.client_ip,
            upstream = %self.target,
            bytes_in,
            bytes_out,
            "Tunnel closed"
        );
        self.recorder
            .record(&self.meta, 200, bytes_in, bytes_out, Outcome::Tunneled);
    }
}

/// Copy until EOF or error, then half-close the destination.
async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(reader, writer).await;
    let _ = writer.shutdown().await;
    copied
}

fn log_direction(target: &str, direction: &str, result: &io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(upstream = %target, direction, bytes, "Tunnel direction finished"),
        Err(err) => debug!(upstream = %target, direction, error = %err, "Tunnel direction failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::stats::StatsAggregator;

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("example.com"), "example.com:443");
        assert_eq!(with_default_port("example.com:8443"), "example.com:8443");
        assert_eq!(with_default_port("10.0.0.1"), "10.0.0.1:443");
        assert_eq!(with_default_port("[::1]"), "[::1]:443");
        assert_eq!(with_default_port("[::1]:22"), "[::1]:22");
    }

    #[tokio::test]
    async fn test_dial_failure_is_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dial(&addr.to_string(), Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnreachable { .. }));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_session_counts_both_directions() {
        // Target answers every chunk with its uppercase form.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n].to_ascii_uppercase()).await.unwrap();
            }
        });

        let stats = Arc::new(StatsAggregator::new());
        let connections = Arc::new(ConnectionTracker::new());
        let req = Request::connect(addr.to_string()).body(()).unwrap();
        let session = TunnelSession {
            meta: RequestMeta::from_request(&req, "127.0.0.1".to_string()),
            target: addr.to_string(),
            drain_timeout: Duration::from_secs(5),
            recorder: Recorder::new(Arc::clone(&stats), None),
            connections: Arc::clone(&connections),
        };

        let upstream = dial(&addr.to_string(), Duration::from_secs(2)).await.unwrap();
        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let relay = tokio::spawn(session.run(proxy_side, upstream));

        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HELLO");
        assert_eq!(connections.tunnel_count(), 1);

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        relay.await.unwrap();
        assert_eq!(connections.tunnel_count(), 0);

        let entry = stats.client("127.0.0.1").unwrap();
        assert_eq!(entry.requests, 1);
        assert_eq!(entry.bytes_in, 5);
        assert_eq!(entry.bytes_out, 5);
        let recent = stats.recent_requests();
        assert_eq!(recent[0].status, 200);
        assert_eq!(recent[0].method, "CONNECT");
    }
}
