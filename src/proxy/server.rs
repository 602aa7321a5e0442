use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::settings::Settings;

use super::connection::ConnectionTracker;
use super::http_handler::HttpHandler;

/// Accept loop of the forward proxy. Every client connection is served on
/// its own task with HTTP/1.1 keep-alive and upgrade (CONNECT) support.
pub struct ProxyServer {
    settings: Arc<Settings>,
    handler: Arc<HttpHandler>,
    connections: Arc<ConnectionTracker>,
}

impl ProxyServer {
    pub fn new(
        settings: Arc<Settings>,
        handler: Arc<HttpHandler>,
        connections: Arc<ConnectionTracker>,
    ) -> Self {
        Self {
            settings,
            handler,
            connections,
        }
    }

    /// Bind the configured listen address. Failure here is fatal to startup.
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = &self.settings.server.bind;
        let listener = bind_tcp_listener(addr)
            .with_context(|| format!("failed to bind proxy listener on {addr}"))?;
        let listener = TcpListener::from_std(listener)
            .with_context(|| format!("failed to register listener on {addr}"))?;
        info!(addr = %addr, "Proxy listener started");
        Ok(listener)
    }

    /// Serve connections from `listener` until the task is cancelled.
    pub async fn serve(&self, listener: TcpListener) {
        let max_connections = self.settings.server.max_connections as u64;

        info!("Proxy is ready to accept connections");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Failed to accept TCP connection: {}", err);
                    continue;
                }
            };

            if at_capacity(&self.connections, max_connections) {
                debug!(peer = %peer_addr, "Max connections reached, dropping");
                drop(stream);
                continue;
            }

            let handler = Arc::clone(&self.handler);
            let connections = Arc::clone(&self.connections);
            tokio::spawn(handle_connection(stream, peer_addr, handler, connections));
        }
    }
}

/// Upgraded tunnels no longer hold a `ConnectionGuard`, so they are counted
/// separately.
fn at_capacity(connections: &ConnectionTracker, max_connections: u64) -> bool {
    max_connections > 0 && connections.open_count() >= max_connections
}

fn bind_tcp_listener(addr: &str) -> Result<std::net::TcpListener> {
    let sock_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address {addr}"))?;

    let domain = if sock_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<HttpHandler>,
    connections: Arc<ConnectionTracker>,
) {
    let _ = stream.set_nodelay(true);
    let conn_id = connections.register(peer);

    let _guard = ConnectionGuard {
        connections: Arc::clone(&connections),
        id: conn_id,
    };

    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let h = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(h.handle(req, peer, conn_id).await) }
    });

    let conn = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .with_upgrades();

    if let Err(err) = conn.await {
        debug!(
            peer = %peer,
            connection_id = conn_id,
            error = %err,
            "HTTP connection error"
        );
    }
}

struct ConnectionGuard {
    connections: Arc<ConnectionTracker>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.remove(self.id);
    }
}
