use std::sync::Arc;
use std::time::Instant;

use hyper::header::HOST;
use hyper::Request;

use crate::stats::StatsAggregator;

use super::access_log::{AccessLogEntry, AccessLogger, Outcome};

/// What gets recorded about a request, captured before the request is consumed.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub client_ip: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub started: Instant,
}

impl RequestMeta {
    pub fn from_request<B>(req: &Request<B>, client_ip: String) -> Self {
        let host = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Self {
            client_ip,
            method: req.method().to_string(),
            host,
            path: req.uri().path().to_string(),
            started: Instant::now(),
        }
    }
}

/// Funnels terminal request outcomes into the statistics aggregator and the
/// optional access log.
#[derive(Clone)]
pub struct Recorder {
    stats: Arc<StatsAggregator>,
    access_log: Option<Arc<AccessLogger>>,
}

impl Recorder {
    pub fn new(stats: Arc<StatsAggregator>, access_log: Option<Arc<AccessLogger>>) -> Self {
        Self { stats, access_log }
    }

    /// Record one statistics entry and one access-log line.
    pub fn record(
        &self,
        meta: &RequestMeta,
        status: u16,
        bytes_in: u64,
        bytes_out: u64,
        outcome: Outcome,
    ) {
        self.stats.log_request(
            &meta.client_ip,
            &meta.method,
            &meta.host,
            &meta.path,
            status,
            bytes_in,
            bytes_out,
        );
        self.log_access(meta, status, bytes_in, bytes_out, outcome);
    }

    /// Write the access-log line only, leaving statistics untouched.
    pub fn log_access(
        &self,
        meta: &RequestMeta,
        status: u16,
        bytes_in: u64,
        bytes_out: u64,
        outcome: Outcome,
    ) {
        if let Some(ref logger) = self.access_log {
            logger.log(&AccessLogEntry {
                ip: &meta.client_ip,
                method: &meta.method,
                host: &meta.host,
                path: &meta.path,
                status,
                bytes_in,
                bytes_out,
                outcome,
                us: meta.started.elapsed().as_micros() as u64,
            });
        }
    }
}
