use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cumulative counters for a single client IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    pub ip: String,

    /// Bytes received from the client (request bodies, tunnel uplink).
    pub bytes_in: u64,

    /// Bytes sent back to the client (response bodies, tunnel downlink).
    pub bytes_out: u64,

    pub bytes_total: u64,

    pub requests: u64,

    pub last_seen: DateTime<Utc>,

    /// Order in which the client was first observed; used as a stable tie-break.
    #[serde(skip)]
    pub first_seen_seq: u64,
}

impl ClientStats {
    pub fn new(ip: String, first_seen_seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            ip,
            bytes_in: 0,
            bytes_out: 0,
            bytes_total: 0,
            requests: 0,
            last_seen: now,
            first_seen_seq,
        }
    }
}

/// One handled request, kept in the recent-history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Point-in-time view of the aggregator, served as JSON to the stats page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub version: String,

    pub start_time: DateTime<Utc>,

    pub uptime_secs: u64,

    pub total_requests: u64,

    pub total_bytes_in: u64,

    pub total_bytes_out: u64,

    /// Clients seen within the active window.
    pub active_clients: usize,

    pub open_connections: u64,

    pub active_tunnels: u64,

    /// Top clients by total bytes.
    pub client_stats: Vec<ClientStats>,

    /// Oldest first.
    pub recent_requests: Vec<RequestRecord>,
}
