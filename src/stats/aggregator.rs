use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::stats::{ClientStats, RequestRecord, StatsSnapshot};

/// Capacity of the recent-request ring.
pub const RECENT_CAPACITY: usize = 100;

/// Default trailing window for [`StatsAggregator::active_clients`].
pub const DEFAULT_ACTIVE_WINDOW: Duration = Duration::from_secs(300);

struct StatsState {
    total_requests: u64,
    total_bytes_in: u64,
    total_bytes_out: u64,
    clients: HashMap<String, ClientStats>,
    recent: VecDeque<RequestRecord>,
    next_client_seq: u64,
}

/// Per-client traffic statistics plus a bounded history of recent requests.
///
/// Every mutation goes through [`log_request`](Self::log_request) under the
/// write lock, so concurrent requests never interleave partial updates.
/// Readers take the shared lock and receive owned copies.
pub struct StatsAggregator {
    state: RwLock<StatsState>,
    start_time: DateTime<Utc>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StatsState {
                total_requests: 0,
                total_bytes_in: 0,
                total_bytes_out: 0,
                clients: HashMap::new(),
                recent: VecDeque::with_capacity(RECENT_CAPACITY),
                next_client_seq: 0,
            }),
            start_time: Utc::now(),
        }
    }

    /// Record the outcome of one handled request or tunnel.
    pub fn log_request(
        &self,
        client_ip: &str,
        method: &str,
        host: &str,
        path: &str,
        status: u16,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        let record = RequestRecord {
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            status,
            bytes_in,
            bytes_out,
        };
        self.record(record);
    }

    fn record(&self, record: RequestRecord) {
        let now = record.timestamp;
        let mut state = self.state.write();

        state.total_requests += 1;
        state.total_bytes_in = state.total_bytes_in.saturating_add(record.bytes_in);
        state.total_bytes_out = state.total_bytes_out.saturating_add(record.bytes_out);

        let seq = state.next_client_seq;
        let created = !state.clients.contains_key(&record.client_ip);
        let client = state
            .clients
            .entry(record.client_ip.clone())
            .or_insert_with(|| ClientStats::new(record.client_ip.clone(), seq, now));

        client.requests += 1;
        client.bytes_in = client.bytes_in.saturating_add(record.bytes_in);
        client.bytes_out = client.bytes_out.saturating_add(record.bytes_out);
        client.bytes_total = client.bytes_in.saturating_add(client.bytes_out);
        if now > client.last_seen {
            client.last_seen = now;
        }

        if created {
            state.next_client_seq += 1;
        }

        if state.recent.len() >= RECENT_CAPACITY {
            state.recent.pop_front();
        }
        state.recent.push_back(record);
    }

    /// Up to `n` clients ordered by total bytes, descending. Clients with
    /// equal totals keep the order in which they were first seen.
    pub fn top_clients(&self, n: usize) -> Vec<ClientStats> {
        let state = self.state.read();
        top_of(&state.clients, n)
    }

    /// Number of clients seen within the trailing `window`.
    pub fn active_clients(&self, window: Duration) -> usize {
        let state = self.state.read();
        count_active(&state.clients, window, Utc::now())
    }

    /// Recent requests, oldest first.
    pub fn recent_requests(&self) -> Vec<RequestRecord> {
        self.state.read().recent.iter().cloned().collect()
    }

    /// Statistics for a single client, if it has been seen.
    #[cfg(test)]
    pub fn client(&self, ip: &str) -> Option<ClientStats> {
        self.state.read().clients.get(ip).cloned()
    }

    pub fn total_requests(&self) -> u64 {
        self.state.read().total_requests
    }

    /// Consistent snapshot for reporting, taken under a single read lock.
    /// Connection gauges are left at zero for the caller to fill in.
    pub fn snapshot(&self, top_n: usize, active_window: Duration) -> StatsSnapshot {
        let now = Utc::now();
        let state = self.state.read();

        StatsSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: self.start_time,
            uptime_secs: (now - self.start_time).num_seconds().max(0) as u64,
            total_requests: state.total_requests,
            total_bytes_in: state.total_bytes_in,
            total_bytes_out: state.total_bytes_out,
            active_clients: count_active(&state.clients, active_window, now),
            open_connections: 0,
            active_tunnels: 0,
            client_stats: top_of(&state.clients, top_n),
            recent_requests: state.recent.iter().cloned().collect(),
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn top_of(clients: &HashMap<String, ClientStats>, n: usize) -> Vec<ClientStats> {
    let mut entries: Vec<ClientStats> = clients.values().cloned().collect();
    entries.sort_by(|a, b| {
        b.bytes_total
            .cmp(&a.bytes_total)
            .then(a.first_seen_seq.cmp(&b.first_seen_seq))
    });
    entries.truncate(n);
    entries
}

fn count_active(
    clients: &HashMap<String, ClientStats>,
    window: Duration,
    now: DateTime<Utc>,
) -> usize {
    let cutoff = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w));

    match cutoff {
        Some(cutoff) => clients.values().filter(|c| c.last_seen > cutoff).count(),
        None => clients.len(),
    }
}
