use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::settings::StatsConfig;

use super::aggregator::StatsAggregator;

/// Traffic summary written to the log on every reporter tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSummary {
    pub total_requests: u64,
    pub new_requests: u64,
    pub active_clients: usize,
    pub recent_errors: usize,
}

/// Periodically logs a summary of the aggregated traffic.
pub struct StatsReporter {
    stats: Arc<StatsAggregator>,
    top_n: usize,
    active_window: Duration,
    interval: Duration,
}

impl StatsReporter {
    /// Returns `None` when reporting is disabled (`report_interval_secs = 0`).
    pub fn new(config: &StatsConfig, stats: Arc<StatsAggregator>) -> Option<Self> {
        if config.report_interval_secs == 0 {
            return None;
        }
        Some(Self {
            stats,
            top_n: config.top_clients,
            active_window: Duration::from_secs(config.active_window_secs),
            interval: Duration::from_secs(config.report_interval_secs),
        })
    }

    /// Run the reporter loop forever.
    pub async fn run(&self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut last_total = self.stats.total_requests();
        loop {
            ticker.tick().await;
            let summary = self.summarize(last_total);
            last_total = summary.total_requests;
            self.report(&summary);
        }
    }

    fn summarize(&self, last_total: u64) -> TrafficSummary {
        let total_requests = self.stats.total_requests();
        let recent_errors = self
            .stats
            .recent_requests()
            .iter()
            .filter(|r| r.status >= 400)
            .count();

        TrafficSummary {
            total_requests,
            new_requests: total_requests.saturating_sub(last_total),
            active_clients: self.stats.active_clients(self.active_window),
            recent_errors,
        }
    }

    fn report(&self, summary: &TrafficSummary) {
        if summary.new_requests == 0 {
            debug!(total = summary.total_requests, "No proxy traffic since last report");
            return;
        }

        info!(
            total = summary.total_requests,
            new = summary.new_requests,
            active_clients = summary.active_clients,
            recent_errors = summary.recent_errors,
            "Traffic summary"
        );

        for client in self.stats.top_clients(self.top_n) {
            debug!(
                client = %client.ip,
                requests = client.requests,
                bytes_in = client.bytes_in,
                bytes_out = client.bytes_out,
                "Top client"
            );
        }
    }
}
