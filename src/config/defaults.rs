use std::path::PathBuf;

use crate::stats::aggregator::DEFAULT_ACTIVE_WINDOW;

use super::settings::{
    AuthConfig, LoggingConfig, SecurityConfig, ServerConfig, StatsConfig, TunnelConfig,
    UpstreamConfig,
};

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
        max_connections: default_max_connections(),
    }
}

pub fn default_stats_config() -> StatsConfig {
    StatsConfig {
        path: default_stats_path(),
        api_path: default_api_path(),
        host: default_stats_host(),
        static_dir: default_static_dir(),
        default_language: default_language(),
        top_clients: default_top_clients(),
        active_window_secs: default_active_window_secs(),
        report_interval_secs: default_report_interval_secs(),
    }
}

pub fn default_auth_config() -> AuthConfig {
    AuthConfig {
        enabled: false,
        realm: default_realm(),
        credentials: Default::default(),
    }
}

pub fn default_security_config() -> SecurityConfig {
    SecurityConfig {
        allowed_networks: default_allowed_networks(),
        trust_forwarded_for: default_trust_forwarded_for(),
    }
}

pub fn default_upstream_config() -> UpstreamConfig {
    UpstreamConfig {
        connect_timeout_secs: default_connect_timeout_secs(),
        pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
    }
}

pub fn default_tunnel_config() -> TunnelConfig {
    TunnelConfig {
        drain_timeout_secs: default_drain_timeout_secs(),
    }
}

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file: default_log_file(),
        access_log: String::new(),
    }
}

// ---------------------------------------------------------------------------
// ServerConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_bind() -> String {
    "0.0.0.0:3128".to_string()
}

pub fn default_max_connections() -> usize {
    10_000
}

// ---------------------------------------------------------------------------
// StatsConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_stats_path() -> String {
    "/stat".to_string()
}

pub fn default_api_path() -> String {
    "/api".to_string()
}

pub fn default_stats_host() -> String {
    "stats.local".to_string()
}

pub fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

pub fn default_language() -> String {
    "en".to_string()
}

pub fn default_top_clients() -> usize {
    10
}

pub fn default_active_window_secs() -> u64 {
    DEFAULT_ACTIVE_WINDOW.as_secs()
}

pub fn default_report_interval_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// AuthConfig / SecurityConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_realm() -> String {
    "tallyproxy".to_string()
}

pub fn default_allowed_networks() -> Vec<String> {
    // Loopback only unless configured otherwise.
    vec!["127.0.0.1/32".to_string()]
}

pub fn default_trust_forwarded_for() -> bool {
    true
}

// ---------------------------------------------------------------------------
// UpstreamConfig / TunnelConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_connect_timeout_secs() -> u64 {
    10
}

pub fn default_pool_idle_timeout_secs() -> u64 {
    30
}

pub fn default_drain_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// LoggingConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_log_file() -> String {
    "logs/tallyproxy.log".to_string()
}
