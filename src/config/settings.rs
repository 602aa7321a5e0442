use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::defaults;

/// Top-level configuration for the proxy.
/// Deserializes from a TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_server_config")]
    pub server: ServerConfig,

    #[serde(default = "defaults::default_stats_config")]
    pub stats: StatsConfig,

    #[serde(default = "defaults::default_auth_config")]
    pub auth: AuthConfig,

    #[serde(default = "defaults::default_security_config")]
    pub security: SecurityConfig,

    #[serde(default = "defaults::default_upstream_config")]
    pub upstream: UpstreamConfig,

    #[serde(default = "defaults::default_tunnel_config")]
    pub tunnel: TunnelConfig,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    ///
    /// A file that cannot be read yields the defaults along with the read
    /// error. A file that is read but does not parse is an error.
    pub fn load(path: &str) -> Result<(Self, Option<std::io::Error>)> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let settings = Self::from_toml(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path))?;
                Ok((settings, None))
            }
            Err(err) => Ok((Self::default(), Some(err))),
        }
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Replace the port of `server.bind`, keeping the bind address.
    pub fn override_port(&mut self, port: u16) -> Result<()> {
        let mut addr: SocketAddr = self
            .server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))?;
        addr.set_port(port);
        self.server.bind = addr.to_string();
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: defaults::default_server_config(),
            stats: defaults::default_stats_config(),
            auth: defaults::default_auth_config(),
            security: defaults::default_security_config(),
            upstream: defaults::default_upstream_config(),
            tunnel: defaults::default_tunnel_config(),
            logging: defaults::default_logging_config(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_bind")]
    pub bind: String,

    #[serde(default = "defaults::default_max_connections")]
    pub max_connections: usize,
}

/// Statistics reporting surface.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Path prefix of the statistics page on direct (non-proxied) requests.
    #[serde(default = "defaults::default_stats_path")]
    pub path: String,

    /// Prefix of the JSON API; the snapshot lives at `<api_path>/stats`.
    #[serde(default = "defaults::default_api_path")]
    pub api_path: String,

    /// Virtual host that always reaches the statistics page, bypassing access control.
    #[serde(default = "defaults::default_stats_host")]
    pub host: String,

    #[serde(default = "defaults::default_static_dir")]
    pub static_dir: PathBuf,

    #[serde(default = "defaults::default_language")]
    pub default_language: String,

    #[serde(default = "defaults::default_top_clients")]
    pub top_clients: usize,

    #[serde(default = "defaults::default_active_window_secs")]
    pub active_window_secs: u64,

    /// Interval of the periodic traffic summary in the log; 0 disables it.
    #[serde(default = "defaults::default_report_interval_secs")]
    pub report_interval_secs: u64,
}

/// Basic authentication for proxy clients.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "defaults::default_realm")]
    pub realm: String,

    /// username -> password, compared in plain text.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

/// Client network restrictions.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "defaults::default_allowed_networks")]
    pub allowed_networks: Vec<String>,

    /// Use the first `X-Forwarded-For` entry as the client address when present.
    #[serde(default = "defaults::default_trust_forwarded_for")]
    pub trust_forwarded_for: bool,
}

/// Outbound connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "defaults::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "defaults::default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
}

/// CONNECT tunnel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Grace period for the second direction once the first one has finished.
    #[serde(default = "defaults::default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    #[serde(default = "defaults::default_log_file")]
    pub file: String,

    /// JSON-lines access log; empty disables it.
    #[serde(default)]
    pub access_log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.server.bind, "0.0.0.0:3128");
        assert_eq!(settings.stats.path, "/stat");
        assert_eq!(settings.stats.api_path, "/api");
        assert_eq!(settings.stats.host, "stats.local");
        assert!(!settings.auth.enabled);
        assert!(settings.auth.credentials.is_empty());
        assert_eq!(settings.security.allowed_networks, vec!["127.0.0.1/32"]);
        assert!(settings.security.trust_forwarded_for);
        assert_eq!(settings.upstream.connect_timeout_secs, 10);
        assert_eq!(settings.stats.active_window_secs, 300);
        assert_eq!(settings.stats.report_interval_secs, 60);
        assert!(settings.logging.access_log.is_empty());
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_toml(
            r#"
            [server]
            bind = "127.0.0.1:8080"

            [auth]
            enabled = true
            realm = "office"

            [auth.credentials]
            alice = "secret"
            bob = "hunter2"

            [security]
            allowed_networks = ["10.0.0.0/8", "::1/128"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.server.bind, "127.0.0.1:8080");
        assert!(settings.auth.enabled);
        assert_eq!(settings.auth.realm, "office");
        assert_eq!(settings.auth.credentials.get("bob").map(String::as_str), Some("hunter2"));
        assert_eq!(settings.security.allowed_networks.len(), 2);
        // Untouched sections keep their defaults.
        assert_eq!(settings.tunnel.drain_timeout_secs, 30);
    }

    #[test]
    fn test_explicit_empty_allow_list_is_kept() {
        let settings = Settings::from_toml("[security]\nallowed_networks = []\n").unwrap();
        assert!(settings.security.allowed_networks.is_empty());
    }

    #[test]
    fn test_override_port() {
        let mut settings = Settings::default();
        settings.override_port(9000).unwrap();
        assert_eq!(settings.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Settings::from_toml("[server\nbind = 1").is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let (settings, err) = Settings::load("/nonexistent/tallyproxy.toml").unwrap();
        assert!(err.is_some());
        assert_eq!(settings.server.bind, "0.0.0.0:3128");
    }
}
