//! Access control: client network allow-list and optional Basic authentication.
//!
//! Both checks are side-effect free predicates. The dispatcher decides what
//! to answer, what to log and what to record.

pub mod basic_auth;
pub mod ip_filter;

use std::collections::HashMap;

use axum::body::Body;
use hyper::header::PROXY_AUTHORIZATION;
use hyper::{HeaderMap, Response};

use crate::config::settings::{AuthConfig, SecurityConfig};

use self::ip_filter::NetworkList;

/// Immutable access policy shared by every request.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    networks: NetworkList,
    auth_enabled: bool,
    realm: String,
    credentials: HashMap<String, String>,
}

impl AccessPolicy {
    pub fn new(security: &SecurityConfig, auth: &AuthConfig) -> Self {
        Self {
            networks: NetworkList::parse(&security.allowed_networks),
            auth_enabled: auth.enabled,
            realm: auth.realm.clone(),
            credentials: auth.credentials.clone(),
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_enabled
    }

    pub fn user_count(&self) -> usize {
        self.credentials.len()
    }

    pub fn networks(&self) -> &NetworkList {
        &self.networks
    }

    /// Whether `address` (optionally carrying a port) may use the proxy.
    pub fn is_ip_allowed(&self, address: &str) -> bool {
        self.networks.contains(address)
    }

    /// Validate the `Proxy-Authorization` header.
    ///
    /// Passwords are stored and compared in plain text. This keeps casual
    /// users out of an intranet proxy; it is not meant to resist an attacker
    /// who can read the configuration or sniff the connection.
    pub fn check_auth(&self, headers: &HeaderMap) -> bool {
        if !self.auth_enabled {
            return true;
        }

        let Some(value) = headers
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };

        match basic_auth::decode_basic(value) {
            Some((username, password)) => self
                .credentials
                .get(&username)
                .is_some_and(|stored| *stored == password),
            None => false,
        }
    }

    /// The 407 challenge response.
    pub fn require_auth(&self) -> Response<Body> {
        basic_auth::challenge(&self.realm)
    }
}
