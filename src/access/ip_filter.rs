//! Client address parsing and CIDR allow-list membership.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

/// Strip a port suffix from a textual client address.
///
/// Handles `[v6]:port`, `[v6]`, `v4:port` and `host:port`. A bare IPv6
/// literal (several colons, no brackets) is returned unchanged.
pub fn strip_port(addr: &str) -> &str {
    let addr = addr.trim();

    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }

    if addr.matches(':').count() == 1 {
        if let Some((host, _port)) = addr.split_once(':') {
            return host;
        }
    }

    addr
}

/// Parse a textual client address into an IP, collapsing IPv4-mapped IPv6
/// addresses to their IPv4 form.
pub fn parse_client_ip(addr: &str) -> Option<IpAddr> {
    strip_port(addr)
        .parse::<IpAddr>()
        .ok()
        .map(|ip| ip.to_canonical())
}

/// Ordered list of allowed networks.
#[derive(Debug, Clone)]
pub struct NetworkList {
    networks: Vec<IpNet>,
    allow_all: bool,
}

impl NetworkList {
    /// Build the list from configuration entries.
    ///
    /// Entries that fail to parse are skipped with a warning. A bare address
    /// is accepted as a single-host network. An empty configuration means
    /// "allow every client"; a non-empty configuration where nothing parsed
    /// denies every client.
    pub fn parse(entries: &[String]) -> Self {
        let mut networks = Vec::with_capacity(entries.len());

        for entry in entries {
            let entry = entry.trim();
            if let Ok(net) = entry.parse::<IpNet>() {
                networks.push(net);
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                networks.push(IpNet::from(ip));
            } else {
                warn!(network = %entry, "Ignoring invalid network in allowed_networks");
            }
        }

        Self {
            networks,
            allow_all: entries.is_empty(),
        }
    }

    pub fn allows_everyone(&self) -> bool {
        self.allow_all
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }

    /// Check whether a textual client address falls inside any range.
    /// Unparseable addresses are denied.
    pub fn contains(&self, addr: &str) -> bool {
        if self.allow_all {
            return true;
        }

        let Some(ip) = parse_client_ip(addr) else {
            warn!(address = %addr, "Could not parse client address");
            return false;
        };

        self.networks.iter().any(|net| net.contains(&ip))
    }
}

impl fmt::Display for NetworkList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.allow_all {
            return f.write_str("any");
        }

        let joined = self
            .networks
            .iter()
            .map(|net| net.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        f.write_str(&joined)
    }
}
