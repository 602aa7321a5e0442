use hyper::StatusCode;
use thiserror::Error;

/// Per-request failures of the dispatch engine.
///
/// None of these is fatal to the server; each one ends a single request.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Access denied - IP {ip} not in allowed networks ({networks})")]
    AccessDenied { ip: String, networks: String },

    #[error("Proxy authentication required")]
    AuthRequired,

    #[error("failed to connect to {target}: {reason}")]
    UpstreamUnreachable { target: String, reason: String },

    #[error("upstream request failed: {0}")]
    UpstreamProtocol(String),

    #[error("connection upgrade failed: {0}")]
    HijackUnsupported(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            ProxyError::AuthRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::UpstreamUnreachable { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamProtocol(_) | ProxyError::HijackUnsupported(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let denied = ProxyError::AccessDenied {
            ip: "10.0.0.5".to_string(),
            networks: "127.0.0.1/32".to_string(),
        };
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            denied.to_string(),
            "Access denied - IP 10.0.0.5 not in allowed networks (127.0.0.1/32)"
        );
        assert_eq!(ProxyError::AuthRequired.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            ProxyError::UpstreamUnreachable {
                target: "example.com:443".to_string(),
                reason: "timed out".to_string(),
            }
            .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::UpstreamProtocol("reset".to_string()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
