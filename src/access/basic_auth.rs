//! `Proxy-Authorization: Basic` decoding and the 407 challenge.

use axum::body::Body;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hyper::header::{CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};

const BASIC_PREFIX: &str = "Basic ";

/// Decode a `Basic <base64>` header value into `(username, password)`.
///
/// Returns `None` for a wrong scheme, invalid base64, non-UTF-8 payloads
/// or a payload without the `:` separator.
pub fn decode_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix(BASIC_PREFIX)?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Build the `407 Proxy Authentication Required` challenge.
pub fn challenge(realm: &str) -> Response<Body> {
    let header = format!("Basic realm=\"{}\"", realm.replace('"', ""));
    Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .header(PROXY_AUTHENTICATE, header)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from("Proxy authentication required\n"))
        .unwrap_or_else(|_| {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
            resp
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(raw: &str) -> String {
        format!("Basic {}", STANDARD.encode(raw))
    }

    #[test]
    fn test_decode_valid() {
        assert_eq!(
            decode_basic(&encode("alice:secret")),
            Some(("alice".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_password_may_contain_colons() {
        assert_eq!(
            decode_basic(&encode("alice:a:b:c")),
            Some(("alice".to_string(), "a:b:c".to_string()))
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert_eq!(decode_basic("Bearer abc"), None);
        assert_eq!(decode_basic("basic YWxpY2U6c2VjcmV0"), None);
        assert_eq!(decode_basic("Basic !!!not-base64!!!"), None);
        assert_eq!(decode_basic(&encode("no-separator")), None);
        assert_eq!(decode_basic(""), None);
        assert_eq!(decode_basic(&format!("Basic {}", STANDARD.encode([0xff, 0xfe, b':']))), None);
    }

    #[test]
    fn test_challenge_response() {
        let resp = challenge("office");
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            resp.headers().get(PROXY_AUTHENTICATE).unwrap(),
            "Basic realm=\"office\""
        );
    }
}
