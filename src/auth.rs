use std::collections::HashSet;
use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::{HeaderMap, HeaderValue, header};
use parking_lot::Mutex;
use tracing::{debug, info};

pub const AUTH_REALM: &str = "Basic realm=\"Home Server\"";
pub const ACCESS_DENIED: &str = "401 Access denied";

/// Optional HTTP basic authentication. Once a client address has presented valid
/// credentials it is remembered for the lifetime of the server instance.
#[derive(Debug, Default)]
pub struct Authenticator {
    credentials: Option<String>,
    authenticated: Mutex<HashSet<IpAddr>>,
}

impl Authenticator {
    /// `credentials` is `user:password`; `None` lets every request through.
    pub fn new(credentials: Option<String>) -> Self {
        Self {
            credentials: credentials.filter(|value| !value.is_empty()),
            authenticated: Mutex::new(HashSet::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn check(&self, peer: IpAddr, headers: &HeaderMap) -> bool {
        let Some(expected) = self.credentials.as_deref() else {
            return true;
        };
        if self.authenticated.lock().contains(&peer) {
            return true;
        }

        let Some(presented) = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(decode_basic)
        else {
            debug!(peer = %peer, "request without usable basic credentials");
            return false;
        };
        let user = presented.split_once(':').map(|(user, _)| user).unwrap_or("");
        if presented != expected {
            info!(peer = %peer, user, "rejected basic credentials");
            return false;
        }

        info!(peer = %peer, user, "client authenticated");
        self.authenticated.lock().insert(peer);
        true
    }

    pub fn challenge() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(AUTH_REALM),
        );
        headers
    }
}

fn decode_basic(value: &str) -> Option<String> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(credentials: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode(credentials));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&value).expect("header"),
        );
        headers
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn disabled_authenticator_allows_everything() {
        let auth = Authenticator::new(None);
        assert!(!auth.enabled());
        assert!(auth.check(ip(1), &HeaderMap::new()));
    }

    #[test]
    fn valid_credentials_remember_the_address() {
        let auth = Authenticator::new(Some("alice:secret".into()));
        assert!(!auth.check(ip(1), &HeaderMap::new()));
        assert!(auth.check(ip(1), &basic("alice:secret")));
        assert!(auth.check(ip(1), &HeaderMap::new()));
        assert!(!auth.check(ip(2), &HeaderMap::new()));
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        let auth = Authenticator::new(Some("alice:secret".into()));
        assert!(!auth.check(ip(3), &basic("alice:guess")));
        assert!(!auth.check(ip(3), &basic("alice")));

        let mut bearer = HeaderMap::new();
        bearer.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        assert!(!auth.check(ip(3), &bearer));
    }
}
