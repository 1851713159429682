//! RTSP Basic/Digest authentication and IP allow-list checks (RFC 2326 §4.2,
//! RFC 2617).
//!
//! Mirrors, server-side, the digest-response computation found in
//! `binbat-live777`'s RTSP client (`generate_digest_response`): there the
//! client *produces* `response = MD5(MD5(user:realm:pass):nonce:MD5(method:uri))`
//! to answer a challenge; here the server *recomputes* the same value from
//! its configured credentials and compares.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use std::net::IpAddr;

use crate::config::PathConf;

/// Realm advertised in `WWW-Authenticate` challenges.
pub const REALM: &str = "rtsp-rs";

/// Outcome of checking a request's `Authorization` header against a path's
/// configured credentials.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthResult {
    /// No credentials configured for this operation — anything is allowed.
    NotRequired,
    Granted,
    /// No `Authorization` header was given; answer 401 with a fresh nonce.
    MissingCredentials,
    /// An `Authorization` header was given but didn't check out.
    Denied,
}

/// Check `user`/`pass` (if configured on `conf`) against the client's
/// `Authorization` header.
///
/// `nonce` is whatever the session last issued in a `WWW-Authenticate:
/// Digest` challenge (or a fresh one on first contact) — digest responses
/// are only meaningful against a nonce the server itself generated.
pub fn check_credentials(
    configured_user: Option<&str>,
    configured_pass: Option<&str>,
    authorization: Option<&str>,
    method: &str,
    uri: &str,
    nonce: &str,
) -> AuthResult {
    let (Some(user), Some(pass)) = (configured_user, configured_pass) else {
        return AuthResult::NotRequired;
    };

    let Some(header) = authorization else {
        return AuthResult::MissingCredentials;
    };

    if let Some(basic) = header.strip_prefix("Basic ") {
        return match BASE64_STANDARD.decode(basic.trim()) {
            Ok(decoded) => {
                let expected = format!("{user}:{pass}");
                if decoded == expected.as_bytes() {
                    AuthResult::Granted
                } else {
                    AuthResult::Denied
                }
            }
            Err(_) => AuthResult::Denied,
        };
    }

    if let Some(digest) = header.strip_prefix("Digest ") {
        let params = parse_digest_params(digest);
        let Some(response) = params.get("response") else {
            return AuthResult::Denied;
        };
        let expected = digest_response(user, pass, REALM, nonce, method, uri);
        return if *response == expected {
            AuthResult::Granted
        } else {
            AuthResult::Denied
        };
    }

    AuthResult::Denied
}

/// Check a remote IP against a path's allow-list (empty list = unrestricted).
pub fn check_ip_allowed(allow_list: &[crate::config::IpOrNet], addr: IpAddr) -> bool {
    allow_list.is_empty() || allow_list.iter().any(|net| net.contains(addr))
}

/// Resolve the (user, pass, ip-allow-list) triple for a publish or read
/// operation against a path's policy.
pub fn credentials_for<'a>(conf: &'a PathConf, publish: bool) -> (Option<&'a str>, Option<&'a str>, &'a [crate::config::IpOrNet]) {
    if publish {
        (
            conf.publish_user.as_deref(),
            conf.publish_pass.as_deref(),
            &conf.publish_ips,
        )
    } else {
        (
            conf.read_user.as_deref(),
            conf.read_pass.as_deref(),
            &conf.read_ips,
        )
    }
}

fn digest_response(user: &str, pass: &str, realm: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{user}:{realm}:{pass}")));
    let ha2 = format!("{:x}", md5::compute(format!("{method}:{uri}")));
    format!("{:x}", md5::compute(format!("{ha1}:{nonce}:{ha2}")))
}

fn parse_digest_params(raw: &str) -> std::collections::HashMap<String, String> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (key, value) = part.split_once('=')?;
            Some((key.trim().to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_credentials_configured_is_not_required() {
        let result = check_credentials(None, None, None, "ANNOUNCE", "rtsp://x/cam", "n");
        assert_eq!(result, AuthResult::NotRequired);
    }

    #[test]
    fn missing_header_when_required() {
        let result = check_credentials(Some("bob"), Some("secret1"), None, "ANNOUNCE", "rtsp://x/cam", "n");
        assert_eq!(result, AuthResult::MissingCredentials);
    }

    #[test]
    fn basic_auth_accepts_correct_credentials() {
        let header = format!("Basic {}", BASE64_STANDARD.encode("bob:secret1"));
        let result = check_credentials(
            Some("bob"),
            Some("secret1"),
            Some(&header),
            "ANNOUNCE",
            "rtsp://x/cam",
            "n",
        );
        assert_eq!(result, AuthResult::Granted);
    }

    #[test]
    fn basic_auth_rejects_wrong_password() {
        let header = format!("Basic {}", BASE64_STANDARD.encode("bob:wrong"));
        let result = check_credentials(
            Some("bob"),
            Some("secret1"),
            Some(&header),
            "ANNOUNCE",
            "rtsp://x/cam",
            "n",
        );
        assert_eq!(result, AuthResult::Denied);
    }

    #[test]
    fn digest_auth_round_trip() {
        let expected = digest_response("bob", "secret1", REALM, "abc123", "ANNOUNCE", "rtsp://x/cam");
        let header = format!(
            "Digest username=\"bob\", realm=\"{REALM}\", nonce=\"abc123\", uri=\"rtsp://x/cam\", response=\"{expected}\""
        );
        let result = check_credentials(
            Some("bob"),
            Some("secret1"),
            Some(&header),
            "ANNOUNCE",
            "rtsp://x/cam",
            "abc123",
        );
        assert_eq!(result, AuthResult::Granted);
    }

    #[test]
    fn ip_allow_list_empty_permits_all() {
        assert!(check_ip_allowed(&[], "10.0.0.1".parse().unwrap()));
    }
}
