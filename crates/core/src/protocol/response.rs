/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern — chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present. The
/// body is bytes rather than `String` since DESCRIBE relays a publisher's
/// opaque SDP bytes verbatim rather than anything the server re-encodes.
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "rtsp-rs/0.1";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK — success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request — malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 401 Unauthorized — missing or incorrect publish/read credentials.
    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized")
    }

    /// 403 Forbidden — remote IP not in the configured allow-list.
    pub fn forbidden() -> Self {
        Self::new(403, "Forbidden")
    }

    /// 404 Not Found — the requested resource does not exist.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 454 Session Not Found — `Session` header names an unknown session.
    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 455 Method Not Valid In This State — request illegal from the
    /// session's current RTSP state.
    pub fn method_not_valid() -> Self {
        Self::new(455, "Method Not Valid In This State")
    }

    /// 459 Aggregate Operation Not Allowed.
    pub fn aggregate_not_allowed() -> Self {
        Self::new(459, "Aggregate Operation Not Allowed")
    }

    /// 461 Unsupported Transport — requested transport not in the server's
    /// configured protocol set.
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    /// 500 Internal Server Error.
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    /// 503 Service Unavailable — path already has a publisher, or the
    /// server is draining in-flight requests during shutdown.
    pub fn service_unavailable() -> Self {
        Self::new(503, "Service Unavailable")
    }

    /// 501 Not Implemented — unrecognized RTSP method.
    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parse a response's status line and headers from an upstream server
    /// (used by the puller, which is a client of the same wire protocol
    /// this type serializes). The body, if `Content-Length` is present,
    /// is read separately and attached with [`with_body`](Self::with_body).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();
        let status_line = lines.next().ok_or(crate::error::RtspError::Parse {
            kind: crate::error::ParseErrorKind::EmptyRequest,
        })?;
        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
        if parts.len() != 3 {
            return Err(crate::error::RtspError::Parse {
                kind: crate::error::ParseErrorKind::InvalidRequestLine,
            });
        }
        let status_code = parts[1]
            .trim()
            .parse::<u16>()
            .map_err(|_| crate::error::RtspError::Parse {
                kind: crate::error::ParseErrorKind::InvalidRequestLine,
            })?;
        let status_text = parts[2].trim().to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon_pos = line.find(':').ok_or(crate::error::RtspError::Parse {
                kind: crate::error::ParseErrorKind::InvalidHeader,
            })?;
            headers.push((
                line[..colon_pos].trim().to_string(),
                line[colon_pos + 1..].trim().to_string(),
            ));
        }

        Ok(RtspResponse {
            status_code,
            status_text,
            headers,
            body: None,
        })
    }

    /// Serialize to the RTSP wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> Vec<u8> {
        let mut head = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }

        let mut bytes = head.into_bytes();
        if let Some(body) = &self.body {
            bytes.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
            bytes.extend_from_slice(body);
        } else {
            bytes.extend_from_slice(b"\r\n");
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS");
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("Server: rtsp-rs/0.1\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS\r\n"));
        assert!(s.ends_with("\r\n"));
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body(b"v=0\r\n".to_vec());
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.contains("Server: rtsp-rs/0.1\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("v=0\r\n"));
    }

    #[test]
    fn not_found_response() {
        let resp = RtspResponse::not_found().add_header("CSeq", "5");
        assert_eq!(resp.status_code, 404);
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.starts_with("RTSP/1.0 404 Not Found\r\n"));
        assert!(s.contains("Server: rtsp-rs/0.1\r\n"));
    }

    #[test]
    fn parses_status_line_and_headers() {
        let raw = "RTSP/1.0 401 Unauthorized\r\nCSeq: 2\r\nWWW-Authenticate: Basic realm=\"x\"\r\n\r\n";
        let resp = RtspResponse::parse(raw).unwrap();
        assert_eq!(resp.status_code, 401);
        assert_eq!(resp.status_text, "Unauthorized");
        assert_eq!(resp.get_header("CSeq"), Some("2"));
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(RtspResponse::unauthorized().status_code, 401);
        assert_eq!(RtspResponse::forbidden().status_code, 403);
        assert_eq!(RtspResponse::session_not_found().status_code, 454);
        assert_eq!(RtspResponse::aggregate_not_allowed().status_code, 459);
    }
}
