use std::fmt::Write as _;

use crate::error::{ParseErrorKind, Result, RtspError};

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
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = concat!("rtsp-stream/", env!("CARGO_PKG_VERSION"));

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK: success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 455 Method Not Valid In This State.
    pub fn invalid_state() -> Self {
        Self::new(455, "Method Not Valid in This State")
    }

    /// 500 Internal Server Error.
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    /// Response matching a failed operation, see [`RtspError::status`].
    pub fn from_error(error: &RtspError) -> Self {
        let (code, text) = error.status();
        Self::new(code, text)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        super::find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Parse a response head (status line and headers). The body is read
    /// separately by [`read_message`](super::read_message).
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();
        let status_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(RtspError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let mut parts = status_line.splitn(3, ' ');
        let invalid = || RtspError::Parse {
            kind: ParseErrorKind::InvalidStatusLine,
        };
        let version = parts.next().ok_or_else(invalid)?;
        if !version.starts_with("RTSP/") {
            return Err(invalid());
        }
        let status_code = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(invalid)?;
        let status_text = parts.next().unwrap_or("").trim().to_string();

        Ok(Self {
            status_code,
            status_text,
            headers: super::parse_headers(lines)?,
            body: None,
        })
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            let _ = write!(response, "{name}: {value}\r\n");
        }

        if let Some(body) = &self.body {
            let _ = write!(response, "Content-Length: {}\r\n", body.len());
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
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
        let s = resp.serialize();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains(&format!("Server: {SERVER_AGENT}\r\n")));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string());
        let s = resp.serialize();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("v=0\r\n"));
    }

    #[test]
    fn error_statuses() {
        let resp = RtspResponse::from_error(&RtspError::TrackNotFound(3));
        assert_eq!(resp.status_code, 404);
        assert!(resp.serialize().starts_with("RTSP/1.0 404 Not Found\r\n"));
    }

    #[test]
    fn parse_unauthorized() {
        let raw = "RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\n\
                   WWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n\r\n";
        let resp = RtspResponse::parse(raw).unwrap();
        assert_eq!(resp.status_code, 401);
        assert_eq!(resp.status_text, "Unauthorized");
        assert!(!resp.is_success());
        assert_eq!(
            resp.get_header("www-authenticate"),
            Some("Digest realm=\"r\", nonce=\"n\"")
        );
    }

    #[test]
    fn parse_rejects_garbage_status_line() {
        assert!(RtspResponse::parse("HTTP/1.1 two hundred\r\n\r\n").is_err());
        assert!(RtspResponse::parse("RTSP/1.0 abc OK\r\n\r\n").is_err());
    }
}
