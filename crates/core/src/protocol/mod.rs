//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: parsing
//! requests and responses, routing server methods, negotiating transports,
//! authenticating, and generating SDP.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - Different methods: OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN,
//!   and ANNOUNCE/RECORD for the push role.
//! - Session header carries a server-assigned ID (RFC 2326 §12.37).
//! - RTP may be interleaved on the same connection as `$`-framed binary
//!   packets (RFC 2326 §10.12).
//!
//! ## Supported server methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport (UDP ports or interleaved channels) |
//! | PLAY | §10.5 | Start media delivery |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keepalive / parameter query |

pub mod auth;
pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;
pub mod transport;
pub mod uri;

use std::io::{BufRead, Read};

use crate::error::{ParseErrorKind, Result, RtspError};

pub use handler::MethodHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;
pub use transport::TransportHeader;

/// Upper bound on the head of one message.
const MAX_HEAD_LEN: usize = 64 * 1024;
/// Upper bound on a message body.
const MAX_BODY_LEN: usize = 1024 * 1024;

/// One RTSP message read off a connection: the head (start line and headers)
/// and the body announced by `Content-Length`.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub head: String,
    pub body: String,
}

/// Read the next RTSP message from `reader`.
///
/// Interleaved `$` frames and stray line breaks between messages are
/// skipped. Returns `Ok(None)` on a clean end of stream.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<RawMessage>> {
    loop {
        let first = match reader.fill_buf()? {
            [] => return Ok(None),
            buf => buf[0],
        };
        match first {
            b'$' => skip_interleaved_frame(reader)?,
            b'\r' | b'\n' => reader.consume(1),
            _ => break,
        }
    }

    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(RtspError::Connectivity(
                "connection closed mid-message".into(),
            ));
        }
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
        head.push_str(&line);
        if head.len() > MAX_HEAD_LEN {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            });
        }
    }

    let length = content_length(&head)?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    Ok(Some(RawMessage {
        head,
        body: String::from_utf8_lossy(&body).into_owned(),
    }))
}

fn skip_interleaved_frame<R: BufRead>(reader: &mut R) -> Result<()> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u16::from_be_bytes([header[2], header[3]]) as u64;
    let skipped = std::io::copy(&mut reader.by_ref().take(len), &mut std::io::sink())?;
    if skipped < len {
        return Err(RtspError::Connectivity(
            "connection closed inside interleaved frame".into(),
        ));
    }
    tracing::trace!(channel = header[1], len, "skipped interleaved frame");
    Ok(())
}

fn content_length(head: &str) -> Result<usize> {
    let invalid = || RtspError::Parse {
        kind: ParseErrorKind::InvalidContentLength,
    };
    let Some(value) = head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("Content-Length")
            .then(|| value.trim())
    }) else {
        return Ok(0);
    };
    let length: usize = value.parse().map_err(|_| invalid())?;
    if length > MAX_BODY_LEN {
        return Err(invalid());
    }
    Ok(length)
}

/// Parse `Name: value` header lines up to the first blank line.
pub(crate) fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(RtspError::Parse {
            kind: ParseErrorKind::InvalidHeader,
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
