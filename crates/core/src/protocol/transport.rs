use std::fmt;

use crate::error::{Result, RtspError};

/// Lower transport of an RTP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LowerTransport {
    #[default]
    Udp,
    /// Interleaved on the RTSP connection.
    Tcp,
}

/// RTSP `Transport` header (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// RTP/AVP;unicast;client_port=8000-8001
/// RTP/AVP/UDP;unicast;destination=10.0.0.2;client_port=8000-8001;server_port=5000-5001;ssrc=1A2B3C4D;mode=play
/// RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
///
/// Parameters this endpoint does not use are ignored on parse.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportHeader {
    pub lower: LowerTransport,
    pub multicast: bool,
    pub destination: Option<String>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub interleaved: Option<(u8, u8)>,
    pub ttl: Option<u32>,
    pub ssrc: Option<u32>,
    pub mode: Option<String>,
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// Only the first transport spec of a comma-separated list is used.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp_stream::protocol::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.client_port, Some((8000, 8001)));
    /// ```
    pub fn parse(value: &str) -> Result<Self> {
        let spec = value.split(',').next().unwrap_or(value);
        let mut params = spec.split(';').map(str::trim);

        let protocol = params.next().unwrap_or("");
        let lower = match protocol.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => LowerTransport::Udp,
            "RTP/AVP/TCP" => LowerTransport::Tcp,
            _ => {
                return Err(RtspError::Protocol(format!(
                    "unsupported transport protocol: {protocol}"
                )));
            }
        };

        let mut header = Self {
            lower,
            ..Self::default()
        };
        for param in params {
            let (key, val) = match param.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (param, None),
            };
            match (key.to_ascii_lowercase().as_str(), val) {
                ("unicast", _) => header.multicast = false,
                ("multicast", _) => header.multicast = true,
                ("destination", Some(v)) => header.destination = Some(v.to_string()),
                ("client_port", Some(v)) => header.client_port = Some(parse_range(v)?),
                ("server_port", Some(v)) => header.server_port = Some(parse_range(v)?),
                ("port", Some(v)) => header.client_port = Some(parse_range(v)?),
                ("interleaved", Some(v)) => {
                    let (a, b) = parse_range(v)?;
                    let channel = |c: u16| {
                        u8::try_from(c).map_err(|_| {
                            RtspError::Protocol(format!("interleaved channel out of range: {c}"))
                        })
                    };
                    header.interleaved = Some((channel(a)?, channel(b)?));
                }
                ("ttl", Some(v)) => header.ttl = v.parse().ok(),
                ("ssrc", Some(v)) => header.ssrc = u32::from_str_radix(v, 16).ok(),
                ("mode", Some(v)) => header.mode = Some(v.trim_matches('"').to_string()),
                _ => {}
            }
        }

        if header.lower == LowerTransport::Tcp && header.interleaved.is_none() {
            // RFC 2326 lets the server pick the channels.
            tracing::trace!("TCP transport without interleaved channels");
        }
        Ok(header)
    }
}

/// `a-b` port or channel range. A single value `a` means `a-(a+1)`.
fn parse_range(value: &str) -> Result<(u16, u16)> {
    let bad = || RtspError::Protocol(format!("invalid range: {value}"));
    match value.split_once('-') {
        Some((a, b)) => Ok((
            a.trim().parse().map_err(|_| bad())?,
            b.trim().parse().map_err(|_| bad())?,
        )),
        None => {
            let a: u16 = value.trim().parse().map_err(|_| bad())?;
            Ok((a, a.saturating_add(1)))
        }
    }
}

impl fmt::Display for TransportHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lower {
            LowerTransport::Udp => f.write_str("RTP/AVP/UDP")?,
            LowerTransport::Tcp => f.write_str("RTP/AVP/TCP")?,
        }
        f.write_str(if self.multicast { ";multicast" } else { ";unicast" })?;
        if let Some(destination) = &self.destination {
            write!(f, ";destination={destination}")?;
        }
        if let Some((a, b)) = self.client_port {
            write!(f, ";client_port={a}-{b}")?;
        }
        if let Some((a, b)) = self.server_port {
            write!(f, ";server_port={a}-{b}")?;
        }
        if let Some((a, b)) = self.interleaved {
            write!(f, ";interleaved={a}-{b}")?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, ";ttl={ttl}")?;
        }
        if let Some(ssrc) = self.ssrc {
            write!(f, ";ssrc={ssrc:08X}")?;
        }
        if let Some(mode) = &self.mode {
            write!(f, ";mode={mode}")?;
        }
        Ok(())
    }
}
