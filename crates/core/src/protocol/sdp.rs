//! SDP (Session Description Protocol) generation (RFC 4566).
//!
//! Produces the body of DESCRIBE responses and ANNOUNCE requests:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- <ts> <ts> IN IP4 <origin>                ← origin
//! s=Unnamed                                    ← session name
//! i=N/A                                        ← session information
//! c=IN IP4 <destination>                       ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=recvonly                                   ← direction
//! m=video 5006 RTP/AVP 96                      ← one block per track
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1;...
//! a=control:trackID=1
//! ```

use std::fmt;

use crate::media::rtp::DEFAULT_PAYLOAD_TYPE;

/// One `m=` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// `audio` or `video`.
    pub media: &'static str,
    pub port: u16,
    pub encoding: &'static str,
    pub clock_rate: u32,
    pub fmtp: Option<String>,
    pub track_id: usize,
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pt = DEFAULT_PAYLOAD_TYPE;
        write!(f, "m={} {} RTP/AVP {pt}\r\n", self.media, self.port)?;
        write!(f, "a=rtpmap:{pt} {}/{}\r\n", self.encoding, self.clock_rate)?;
        if let Some(fmtp) = &self.fmtp {
            write!(f, "a=fmtp:{pt} {fmtp}\r\n")?;
        }
        write!(f, "a=control:trackID={}\r\n", self.track_id)
    }
}

/// A complete session description.
#[derive(Debug, Clone)]
pub struct SessionDescription {
    /// Address in the `o=` line.
    pub origin: String,
    /// Session id and version in the `o=` line.
    pub timestamp: u64,
    /// Address in the `c=` line.
    pub destination: String,
    pub media: Vec<MediaDescription>,
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("v=0\r\n")?;
        write!(f, "o=- {ts} {ts} IN IP4 {}\r\n", self.origin, ts = self.timestamp)?;
        f.write_str("s=Unnamed\r\n")?;
        f.write_str("i=N/A\r\n")?;
        write!(f, "c=IN IP4 {}\r\n", self.destination)?;
        f.write_str("t=0 0\r\n")?;
        f.write_str("a=recvonly\r\n")?;
        for media in &self.media {
            write!(f, "{media}")?;
        }
        Ok(())
    }
}
