//! Network transport layer for RTSP signaling and RTP/RTCP media delivery.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. One TCP
//!   connection per client, with a thread per connection. The same
//!   connection can also carry media using `$` interleaved framing
//!   (RFC 2326 §10.12) through an [`InterleavedWriter`].
//!
//! - **UDP** ([`udp`]): carries RTP and RTCP packets over a per-track
//!   socket pair.
//!
//! [`rtp::RtpTransport`] paces packets produced by a packetizer onto one of
//! those outputs and feeds [`rtcp::RtcpReporter`].

pub mod rtcp;
pub mod rtp;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

pub use rtcp::RtcpReporter;
pub use rtp::{RtpBuffer, RtpTransport, TransportConfig};
pub use tcp::InterleavedWriter;
pub use udp::UdpPair;

/// Where a transport currently sends its packets.
#[derive(Clone, Default)]
pub(crate) enum Destination {
    #[default]
    Unset,
    Udp(SocketAddr),
    Interleaved {
        writer: InterleavedWriter,
        channel: u8,
    },
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "Unset"),
            Self::Udp(addr) => write!(f, "Udp({addr})"),
            Self::Interleaved { channel, .. } => write!(f, "Interleaved({channel})"),
        }
    }
}

/// Hostname resolution collaborator.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str) -> io::Result<IpAddr>;
}

/// Resolves through the operating system (`ToSocketAddrs`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        (host, 0)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .find(IpAddr::is_ipv4)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_address() {
        let ip = SystemResolver.resolve("127.0.0.1").unwrap();
        assert_eq!(ip, IpAddr::from([127, 0, 0, 1]));
    }

    #[test]
    fn resolves_localhost() {
        let ip = SystemResolver.resolve("localhost").unwrap();
        assert!(ip.is_loopback());
    }
}
