use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::error::Result;

const PAIR_BIND_ATTEMPTS: usize = 16;

/// RTP/RTCP socket pair for one track.
///
/// Per RFC 3550 §11 the RTP port should be even and RTCP should use the
/// next odd port. Binding tries a few ephemeral ports to get such a pair
/// and falls back to two unrelated ports when none is found.
#[derive(Debug, Clone)]
pub struct UdpPair {
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
}

impl UdpPair {
    pub fn bind() -> Result<Self> {
        for _ in 0..PAIR_BIND_ATTEMPTS {
            let rtp = UdpSocket::bind("0.0.0.0:0")?;
            let port = rtp.local_addr()?.port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            if let Ok(rtcp) = UdpSocket::bind(("0.0.0.0", port + 1)) {
                tracing::trace!(rtp_port = port, rtcp_port = port + 1, "bound UDP pair");
                return Ok(Self {
                    rtp: Arc::new(rtp),
                    rtcp: Arc::new(rtcp),
                });
            }
        }

        let rtp = UdpSocket::bind("0.0.0.0:0")?;
        let rtcp = UdpSocket::bind("0.0.0.0:0")?;
        tracing::debug!("no consecutive UDP port pair available, using unrelated ports");
        Ok(Self {
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
        })
    }

    /// Local (RTP, RTCP) ports.
    pub fn local_ports(&self) -> (u16, u16) {
        let port = |s: &UdpSocket| s.local_addr().map(|a| a.port()).unwrap_or(0);
        (port(&self.rtp), port(&self.rtcp))
    }

    /// Apply a TTL to both sockets, covering unicast and multicast
    /// destinations alike.
    pub fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        for socket in [&self.rtp, &self.rtcp] {
            socket.set_ttl(ttl)?;
            socket.set_multicast_ttl_v4(ttl)?;
        }
        Ok(())
    }

    pub fn send_rtp(&self, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.rtp.send_to(payload, addr)
    }

    pub fn rtcp_socket(&self) -> Arc<UdpSocket> {
        self.rtcp.clone()
    }
}
