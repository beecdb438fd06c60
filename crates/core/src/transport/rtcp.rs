//! RTCP Sender Reports (RFC 3550 §6.4.1).
//!
//! ```text
//!         0                   1                   2                   3
//!         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! header |V=2|P|   RC    |   PT=SR=200   |             length            |
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |                         SSRC of sender                        |
//!        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! sender |              NTP timestamp, most significant word             |
//! info   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |             NTP timestamp, least significant word             |
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |                         RTP timestamp                         |
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |                     sender's packet count                     |
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |                      sender's octet count                     |
//!        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! ```
//!
//! No report blocks are sent: this side only transmits media.

use std::io;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::Destination;

/// Size of a sender report without report blocks.
pub const SENDER_REPORT_LEN: usize = 28;

/// Default interval between two sender reports.
pub const DEFAULT_RTCP_INTERVAL: Duration = Duration::from_millis(3000);

const RTCP_PT_SR: u8 = 200;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 0x83AA_7E80;

/// 64-bit NTP timestamp: 32 bits of seconds, 32 bits of fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl From<SystemTime> for NtpTimestamp {
    fn from(value: SystemTime) -> Self {
        let since_epoch = value.duration_since(UNIX_EPOCH).unwrap_or_default();
        let seconds = since_epoch.as_secs() + NTP_UNIX_OFFSET;
        let fraction = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }
}

impl From<NtpTimestamp> for u64 {
    fn from(value: NtpTimestamp) -> Self {
        ((value.seconds as u64) << 32) | value.fraction as u64
    }
}

/// Serialize a sender report with no report blocks.
pub fn build_sender_report(
    ssrc: u32,
    ntp: NtpTimestamp,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
) -> [u8; SENDER_REPORT_LEN] {
    let mut buf = [0u8; SENDER_REPORT_LEN];
    buf[0] = 2 << 6;
    buf[1] = RTCP_PT_SR;
    // Length in 32-bit words minus one.
    buf[2..4].copy_from_slice(&((SENDER_REPORT_LEN / 4 - 1) as u16).to_be_bytes());
    buf[4..8].copy_from_slice(&ssrc.to_be_bytes());
    buf[8..12].copy_from_slice(&ntp.seconds.to_be_bytes());
    buf[12..16].copy_from_slice(&ntp.fraction.to_be_bytes());
    buf[16..20].copy_from_slice(&rtp_timestamp.to_be_bytes());
    buf[20..24].copy_from_slice(&packet_count.to_be_bytes());
    buf[24..28].copy_from_slice(&octet_count.to_be_bytes());
    buf
}

/// Periodic sender-report emitter tied to one RTP transport.
///
/// The owning transport calls [`update`](Self::update) once per RTP packet
/// it puts on the wire. Reports go to the RTCP port next to the RTP
/// destination (UDP) or to the RTP channel + 1 (TCP interleaved).
#[derive(Debug)]
pub struct RtcpReporter {
    socket: Arc<UdpSocket>,
    destination: Destination,
    ssrc: u32,
    interval: Duration,
    packet_count: u32,
    octet_count: u32,
    last_report: Option<Instant>,
}

impl RtcpReporter {
    pub fn new(socket: Arc<UdpSocket>, ssrc: u32) -> Self {
        Self {
            socket,
            destination: Destination::Unset,
            ssrc,
            interval: DEFAULT_RTCP_INTERVAL,
            packet_count: 0,
            octet_count: 0,
            last_report: None,
        }
    }

    /// Zero disables reporting.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
    }

    /// Route reports. The destination given is the RTCP one: the RTCP port
    /// for UDP, the RTCP channel for interleaved output.
    pub(crate) fn set_destination(&mut self, destination: Destination) {
        self.destination = destination;
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn octet_count(&self) -> u32 {
        self.octet_count
    }

    /// Account for one transmitted RTP packet carrying `payload_len` bytes
    /// and send a report if the interval has elapsed.
    pub fn update(&mut self, payload_len: usize, rtp_timestamp: u32) -> io::Result<()> {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len as u32);

        if self.interval.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        let last = *self.last_report.get_or_insert(now);
        if now.duration_since(last) >= self.interval {
            self.last_report = Some(now);
            self.send_report(rtp_timestamp)?;
        }
        Ok(())
    }

    fn send_report(&self, rtp_timestamp: u32) -> io::Result<()> {
        let report = build_sender_report(
            self.ssrc,
            NtpTimestamp::from(SystemTime::now()),
            rtp_timestamp,
            self.packet_count,
            self.octet_count,
        );

        match &self.destination {
            Destination::Unset => Ok(()),
            Destination::Udp(addr) => {
                // Best-effort like RTP over UDP.
                if let Err(e) = self.socket.send_to(&report, addr) {
                    tracing::warn!(error = %e, %addr, "RTCP send failed");
                }
                Ok(())
            }
            Destination::Interleaved { writer, channel } => writer.write_frame(*channel, &report),
        }?;

        tracing::trace!(
            ssrc = format_args!("{:#010X}", self.ssrc),
            packets = self.packet_count,
            octets = self.octet_count,
            rtp_timestamp,
            "RTCP sender report"
        );
        Ok(())
    }

    /// Zero the counters. The socket is kept.
    pub fn reset(&mut self) {
        self.packet_count = 0;
        self.octet_count = 0;
        self.last_report = None;
    }
}
