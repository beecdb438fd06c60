//! H.263+ packetizer, RFC 4629.
//!
//! Every packet starts with a 2-byte payload header:
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   RR    |P|V|   PLEN    |PEBIT|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Only P is used. It is set on the packet that begins a picture, whose two
//! leading zero bytes of the picture start code are then left out.

use super::source::MediaSource;
use super::{Packetizer, send_payload};
use crate::error::Result;
use crate::transport::RtpTransport;

pub const H263_CLOCK_RATE: u32 = 90_000;

const HEADER_LEN: usize = 2;
const P_BIT: u8 = 0x04;
const READ_CHUNK: usize = 16 * 1024;

/// Picture start code: 22 bits `0000 0000 0000 0000 1000 00`.
fn is_psc(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == 0 && data[1] == 0 && data[2] & 0xFC == 0x80
}

/// First picture start code at a position in `from..=limit`.
fn find_psc(data: &[u8], from: usize, limit: usize) -> Option<usize> {
    (from..=limit).find(|&p| is_psc(&data[p.min(data.len())..]))
}

#[derive(Debug)]
pub struct H263Packetizer {
    frame_interval: u32,
    timestamp: u32,
}

impl H263Packetizer {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_interval: H263_CLOCK_RATE / frame_rate.max(1),
            timestamp: rand::random::<u32>(),
        }
    }
}

impl Packetizer for H263Packetizer {
    fn codec_name(&self) -> &'static str {
        "H263"
    }

    fn clock_rate(&self) -> u32 {
        H263_CLOCK_RATE
    }

    fn run(&mut self, source: &mut dyn MediaSource, transport: &RtpTransport) -> Result<()> {
        let limit = transport.max_payload() - HEADER_LEN;
        let mut pending: Vec<u8> = Vec::with_capacity(2 * limit);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut eof = false;
        let mut first_picture = true;

        loop {
            // Enough lookahead to see a start code straddling the limit.
            while !eof && pending.len() < limit + 3 {
                let n = source.read(&mut chunk)?;
                if n == 0 {
                    eof = true;
                } else {
                    pending.extend_from_slice(&chunk[..n]);
                }
            }
            if pending.is_empty() {
                return Ok(());
            }

            let picture_start = is_psc(&pending);
            if picture_start {
                if !first_picture {
                    self.timestamp = self.timestamp.wrapping_add(self.frame_interval);
                }
                first_picture = false;
            }

            let (len, end_of_picture) = match find_psc(&pending, 1, limit) {
                Some(at) => (at, true),
                None => {
                    let len = pending.len().min(limit);
                    (len, eof && len == pending.len())
                }
            };

            let data = &pending[..len];
            if picture_start {
                send_payload(transport, &[&[P_BIT, 0], &data[2..]], self.timestamp, end_of_picture)?;
            } else {
                send_payload(transport, &[&[0, 0], data], self.timestamp, end_of_picture)?;
            }
            pending.drain(..len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::source::ReaderSource;
    use crate::media::testing::{assert_consecutive, capture_transport, drain};
    use std::io::Cursor;

    fn picture(len: usize, seed: u8) -> Vec<u8> {
        let mut data = vec![0x00, 0x00, 0x80, 0x02];
        // Body bytes are never zero so no start code shows up by accident.
        data.extend((4..len).map(|i| (i as u8 ^ seed) | 0x01));
        data
    }

    fn packetize(stream: Vec<u8>, max_payload: usize) -> Vec<(crate::media::rtp::RtpPacketInfo, Vec<u8>)> {
        let (transport, capture) = capture_transport(max_payload);
        let mut source = ReaderSource::new(Cursor::new(stream));
        H263Packetizer::new(100).run(&mut source, &transport).unwrap();
        drain(&transport);
        capture.rtp_packets()
    }

    #[test]
    fn detects_picture_start_code() {
        assert!(is_psc(&[0, 0, 0x80]));
        assert!(is_psc(&[0, 0, 0x83, 0xFF]));
        assert!(!is_psc(&[0, 0, 0x7F]));
        assert!(!is_psc(&[0, 0]));
    }

    #[test]
    fn small_pictures_one_packet_each() {
        let a = picture(500, 0x10);
        let b = picture(300, 0x20);
        let packets = packetize([a.clone(), b.clone()].concat(), 1400);

        assert_eq!(packets.len(), 2);
        assert_consecutive(&packets);
        for ((info, payload), pic) in packets.iter().zip([&a, &b]) {
            assert_eq!(&payload[..2], &[P_BIT, 0]);
            assert_eq!(&payload[2..], &pic[2..]);
            assert!(info.marker);
        }
        assert_eq!(packets[1].0.timestamp.wrapping_sub(packets[0].0.timestamp), 900);
    }

    #[test]
    fn large_picture_is_split_with_interior_fragments() {
        let pic = picture(3000, 0x33);
        let next = picture(100, 0x44);
        let packets = packetize([pic.clone(), next].concat(), 1000);

        // 3000 bytes at 998 per packet, then the next picture.
        assert_eq!(packets.len(), 5);
        assert_consecutive(&packets);
        let markers: Vec<bool> = packets.iter().map(|(i, _)| i.marker).collect();
        assert_eq!(markers, vec![false, false, false, true, true]);
        assert_eq!(packets[0].1[0], P_BIT);
        assert!(packets[1..4].iter().all(|(_, p)| p[0] == 0));

        let mut rebuilt = vec![0, 0];
        for (_, payload) in &packets[..4] {
            rebuilt.extend_from_slice(&payload[2..]);
        }
        assert_eq!(rebuilt, pic);
        assert!(packets[..4].iter().all(|(i, _)| i.timestamp == packets[0].0.timestamp));
    }
}
