//! AMR-NB packetizer, RFC 3267 octet-aligned mode.
//!
//! Input is the AMR storage format: a `#!AMR\n` magic followed by frames of
//! one header byte `[P|FT(4)|Q|P|P]` and a payload whose size depends on the
//! frame type. Each frame becomes one RTP packet:
//!
//! ```text
//! +------+--------------+-----------------+
//! | CMR  | ToC          | speech bits ... |
//! | 0xF0 | frame header |                 |
//! +------+--------------+-----------------+
//! ```

use std::io;

use super::source::{MediaSource, read_exact};
use super::{Packetizer, send_payload};
use crate::error::Result;
use crate::transport::RtpTransport;

pub const AMR_CLOCK_RATE: u32 = 8000;

/// Samples per 20 ms frame at 8 kHz.
pub const SAMPLES_PER_FRAME: u32 = 160;

const MAGIC: &[u8; 6] = b"#!AMR\n";

/// Codec mode request: no mode requested.
const CMR_NONE: u8 = 0xF0;

/// Speech bits per frame type 0..=8 (4.75 to 12.2 kbit/s, then SID).
const FRAME_BITS: [usize; 9] = [95, 103, 118, 134, 148, 159, 204, 244, 39];

const FRAME_TYPE_NO_DATA: u8 = 15;

/// Payload bytes following the frame header, `None` for reserved types.
pub fn frame_size(frame_type: u8) -> Option<usize> {
    match frame_type {
        0..=8 => Some(FRAME_BITS[frame_type as usize].div_ceil(8)),
        FRAME_TYPE_NO_DATA => Some(0),
        _ => None,
    }
}

#[derive(Debug)]
pub struct AmrPacketizer {
    timestamp: u32,
}

impl AmrPacketizer {
    pub fn new() -> Self {
        Self {
            timestamp: rand::random::<u32>(),
        }
    }
}

impl Default for AmrPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Packetizer for AmrPacketizer {
    fn codec_name(&self) -> &'static str {
        "AMR"
    }

    fn clock_rate(&self) -> u32 {
        AMR_CLOCK_RATE
    }

    fn run(&mut self, source: &mut dyn MediaSource, transport: &RtpTransport) -> Result<()> {
        let mut magic = [0u8; MAGIC.len()];
        match read_exact(source, &mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if &magic != MAGIC {
            tracing::warn!(header = ?magic, "missing #!AMR header, stream may be misaligned");
        }

        let mut frame = [0u8; 32];
        loop {
            let mut toc = [0u8; 1];
            match read_exact(source, &mut toc) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let frame_type = (toc[0] >> 3) & 0x0F;
            let Some(size) = frame_size(frame_type) else {
                tracing::warn!(frame_type, "reserved AMR frame type, skipping byte");
                continue;
            };

            match read_exact(source, &mut frame[..size]) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(frame_type, "stream ended inside an AMR frame");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            send_payload(transport, &[&[CMR_NONE, toc[0]], &frame[..size]], self.timestamp, true)?;
            self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::source::ReaderSource;
    use crate::media::testing::{assert_consecutive, capture_transport, drain};
    use std::io::Cursor;

    fn toc(frame_type: u8) -> u8 {
        (frame_type << 3) | 0x04
    }

    #[test]
    fn frame_sizes_from_bit_table() {
        assert_eq!(frame_size(7), Some(31));
        assert_eq!(frame_size(0), Some(12));
        assert_eq!(frame_size(8), Some(5));
        assert_eq!(frame_size(15), Some(0));
        assert_eq!(frame_size(12), None);
    }

    #[test]
    fn one_packet_per_frame() {
        let mut stream = MAGIC.to_vec();
        for frame_type in [7u8, 7, 0, 15] {
            stream.push(toc(frame_type));
            stream.extend(std::iter::repeat_n(frame_type, frame_size(frame_type).unwrap()));
        }

        let (transport, capture) = capture_transport(1400);
        transport.set_clock_rate(AMR_CLOCK_RATE);
        let mut source = ReaderSource::new(Cursor::new(stream));
        AmrPacketizer::new().run(&mut source, &transport).unwrap();
        drain(&transport);

        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 4);
        assert_consecutive(&packets);
        let sizes: Vec<usize> = packets.iter().map(|(_, p)| p.len()).collect();
        assert_eq!(sizes, vec![33, 33, 14, 2]);
        for (_, payload) in &packets {
            assert_eq!(payload[0], 0xF0);
        }
        assert_eq!(packets[2].1[1], toc(0));
        let ts: Vec<u32> = packets.iter().map(|(i, _)| i.timestamp).collect();
        assert!(ts.windows(2).all(|w| w[1].wrapping_sub(w[0]) == 160));
    }

    /// Fails every other read with `Interrupted`.
    struct Interrupting {
        inner: ReaderSource<Cursor<Vec<u8>>>,
        interrupt: bool,
    }

    impl MediaSource for Interrupting {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::ErrorKind::Interrupted.into());
            }
            self.inner.read(buf)
        }

        fn closer(&self) -> crate::media::SourceCloser {
            self.inner.closer()
        }
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let mut stream = MAGIC.to_vec();
        for _ in 0..3 {
            stream.push(toc(8));
            stream.extend_from_slice(&[9; 5]);
        }

        let (transport, capture) = capture_transport(1400);
        let mut source = Interrupting {
            inner: ReaderSource::new(Cursor::new(stream)),
            interrupt: false,
        };
        AmrPacketizer::new().run(&mut source, &transport).unwrap();
        drain(&transport);

        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|(_, p)| p[1] == toc(8)));
    }

    #[test]
    fn reserved_frame_type_is_skipped() {
        let mut stream = MAGIC.to_vec();
        stream.push(toc(12));
        stream.push(toc(8));
        stream.extend_from_slice(&[1, 2, 3, 4, 5]);

        let (transport, capture) = capture_transport(1400);
        let mut source = ReaderSource::new(Cursor::new(stream));
        AmrPacketizer::new().run(&mut source, &transport).unwrap();
        drain(&transport);

        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].1, vec![0xF0, toc(8), 1, 2, 3, 4, 5]);
    }
}
