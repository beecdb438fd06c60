//! AAC packetizer, RFC 3640 `mpeg4-generic` in AAC-hbr mode.
//!
//! Every packet starts with a 16-bit AU-headers-length (always 16 bits: one
//! AU-header) followed by the AU-header itself:
//!
//! ```text
//! +---------------+---------------+-------------------------+-----------+
//! | AU-headers-len| AU-size (13b) | AU-Index (3b)           | AU data   |
//! |  0x00 0x10    |                                         |           |
//! +---------------+---------------+-------------------------+-----------+
//! ```
//!
//! An access unit larger than one payload is fragmented; every fragment
//! repeats the full AU-size and only the last one carries the marker bit.

use std::io;
use std::time::Duration;

use super::source::{MediaSource, read_exact};
use super::{Packetizer, media_time_to_rtp, send_payload};
use crate::error::Result;
use crate::transport::RtpTransport;

/// Samples per AAC access unit.
pub const SAMPLES_PER_FRAME: u32 = 1024;

/// Sampling frequencies indexed by `sampling_frequency_index` (ISO 14496-3).
pub const SAMPLING_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

const ADTS_HEADER_LEN: usize = 7;
const ADTS_CRC_LEN: usize = 2;
const AU_HEADER_SECTION: usize = 4;
const MAX_AU_SIZE: usize = (1 << 13) - 1;

pub fn sampling_index(rate: u32) -> Option<u8> {
    SAMPLING_RATES.iter().position(|&r| r == rate).map(|i| i as u8)
}

/// AudioSpecificConfig word for the SDP `config=` parameter.
///
/// `object_type` 2 is AAC-LC.
pub fn audio_specific_config(object_type: u8, sampling_rate: u32, channels: u8) -> Option<u16> {
    let index = sampling_index(sampling_rate)?;
    Some(((object_type as u16) << 11) | ((index as u16) << 7) | ((channels as u16 & 0x0f) << 3))
}

/// Fixed and variable ADTS header fields the packetizer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub protection_absent: bool,
    /// MPEG-4 audio object type (ADTS profile + 1).
    pub object_type: u8,
    pub sampling_index: u8,
    pub channels: u8,
    /// Whole frame length including the header.
    pub frame_length: usize,
}

impl AdtsHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ADTS_HEADER_LEN || bytes[0] != 0xFF || bytes[1] & 0xF0 != 0xF0 {
            return None;
        }
        let header = Self {
            protection_absent: bytes[1] & 0x01 == 1,
            object_type: (bytes[2] >> 6) + 1,
            sampling_index: (bytes[2] >> 2) & 0x0F,
            channels: ((bytes[2] & 0x01) << 2) | (bytes[3] >> 6),
            frame_length: (((bytes[3] & 0x03) as usize) << 11)
                | ((bytes[4] as usize) << 3)
                | ((bytes[5] as usize) >> 5),
        };
        if header.frame_length < header.header_len() {
            return None;
        }
        Some(header)
    }

    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            ADTS_HEADER_LEN
        } else {
            ADTS_HEADER_LEN + ADTS_CRC_LEN
        }
    }

    pub fn payload_len(&self) -> usize {
        self.frame_length - self.header_len()
    }

    pub fn sampling_rate(&self) -> Option<u32> {
        SAMPLING_RATES.get(self.sampling_index as usize).copied()
    }
}

/// How the source delivers AAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacFraming {
    /// ADTS stream: headers are parsed and stripped.
    Adts,
    /// One raw access unit per source read.
    AccessUnits,
}

#[derive(Debug)]
pub struct AacPacketizer {
    framing: AacFraming,
    sampling_rate: u32,
    timestamp_base: u32,
    next_timestamp: u32,
}

impl AacPacketizer {
    pub fn new(framing: AacFraming, sampling_rate: u32) -> Self {
        let timestamp_base = rand::random::<u32>();
        Self {
            framing,
            sampling_rate,
            timestamp_base,
            next_timestamp: timestamp_base,
        }
    }

    fn send_access_unit(&mut self, transport: &RtpTransport, au: &[u8], pts: Option<Duration>) -> Result<()> {
        if au.is_empty() {
            return Ok(());
        }
        if au.len() > MAX_AU_SIZE {
            tracing::warn!(size = au.len(), "access unit too large for a 13-bit AU-size, dropped");
            return Ok(());
        }
        let timestamp = match pts {
            Some(pts) => self
                .timestamp_base
                .wrapping_add(media_time_to_rtp(pts, self.sampling_rate)),
            None => self.next_timestamp,
        };

        let size = au.len();
        let header = [0x00, 0x10, (size >> 5) as u8, ((size & 0x1f) << 3) as u8];
        let max_fragment = transport.max_payload() - AU_HEADER_SECTION;
        let mut chunks = au.chunks(max_fragment).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            send_payload(transport, &[&header, chunk], timestamp, last)?;
        }

        self.next_timestamp = timestamp.wrapping_add(SAMPLES_PER_FRAME);
        Ok(())
    }

    fn run_adts(&mut self, source: &mut dyn MediaSource, transport: &RtpTransport) -> Result<()> {
        let mut header = [0u8; ADTS_HEADER_LEN];
        let mut payload = Vec::new();
        let mut rate_checked = false;

        if !read_or_eof(source, &mut header)? {
            return Ok(());
        }
        loop {
            let Some(adts) = AdtsHeader::parse(&header) else {
                // Lost sync: slide one byte and look again.
                tracing::warn!("ADTS sync lost, scanning for the next header");
                header.copy_within(1.., 0);
                if !read_or_eof(source, &mut header[ADTS_HEADER_LEN - 1..])? {
                    return Ok(());
                }
                continue;
            };

            if !rate_checked {
                rate_checked = true;
                if adts.sampling_rate() != Some(self.sampling_rate) {
                    tracing::warn!(
                        configured = self.sampling_rate,
                        stream = ?adts.sampling_rate(),
                        "ADTS sampling rate differs from configuration"
                    );
                }
            }

            if !adts.protection_absent {
                let mut crc = [0u8; ADTS_CRC_LEN];
                if !read_or_eof(source, &mut crc)? {
                    return Ok(());
                }
            }
            payload.resize(adts.payload_len(), 0);
            if !read_or_eof(source, &mut payload)? {
                tracing::warn!(expected = adts.payload_len(), "stream ended inside an ADTS frame");
                return Ok(());
            }
            let pts = source.presentation_time();
            self.send_access_unit(transport, &payload, pts)?;

            if !read_or_eof(source, &mut header)? {
                return Ok(());
            }
        }
    }

    fn run_access_units(&mut self, source: &mut dyn MediaSource, transport: &RtpTransport) -> Result<()> {
        let mut buf = vec![0u8; MAX_AU_SIZE + 1];
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            if n == buf.len() && !source.at_unit_boundary() {
                // The unit continues past the buffer: drop all of it.
                let mut dropped = n;
                loop {
                    let m = source.read(&mut buf)?;
                    dropped += m;
                    if m == 0 {
                        return Ok(());
                    }
                    if m < buf.len() || source.at_unit_boundary() {
                        break;
                    }
                }
                tracing::warn!(size = dropped, "access unit too large for a 13-bit AU-size, dropped");
                continue;
            }
            let pts = source.presentation_time();
            self.send_access_unit(transport, &buf[..n], pts)?;
        }
    }
}

/// `read_exact` that reports a clean end of stream as `false`.
fn read_or_eof(source: &mut dyn MediaSource, buf: &mut [u8]) -> io::Result<bool> {
    match read_exact(source, buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

impl Packetizer for AacPacketizer {
    fn codec_name(&self) -> &'static str {
        "AAC"
    }

    fn clock_rate(&self) -> u32 {
        self.sampling_rate
    }

    fn run(&mut self, source: &mut dyn MediaSource, transport: &RtpTransport) -> Result<()> {
        match self.framing {
            AacFraming::Adts => self.run_adts(source, transport),
            AacFraming::AccessUnits => self.run_access_units(source, transport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::source::{ChannelSource, MediaFrame, ReaderSource};
    use crate::media::testing::{assert_consecutive, capture_transport, drain};
    use std::io::Cursor;

    /// ADTS frame for AAC-LC 44.1 kHz stereo around `payload`.
    fn adts_frame(payload: &[u8], with_crc: bool) -> Vec<u8> {
        let header_len = if with_crc { 9 } else { 7 };
        let frame_length = payload.len() + header_len;
        let mut frame = vec![
            0xFF,
            if with_crc { 0xF0 } else { 0xF1 },
            (1 << 6) | (4 << 2),
            (2 << 6) | ((frame_length >> 11) & 0x03) as u8,
            (frame_length >> 3) as u8,
            (((frame_length & 0x07) << 5) as u8) | 0x1F,
            0xFC,
        ];
        if with_crc {
            frame.extend_from_slice(&[0xAB, 0xCD]);
        }
        frame.extend_from_slice(payload);
        frame
    }

    fn au_size(payload: &[u8]) -> usize {
        ((payload[2] as usize) << 5) | ((payload[3] as usize) >> 3)
    }

    #[test]
    fn parses_adts_header() {
        let frame = adts_frame(&[0u8; 100], false);
        let header = AdtsHeader::parse(&frame).unwrap();
        assert!(header.protection_absent);
        assert_eq!(header.object_type, 2);
        assert_eq!(header.sampling_rate(), Some(44_100));
        assert_eq!(header.channels, 2);
        assert_eq!(header.frame_length, 107);
        assert_eq!(header.payload_len(), 100);
    }

    #[test]
    fn rejects_missing_sync() {
        assert!(AdtsHeader::parse(&[0xFE, 0xF1, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn config_word_for_aac_lc() {
        assert_eq!(audio_specific_config(2, 44_100, 2), Some(0x1210));
        assert_eq!(audio_specific_config(2, 8_000, 1), Some(0x1588));
        assert_eq!(audio_specific_config(2, 12_345, 1), None);
    }

    #[test]
    fn au_size_matches_adts_payload_length() {
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for (i, len) in [120usize, 371, 20, 800].into_iter().enumerate() {
            let payload: Vec<u8> = (0..len).map(|b| b as u8).collect();
            let frame = adts_frame(&payload, i % 2 == 1);
            let header = AdtsHeader::parse(&frame).unwrap();
            expected.push(header.frame_length - header.header_len());
            stream.extend(frame);
        }

        let (transport, capture) = capture_transport(1400);
        transport.set_clock_rate(44_100);
        let mut source = ReaderSource::new(Cursor::new(stream));
        AacPacketizer::new(AacFraming::Adts, 44_100)
            .run(&mut source, &transport)
            .unwrap();
        drain(&transport);

        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), expected.len());
        assert_consecutive(&packets);
        for ((info, payload), size) in packets.iter().zip(expected) {
            assert_eq!(&payload[..2], &[0x00, 0x10]);
            assert_eq!(au_size(payload), size);
            assert_eq!(payload.len(), 4 + size);
            assert!(info.marker);
        }
        let ts: Vec<u32> = packets.iter().map(|(i, _)| i.timestamp).collect();
        assert!(ts.windows(2).all(|w| w[1].wrapping_sub(w[0]) == SAMPLES_PER_FRAME));
    }

    #[test]
    fn large_access_unit_is_fragmented() {
        let (transport, capture) = capture_transport(1000);
        let (tx, mut source) = ChannelSource::channel(2);
        let au: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();
        tx.send(MediaFrame::new(au.clone())).unwrap();
        drop(tx);

        AacPacketizer::new(AacFraming::AccessUnits, 48_000)
            .run(&mut source, &transport)
            .unwrap();
        drain(&transport);

        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 3);
        let markers: Vec<bool> = packets.iter().map(|(i, _)| i.marker).collect();
        assert_eq!(markers, vec![false, false, true]);
        let mut rebuilt = Vec::new();
        for (_, payload) in &packets {
            assert_eq!(au_size(payload), 2500);
            rebuilt.extend_from_slice(&payload[4..]);
        }
        assert_eq!(rebuilt, au);
    }

    #[test]
    fn oversized_access_unit_is_dropped_whole() {
        let (transport, capture) = capture_transport(1400);
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send(MediaFrame::new(vec![1; 100])).unwrap();
        tx.send(MediaFrame::new(vec![2; 10_000])).unwrap();
        tx.send(MediaFrame::new(vec![3; 50])).unwrap();
        drop(tx);

        AacPacketizer::new(AacFraming::AccessUnits, 48_000)
            .run(&mut source, &transport)
            .unwrap();
        drain(&transport);

        let packets = capture.rtp_packets();
        let sizes: Vec<usize> = packets.iter().map(|(_, p)| au_size(p)).collect();
        assert_eq!(sizes, vec![100, 50]);
        assert_eq!(&packets[1].1[4..], &[3u8; 50]);
    }

    #[test]
    fn skips_garbage_before_adts_sync() {
        let mut stream = vec![0x00, 0x12, 0x34];
        stream.extend(adts_frame(&[9u8; 50], false));

        let (transport, capture) = capture_transport(1400);
        let mut source = ReaderSource::new(Cursor::new(stream));
        AacPacketizer::new(AacFraming::Adts, 44_100)
            .run(&mut source, &transport)
            .unwrap();
        drain(&transport);

        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].1[4..], &[9u8; 50]);
    }

    #[test]
    fn access_unit_timestamps_follow_presentation_time() {
        let (transport, capture) = capture_transport(1400);
        transport.set_clock_rate(48_000);
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send(MediaFrame::with_pts(vec![1; 10], Duration::ZERO)).unwrap();
        tx.send(MediaFrame::with_pts(vec![2; 10], Duration::from_millis(50)))
            .unwrap();
        drop(tx);

        AacPacketizer::new(AacFraming::AccessUnits, 48_000)
            .run(&mut source, &transport)
            .unwrap();
        drain(&transport);

        let packets = capture.rtp_packets();
        assert_eq!(packets[1].0.timestamp.wrapping_sub(packets[0].0.timestamp), 2400);
    }
}
