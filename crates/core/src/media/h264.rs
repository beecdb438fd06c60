use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use super::source::MediaSource;
use super::{Packetizer, media_time_to_rtp, send_payload};
use crate::error::Result;
use crate::transport::RtpTransport;

/// 90 kHz clock rate per RFC 6184 §8.1.
pub const H264_CLOCK_RATE: u32 = 90_000;

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// Once in-band SPS/PPS have been seen this many times the stream is
/// trusted to carry its own parameter sets.
const IN_BAND_PARAMETER_SETS_TRUSTED: u32 = 5;

/// Lengths above this are treated as a corrupt length prefix.
const MAX_NAL_LEN: usize = 2_000_000;

const READ_CHUNK: usize = 64 * 1024;

/// H.264 RTP packetizer (RFC 6184, packetization-mode=1).
///
/// Reads NAL units from the source, either Annex B (start-code delimited) or
/// 4-byte length-prefixed as produced by hardware encoders and MP4 demuxers.
/// The framing is detected from the first bytes of the stream.
///
/// - **Single NAL Unit** (§5.6): NALs that fit one payload are sent as-is.
/// - **FU-A** (§5.8): larger NALs are split. Each fragment carries a 2-byte
///   FU header before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to max payload - 2 bytes)
///   ```
///
/// - **STAP-A** (§5.7.1): when SPS/PPS were supplied out of band, they are
///   aggregated into one packet sent right before every IDR until the
///   stream shows it carries them in-band.
///
/// The marker bit is set on the last packet of each NAL unit.
#[derive(Debug)]
pub struct H264Packetizer {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    out_of_band: bool,
    in_band_parameter_sets: u32,
    frame_interval: u32,
    timestamp_base: u32,
    next_timestamp: u32,
    /// A slice of the access unit stamped `next_timestamp` was sent.
    slice_sent: bool,
}

impl H264Packetizer {
    /// `frame_rate` paces NALs that arrive without a presentation time.
    pub fn new(frame_rate: u32) -> Self {
        let timestamp_base = rand::random::<u32>();
        Self {
            sps: None,
            pps: None,
            out_of_band: false,
            in_band_parameter_sets: 0,
            frame_interval: H264_CLOCK_RATE / frame_rate.max(1),
            timestamp_base,
            next_timestamp: timestamp_base,
            slice_sent: false,
        }
    }

    /// Parameter sets known from the encoder configuration.
    pub fn with_parameter_sets(mut self, sps: Vec<u8>, pps: Vec<u8>) -> Self {
        self.sps = Some(sps);
        self.pps = Some(pps);
        self.out_of_band = true;
        self
    }

    /// SPS and PPS, whether configured or captured from the stream.
    pub fn parameter_sets(&self) -> Option<(&[u8], &[u8])> {
        Some((self.sps.as_deref()?, self.pps.as_deref()?))
    }

    fn should_aggregate(&self) -> bool {
        self.out_of_band && self.in_band_parameter_sets < IN_BAND_PARAMETER_SETS_TRUSTED
    }

    fn send_nal(&mut self, transport: &RtpTransport, nal: &[u8], pts: Option<Duration>) -> Result<()> {
        let nal_type = nal[0] & 0x1f;
        match pts {
            Some(pts) => {
                let timestamp = self
                    .timestamp_base
                    .wrapping_add(media_time_to_rtp(pts, H264_CLOCK_RATE));
                if timestamp != self.next_timestamp {
                    self.next_timestamp = timestamp;
                    self.slice_sent = false;
                }
            }
            None if self.slice_sent && starts_access_unit(nal) => {
                self.next_timestamp = self.next_timestamp.wrapping_add(self.frame_interval);
                self.slice_sent = false;
            }
            None => {}
        }
        let timestamp = self.next_timestamp;

        match nal_type {
            NAL_SPS | NAL_PPS => {
                self.in_band_parameter_sets += 1;
                let slot = if nal_type == NAL_SPS { &mut self.sps } else { &mut self.pps };
                if slot.is_none() {
                    tracing::debug!(nal_type, len = nal.len(), "parameter set captured from bitstream");
                    *slot = Some(nal.to_vec());
                }
            }
            NAL_IDR if self.should_aggregate() => self.send_stap_a(transport, timestamp)?,
            _ => {}
        }

        if nal.len() <= transport.max_payload() {
            send_payload(transport, &[nal], timestamp, true)?;
        } else {
            send_fu_a(transport, nal, timestamp)?;
        }

        if (1..=NAL_IDR).contains(&nal_type) {
            self.slice_sent = true;
        }
        Ok(())
    }

    /// Aggregate SPS and PPS with 16-bit length prefixes.
    fn send_stap_a(&self, transport: &RtpTransport, timestamp: u32) -> Result<()> {
        let Some((sps, pps)) = self.parameter_sets() else {
            return Ok(());
        };
        if 1 + 2 + sps.len() + 2 + pps.len() > transport.max_payload() {
            tracing::warn!(sps = sps.len(), pps = pps.len(), "parameter sets too large for STAP-A");
            return Ok(());
        }
        let nri = (sps[0] | pps[0]) & 0x60;
        send_payload(
            transport,
            &[
                &[nri | NAL_STAP_A],
                &(sps.len() as u16).to_be_bytes(),
                sps,
                &(pps.len() as u16).to_be_bytes(),
                pps,
            ],
            timestamp,
            true,
        )
    }
}

/// Whether `nal` opens a new access unit once the current one holds a
/// slice (H.264 §7.4.1.2.3): an AUD, SEI, SPS, PPS or prefix NAL, or a slice
/// whose first_mb_in_slice is 0. A ue(v) of 0 is the single bit `1`.
fn starts_access_unit(nal: &[u8]) -> bool {
    match nal[0] & 0x1f {
        1..=NAL_IDR => nal.get(1).is_some_and(|b| b & 0x80 != 0),
        6..=9 | 14..=18 => true,
        _ => false,
    }
}

fn send_fu_a(transport: &RtpTransport, nal: &[u8], timestamp: u32) -> Result<()> {
    let nal_type = nal[0] & 0x1f;
    let indicator = (nal[0] & 0x60) | NAL_FU_A;
    let max_fragment = transport.max_payload() - 2;

    let mut chunks = nal[1..].chunks(max_fragment).peekable();
    let mut first = true;
    let mut fragments = 0usize;
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        let mut header = nal_type;
        if first {
            header |= 0x80;
        }
        if last {
            header |= 0x40;
        }
        send_payload(transport, &[&[indicator, header], chunk], timestamp, last)?;
        first = false;
        fragments += 1;
    }

    tracing::trace!(nal_type, nal_size = nal.len(), fragments, "FU-A fragmented NAL unit");
    Ok(())
}

impl Packetizer for H264Packetizer {
    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        H264_CLOCK_RATE
    }

    fn run(&mut self, source: &mut dyn MediaSource, transport: &RtpTransport) -> Result<()> {
        let mut reader = NalReader::default();
        while let Some((nal, pts)) = reader.next_nal(source)? {
            self.send_nal(transport, &nal, pts)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalFraming {
    AnnexB,
    LengthPrefixed,
}

/// Incremental NAL unit splitter over a [`MediaSource`].
///
/// Keeps the presentation time reported for every read so each NAL is
/// paired with the time of the read its first byte came from.
#[derive(Debug, Default)]
struct NalReader {
    buf: Vec<u8>,
    pos: usize,
    framing: Option<NalFraming>,
    pts: VecDeque<(usize, Option<Duration>)>,
    /// The buffered data ends where the source said a unit ends.
    unit_complete: bool,
}

type Nal = (Vec<u8>, Option<Duration>);

impl NalReader {
    fn next_nal(&mut self, source: &mut dyn MediaSource) -> io::Result<Option<Nal>> {
        self.compact();
        let framing = match self.framing {
            Some(framing) => framing,
            None => {
                if !self.fill(source, 4)? {
                    return Ok(None);
                }
                let head = &self.buf[self.pos..];
                let framing = if head.starts_with(&[0, 0, 0, 1]) || head.starts_with(&[0, 0, 1]) {
                    NalFraming::AnnexB
                } else {
                    NalFraming::LengthPrefixed
                };
                tracing::debug!(?framing, "H.264 input framing detected");
                self.framing = Some(framing);
                framing
            }
        };

        match framing {
            NalFraming::AnnexB => self.next_annex_b(source),
            NalFraming::LengthPrefixed => self.next_length_prefixed(source),
        }
    }

    fn next_annex_b(&mut self, source: &mut dyn MediaSource) -> io::Result<Option<Nal>> {
        loop {
            // Position right after the next start code.
            loop {
                if let Some((at, len)) = find_start_code(&self.buf[self.pos..]) {
                    self.pos += at + len;
                    break;
                }
                // Keep the last bytes: they may be the head of a split start code.
                self.pos = self.pos.max(self.buf.len().saturating_sub(3));
                if !self.read_more(source)? {
                    return Ok(None);
                }
            }

            let start = self.pos;
            let mut scan = start;
            let mut eof = false;
            let end = loop {
                if let Some((at, _)) = find_start_code(&self.buf[scan..]) {
                    break scan + at;
                }
                if self.unit_complete {
                    break self.buf.len();
                }
                scan = self.buf.len().saturating_sub(3).max(start);
                if !self.read_more(source)? {
                    eof = true;
                    break self.buf.len();
                }
            };

            let mut nal_end = end;
            while nal_end > start && self.buf[nal_end - 1] == 0 {
                nal_end -= 1;
            }
            self.pos = end;
            if nal_end > start {
                let pts = self.pts_at(start);
                return Ok(Some((self.buf[start..nal_end].to_vec(), pts)));
            }
            if eof {
                return Ok(None);
            }
        }
    }

    fn next_length_prefixed(&mut self, source: &mut dyn MediaSource) -> io::Result<Option<Nal>> {
        loop {
            if !self.fill(source, 4)? {
                return Ok(None);
            }
            let len = read_u32(&self.buf[self.pos..]) as usize;
            if len == 0 || len > MAX_NAL_LEN {
                tracing::warn!(len, "implausible NAL length, resyncing");
                if !self.resync(source)? {
                    return Ok(None);
                }
                if self.framing == Some(NalFraming::AnnexB) {
                    return self.next_annex_b(source);
                }
                continue;
            }
            if !self.fill(source, 4 + len)? {
                tracing::warn!(len, "stream ended inside a NAL unit");
                return Ok(None);
            }
            let start = self.pos + 4;
            let pts = self.pts_at(start);
            self.pos = start + len;
            return Ok(Some((self.buf[start..start + len].to_vec(), pts)));
        }
    }

    /// Slide forward one byte at a time until a start code or a plausible
    /// length prefix followed by a slice header shows up.
    fn resync(&mut self, source: &mut dyn MediaSource) -> io::Result<bool> {
        let mut skipped = 0usize;
        loop {
            self.pos += 1;
            skipped += 1;
            if !self.fill(source, 5)? {
                return Ok(false);
            }
            let head = &self.buf[self.pos..self.pos + 5];
            if head.starts_with(&[0, 0, 0, 1]) && head[4] & 0x80 == 0 && head[4] & 0x1f != 0 {
                tracing::warn!(skipped, "found start code, switching to Annex B");
                self.framing = Some(NalFraming::AnnexB);
                return Ok(true);
            }
            let len = read_u32(head) as usize;
            let nal_type = head[4] & 0x1f;
            if len > 1 && len <= MAX_NAL_LEN && head[4] & 0x80 == 0 && matches!(nal_type, 1 | NAL_IDR | NAL_SPS) {
                tracing::warn!(skipped, len, nal_type, "resynchronized on length prefix");
                return Ok(true);
            }
        }
    }

    /// Make sure `want` bytes are buffered past `pos`. False at end of stream.
    fn fill(&mut self, source: &mut dyn MediaSource, want: usize) -> io::Result<bool> {
        while self.buf.len() - self.pos < want {
            if !self.read_more(source)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn read_more(&mut self, source: &mut dyn MediaSource) -> io::Result<bool> {
        let old_len = self.buf.len();
        self.buf.resize(old_len + READ_CHUNK, 0);
        let n = loop {
            match source.read(&mut self.buf[old_len..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e);
                }
            }
        };
        self.buf.truncate(old_len + n);
        if n == 0 {
            return Ok(false);
        }
        self.unit_complete = source.at_unit_boundary();
        self.pts.push_back((old_len, source.presentation_time()));
        Ok(true)
    }

    fn pts_at(&self, offset: usize) -> Option<Duration> {
        self.pts
            .iter()
            .rev()
            .find(|(at, _)| *at <= offset)
            .and_then(|(_, pts)| *pts)
    }

    fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        let pos = self.pos;
        self.buf.drain(..pos);
        self.pos = 0;
        // Keep the entry covering the new first byte.
        while self.pts.len() > 1 && self.pts[1].0 <= pos {
            self.pts.pop_front();
        }
        for (at, _) in self.pts.iter_mut() {
            *at = at.saturating_sub(pos);
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Offset and length of the first start code in `data`.
fn find_start_code(data: &[u8]) -> Option<(usize, usize)> {
    let at = data.windows(3).position(|w| w == [0, 0, 1])?;
    if at > 0 && data[at - 1] == 0 {
        Some((at - 1, 4))
    } else {
        Some((at, 3))
    }
}

/// Extract NAL units from an H.264 Annex B bitstream held in memory.
///
/// Handles both 4-byte `00 00 00 01` and 3-byte `00 00 01` start codes and
/// returns the NAL data between them, excluding the start codes.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let mut pos = match find_start_code(data) {
        Some((at, len)) => at + len,
        None => return nal_units,
    };

    loop {
        let next = find_start_code(&data[pos..]);
        let end = next.map_or(data.len(), |(at, _)| pos + at);
        if end > pos {
            nal_units.push(&data[pos..end]);
        }
        match next {
            Some((at, len)) => pos += at + len,
            None => break,
        }
    }
    nal_units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpPacketInfo;
    use crate::media::source::{ChannelSource, MediaFrame, ReaderSource};
    use crate::media::testing::{assert_consecutive, capture_transport, drain};
    use std::io::Cursor;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
    const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        nals.iter().flat_map(|n| [&[0u8, 0, 0, 1][..], n].concat()).collect()
    }

    fn length_prefixed(nals: &[&[u8]]) -> Vec<u8> {
        nals.iter()
            .flat_map(|n| [&(n.len() as u32).to_be_bytes()[..], n].concat())
            .collect()
    }

    /// IDR slice starting at macroblock 0.
    fn idr(len: usize) -> Vec<u8> {
        let mut nal = vec![0x65, 0x88];
        nal.extend((0..len - 2).map(|i| (i % 251) as u8 + 1));
        nal
    }

    fn packetize(
        mut packetizer: H264Packetizer,
        data: Vec<u8>,
        max_payload: usize,
    ) -> Vec<(RtpPacketInfo, Vec<u8>)> {
        let (transport, capture) = capture_transport(max_payload);
        let mut source = ReaderSource::new(Cursor::new(data));
        packetizer.run(&mut source, &transport).unwrap();
        drain(&transport);
        capture.rtp_packets()
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65u8, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67u8, 0x42][..], &[0x68u8, 0xCE][..]]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(extract_nal_units(&[]).is_empty());
        assert!(extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- Packetization ---

    #[test]
    fn small_nals_become_single_nal_packets() {
        let frame = idr(100);
        let packets = packetize(H264Packetizer::new(1000), annex_b(&[&SPS, &PPS, &frame]), 1400);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].1, SPS);
        assert_eq!(packets[1].1, PPS);
        assert_eq!(packets[2].1, frame);
        assert!(packets.iter().all(|(info, _)| info.marker && info.payload_type == 96));
        assert_consecutive(&packets);
    }

    #[test]
    fn fu_a_fragments_reassemble_to_original_nal() {
        let frame = idr(5000);
        let packets = packetize(H264Packetizer::new(1000), annex_b(&[&frame]), 1400);
        assert_eq!(packets.len(), 4);
        assert_consecutive(&packets);

        let (first, rest) = packets.split_first().unwrap();
        assert_eq!(first.1[0] & 0x1f, NAL_FU_A);
        assert_eq!(first.1[1] & 0x80, 0x80);
        assert!(!first.0.marker);
        let last = rest.last().unwrap();
        assert_eq!(last.1[1] & 0x40, 0x40);
        assert!(last.0.marker);
        assert!(packets.iter().all(|(_, p)| p.len() <= 1400));

        let mut rebuilt = vec![(first.1[0] & 0xE0) | (first.1[1] & 0x1f)];
        for (_, payload) in &packets {
            rebuilt.extend_from_slice(&payload[2..]);
        }
        assert_eq!(rebuilt, frame);
    }

    #[test]
    fn length_prefixed_input_is_detected() {
        let frame = idr(300);
        let packets = packetize(H264Packetizer::new(1000), length_prefixed(&[&SPS, &PPS, &frame]), 1400);
        let payloads: Vec<_> = packets.into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec![SPS.to_vec(), PPS.to_vec(), frame]);
    }

    #[test]
    fn resyncs_after_corrupt_length() {
        let a = idr(50);
        let b = vec![0x41, 0x9a, 0x02, 0x03];
        let mut data = length_prefixed(&[&a]);
        data.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x13]);
        data.extend(length_prefixed(&[&b]));

        let packets = packetize(H264Packetizer::new(1000), data, 1400);
        let payloads: Vec<_> = packets.into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec![a, b]);
    }

    #[test]
    fn stap_a_precedes_idr_with_out_of_band_parameter_sets() {
        let packetizer = H264Packetizer::new(1000).with_parameter_sets(SPS.to_vec(), PPS.to_vec());
        let frame = idr(200);
        let packets = packetize(packetizer, annex_b(&[&frame]), 1400);

        assert_eq!(packets.len(), 2);
        let (stap_info, stap) = &packets[0];
        assert_eq!(stap[0] & 0x1f, NAL_STAP_A);
        assert!(stap_info.marker);
        assert_eq!(&stap[1..3], &[0, 4]);
        assert_eq!(&stap[3..7], &SPS);
        assert_eq!(&stap[7..9], &[0, 4]);
        assert_eq!(&stap[9..13], &PPS);
        assert_eq!(packets[1].1, frame);
        assert_eq!(stap_info.timestamp, packets[1].0.timestamp);
    }

    #[test]
    fn stap_a_stops_once_stream_carries_parameter_sets() {
        let packetizer = H264Packetizer::new(1000).with_parameter_sets(SPS.to_vec(), PPS.to_vec());
        let frame = idr(20);
        let mut nals: Vec<&[u8]> = Vec::new();
        for _ in 0..4 {
            nals.extend_from_slice(&[&SPS, &PPS, &frame]);
        }
        let packets = packetize(packetizer, annex_b(&nals), 1400);
        let staps = packets
            .iter()
            .filter(|(_, p)| p[0] & 0x1f == NAL_STAP_A)
            .count();
        // In-band count reaches 2, 4, 6, 8 before each IDR.
        assert_eq!(staps, 2);
    }

    #[test]
    fn timestamps_follow_presentation_time() {
        let (transport, capture) = capture_transport(1400);
        let (tx, mut source) = ChannelSource::channel(4);
        let frame = idr(30);
        tx.send(MediaFrame::with_pts(annex_b(&[&frame]), Duration::ZERO)).unwrap();
        tx.send(MediaFrame::with_pts(annex_b(&[&frame]), Duration::from_millis(40)))
            .unwrap();
        drop(tx);

        H264Packetizer::new(25).run(&mut source, &transport).unwrap();
        drain(&transport);
        let packets = capture.rtp_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].0.timestamp.wrapping_sub(packets[0].0.timestamp), 3600);
    }

    #[test]
    fn timestamps_advance_by_frame_interval() {
        let frame = idr(30);
        let packets = packetize(H264Packetizer::new(100), annex_b(&[&SPS, &frame, &frame]), 1400);
        let ts: Vec<u32> = packets.iter().map(|(i, _)| i.timestamp).collect();
        assert_eq!(ts[0], ts[1]);
        assert_eq!(ts[2].wrapping_sub(ts[1]), 900);
    }

    #[test]
    fn slices_of_one_picture_share_a_timestamp() {
        let first_slice = idr(40);
        // first_mb_in_slice = 8: ue(v) `0001001`.
        let second_slice = vec![0x65, 0x12, 0x40, 0x07, 0x09];
        let next_picture = vec![0x41, 0x9a, 0x02, 0x03];
        let packets = packetize(
            H264Packetizer::new(100),
            annex_b(&[&first_slice, &second_slice, &next_picture]),
            1400,
        );
        let ts: Vec<u32> = packets.iter().map(|(i, _)| i.timestamp).collect();
        assert_eq!(ts.len(), 3);
        assert_eq!(ts[0], ts[1]);
        assert_eq!(ts[2].wrapping_sub(ts[1]), 900);
    }

    #[test]
    fn access_unit_delimiter_starts_a_new_picture() {
        let aud = [0x09, 0xf0];
        let slice = [0x41, 0x9a, 0x02];
        let packets = packetize(
            H264Packetizer::new(100),
            annex_b(&[&aud, &slice, &aud, &slice]),
            1400,
        );
        let ts: Vec<u32> = packets.iter().map(|(i, _)| i.timestamp).collect();
        assert_eq!(ts[0], ts[1]);
        assert_eq!(ts[2].wrapping_sub(ts[1]), 900);
        assert_eq!(ts[2], ts[3]);
    }

    #[test]
    fn captures_in_band_parameter_sets() {
        let (transport, _capture) = capture_transport(1400);
        let mut source = ReaderSource::new(Cursor::new(annex_b(&[&SPS, &PPS, &idr(10)])));
        let mut packetizer = H264Packetizer::new(1000);
        packetizer.run(&mut source, &transport).unwrap();
        drain(&transport);
        assert_eq!(packetizer.parameter_sets(), Some((&SPS[..], &PPS[..])));
    }
}
