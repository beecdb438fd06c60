//! One media track of a [`Session`](super::Session): an encoder, its
//! packetizer thread and the RTP transport they feed.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::{Result, RtspError};
use crate::media::aac::{AacFraming, AacPacketizer};
use crate::media::amr::{AMR_CLOCK_RATE, AmrPacketizer};
use crate::media::h263::{H263_CLOCK_RATE, H263Packetizer};
use crate::media::h264::{H264_CLOCK_RATE, H264Packetizer};
use crate::media::source::MediaEncoder;
use crate::media::{Packetizer, PacketizerHandle};
use crate::protocol::sdp::MediaDescription;
use crate::transport::{InterleavedWriter, RtpTransport, TransportConfig};

/// Track slot in a session. The numeric value is the `trackID` used in SDP
/// and SETUP URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio = 0,
    Video = 1,
}

impl TrackKind {
    pub fn id(self) -> usize {
        self as usize
    }

    pub fn from_id(id: usize) -> Option<Self> {
        match id {
            0 => Some(Self::Audio),
            1 => Some(Self::Video),
            _ => None,
        }
    }

    /// SDP media type.
    pub fn media(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H263,
    Aac,
    AmrNb,
}

impl Codec {
    pub fn kind(self) -> TrackKind {
        match self {
            Self::H264 | Self::H263 => TrackKind::Video,
            Self::Aac | Self::AmrNb => TrackKind::Audio,
        }
    }

    /// Encoding name in `a=rtpmap`.
    pub fn encoding_name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::H263 => "H263-1998",
            Self::Aac => "mpeg4-generic",
            Self::AmrNb => "AMR",
        }
    }

    /// Accepts the short names used in URI queries and on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "h264" => Some(Self::H264),
            "h263" => Some(Self::H263),
            "aac" => Some(Self::Aac),
            "amr" | "amrnb" => Some(Self::AmrNb),
            _ => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

/// Encoding quality requested for a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quality {
    /// Bits per second.
    pub bitrate: u32,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
    pub sampling_rate: u32,
    pub channels: u8,
    /// Capture device selector handed to the encoder (camera/microphone id).
    pub source: u32,
}

impl Quality {
    pub fn video_default() -> Self {
        Self {
            bitrate: 500_000,
            frame_rate: 20,
            width: 320,
            height: 240,
            sampling_rate: 0,
            channels: 0,
            source: 0,
        }
    }

    pub fn audio_default() -> Self {
        Self {
            bitrate: 32_000,
            frame_rate: 0,
            width: 0,
            height: 0,
            sampling_rate: 8_000,
            channels: 1,
            source: 0,
        }
    }

    pub fn default_for(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => Self::audio_default(),
            TrackKind::Video => Self::video_default(),
        }
    }
}

/// Out-of-band codec configuration reported by the encoder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CodecParameters {
    /// Nothing to announce (H.263, AMR, or H.264 carrying SPS/PPS in-band only).
    #[default]
    None,
    H264 { sps: Vec<u8>, pps: Vec<u8> },
    Aac {
        sampling_rate: u32,
        channels: u8,
        /// AudioSpecificConfig word.
        config: u16,
        framing: AacFraming,
    },
}

/// A configured encoder plus everything needed to stream it.
pub struct Track {
    kind: TrackKind,
    codec: Codec,
    quality: Quality,
    encoder: Box<dyn MediaEncoder>,
    transport: Arc<RtpTransport>,
    parameters: Option<CodecParameters>,
    destination_ports: Option<(u16, u16)>,
    interleaved: Option<(InterleavedWriter, u8)>,
    packetizer: Option<PacketizerHandle>,
}

impl Track {
    pub fn new(
        codec: Codec,
        quality: Quality,
        encoder: Box<dyn MediaEncoder>,
        transport_config: TransportConfig,
    ) -> Result<Self> {
        let transport = Arc::new(RtpTransport::with_config(transport_config)?);
        Ok(Self {
            kind: codec.kind(),
            codec,
            quality,
            encoder,
            transport,
            parameters: None,
            destination_ports: None,
            interleaved: None,
            packetizer: None,
        })
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn quality(&self) -> &Quality {
        &self.quality
    }

    pub fn transport(&self) -> &Arc<RtpTransport> {
        &self.transport
    }

    pub fn parameters(&self) -> Option<&CodecParameters> {
        self.parameters.as_ref()
    }

    pub fn set_destination_ports(&mut self, rtp: u16, rtcp: u16) {
        self.destination_ports = Some((rtp, rtcp));
        self.interleaved = None;
    }

    pub fn destination_ports(&self) -> Option<(u16, u16)> {
        self.destination_ports
    }

    /// Send over the RTSP connection instead of UDP.
    pub fn set_interleaved(&mut self, writer: InterleavedWriter, channel: u8) {
        self.interleaved = Some((writer, channel));
    }

    pub fn is_streaming(&self) -> bool {
        self.packetizer.as_ref().is_some_and(PacketizerHandle::is_running)
    }

    /// Run the encoder configuration. Skipped while streaming.
    pub fn configure(&mut self) -> Result<()> {
        if self.is_streaming() {
            return Ok(());
        }
        let parameters = self.encoder.configure(self.codec, &self.quality)?;
        match (&self.codec, &parameters) {
            (Codec::H264, CodecParameters::H264 { sps, pps }) if sps.len() < 4 || pps.is_empty() => {
                return Err(RtspError::Configuration("encoder returned truncated SPS/PPS".into()));
            }
            (Codec::Aac, CodecParameters::None) => {
                return Err(RtspError::Configuration("AAC encoder returned no AudioSpecificConfig".into()));
            }
            _ => {}
        }
        tracing::debug!(codec = %self.codec, quality = ?self.quality, "track configured");
        self.parameters = Some(parameters);
        Ok(())
    }

    /// Open the encoder and start the packetizer thread. A no-op while
    /// already streaming. `on_error` runs if the stream later fails.
    pub fn start(
        &mut self,
        destination: Option<IpAddr>,
        on_error: impl FnOnce(RtspError) + Send + 'static,
    ) -> Result<()> {
        if self.is_streaming() {
            return Ok(());
        }
        if self.parameters.is_none() {
            self.configure()?;
        }

        match (&self.interleaved, destination, self.destination_ports) {
            (Some((writer, channel)), _, _) => self.transport.set_output_stream(writer.clone(), *channel),
            (None, None, _) => return Err(RtspError::DestinationNotSet),
            (None, Some(_), None) => {
                return Err(RtspError::Transport(format!(
                    "no destination ports for {} track",
                    self.kind.media()
                )));
            }
            (None, Some(ip), Some((rtp, rtcp))) => self.transport.set_destination(ip, rtp, rtcp),
        }

        let packetizer = self.packetizer();
        let source = match self.encoder.open() {
            Ok(source) => source,
            Err(e) => {
                self.transport.close();
                return Err(e);
            }
        };
        self.packetizer = Some(PacketizerHandle::start(
            packetizer,
            source,
            self.transport.clone(),
            move |result| {
                if let Err(e) = result {
                    on_error(e);
                }
            },
        ));
        tracing::info!(
            codec = %self.codec,
            ssrc = format_args!("{:#010X}", self.transport.ssrc()),
            "track streaming"
        );
        Ok(())
    }

    /// Stop the packetizer, then the transport, then the encoder.
    pub fn stop(&mut self) {
        let Some(handle) = self.packetizer.take() else {
            return;
        };
        handle.stop();
        self.transport.close();
        self.encoder.close();
        tracing::info!(codec = %self.codec, "track stopped");
    }

    fn packetizer(&self) -> Box<dyn Packetizer> {
        match (self.codec, &self.parameters) {
            (Codec::H264, Some(CodecParameters::H264 { sps, pps })) => Box::new(
                H264Packetizer::new(self.quality.frame_rate).with_parameter_sets(sps.clone(), pps.clone()),
            ),
            (Codec::H264, _) => Box::new(H264Packetizer::new(self.quality.frame_rate)),
            (Codec::H263, _) => Box::new(H263Packetizer::new(self.quality.frame_rate)),
            (Codec::Aac, Some(CodecParameters::Aac { sampling_rate, framing, .. })) => {
                Box::new(AacPacketizer::new(*framing, *sampling_rate))
            }
            (Codec::Aac, _) => Box::new(AacPacketizer::new(AacFraming::Adts, self.quality.sampling_rate)),
            (Codec::AmrNb, _) => Box::new(AmrPacketizer::new()),
        }
    }

    fn clock_rate(&self) -> u32 {
        match (self.codec, &self.parameters) {
            (Codec::H264, _) => H264_CLOCK_RATE,
            (Codec::H263, _) => H263_CLOCK_RATE,
            (Codec::AmrNb, _) => AMR_CLOCK_RATE,
            (Codec::Aac, Some(CodecParameters::Aac { sampling_rate, .. })) => *sampling_rate,
            (Codec::Aac, _) => self.quality.sampling_rate,
        }
    }

    fn fmtp(&self) -> Option<String> {
        match (self.codec, &self.parameters) {
            (Codec::H264, Some(CodecParameters::H264 { sps, pps })) => Some(format!(
                "packetization-mode=1;profile-level-id={:02x}{:02x}{:02x};sprop-parameter-sets={},{};",
                sps[1],
                sps[2],
                sps[3],
                BASE64_STANDARD.encode(sps),
                BASE64_STANDARD.encode(pps)
            )),
            (Codec::H264, _) => Some("packetization-mode=1;".to_string()),
            (Codec::Aac, Some(CodecParameters::Aac { config, .. })) => Some(format!(
                "streamtype=5; profile-level-id=15; mode=AAC-hbr; config={config:x}; \
                 SizeLength=13; IndexLength=3; IndexDeltaLength=3;"
            )),
            (Codec::AmrNb, _) => Some("octet-align=1;".to_string()),
            _ => None,
        }
    }

    /// `m=` block for this track.
    pub fn media_description(&self) -> MediaDescription {
        MediaDescription {
            media: self.kind.media(),
            port: self.destination_ports.map_or(0, |(rtp, _)| rtp),
            encoding: self.codec.encoding_name(),
            clock_rate: self.clock_rate(),
            fmtp: self.fmtp(),
            track_id: self.kind.id(),
        }
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("quality", &self.quality)
            .field("destination_ports", &self.destination_ports)
            .field("streaming", &self.is_streaming())
            .finish()
    }
}
