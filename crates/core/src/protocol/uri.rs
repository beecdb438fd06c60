//! Stream selection from the DESCRIBE request URI.
//!
//! Viewers choose codecs and quality in the query string:
//!
//! ```text
//! rtsp://host:8086/?h264=500-20-320-240&aac=32-44100&camera=1&multicast=228.5.6.7&ttl=16
//! ```
//!
//! | Key | Value | Meaning |
//! |-----|-------|---------|
//! | `h264`, `h263` | `kbps-fps-width-height` | video track |
//! | `aac`, `amr` | `kbps-sampling_rate` | audio track |
//! | `camera`, `mic` | integer | capture source selector |
//! | `multicast` | optional address | send to a group instead of the viewer |
//! | `unicast` | optional address | send to an explicit host |
//! | `ttl` | integer | multicast TTL |
//!
//! Missing fields in a value keep the defaults from [`Quality`].

use crate::error::{Result, RtspError};
use crate::session::track::{Codec, Quality, TrackKind};

/// Group used when `multicast` carries no address.
pub const DEFAULT_MULTICAST_GROUP: &str = "228.5.6.7";

/// Where the viewer asked the media to go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DestinationRequest {
    /// Back to the address the request came from.
    #[default]
    Peer,
    Unicast(String),
    Multicast(String),
}

/// Session configuration requested by a DESCRIBE URI.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamRequest {
    pub audio: Option<(Codec, Quality)>,
    pub video: Option<(Codec, Quality)>,
    pub destination: DestinationRequest,
    pub ttl: Option<u32>,
}

impl StreamRequest {
    /// Parse the query part of `uri`. A URI without a query selects nothing
    /// and leaves the session's configured tracks in place.
    pub fn parse(uri: &str) -> Result<Self> {
        let mut request = Self::default();
        let Some((_, query)) = uri.split_once('?') else {
            return Ok(request);
        };

        let mut camera = None;
        let mut mic = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key.to_ascii_lowercase().as_str() {
                "h264" => request.video = Some((Codec::H264, video_quality(value)?)),
                "h263" => request.video = Some((Codec::H263, video_quality(value)?)),
                "aac" => request.audio = Some((Codec::Aac, audio_quality(value, 44_100)?)),
                "amr" => request.audio = Some((Codec::AmrNb, audio_quality(value, 8_000)?)),
                "camera" => camera = Some(number(key, value)?),
                "mic" => mic = Some(number(key, value)?),
                "multicast" => {
                    let group = if value.is_empty() {
                        DEFAULT_MULTICAST_GROUP
                    } else {
                        value
                    };
                    request.destination = DestinationRequest::Multicast(group.to_string());
                }
                "unicast" if !value.is_empty() => {
                    request.destination = DestinationRequest::Unicast(value.to_string());
                }
                "unicast" => request.destination = DestinationRequest::Peer,
                "ttl" => request.ttl = Some(number(key, value)?),
                other => tracing::debug!(key = other, "ignoring unknown stream parameter"),
            }
        }

        if let (Some(source), Some((_, quality))) = (camera, request.video.as_mut()) {
            quality.source = source;
        }
        if let (Some(source), Some((_, quality))) = (mic, request.audio.as_mut()) {
            quality.source = source;
        }
        Ok(request)
    }

    /// Requested (codec, quality) for a track slot.
    pub fn track(&self, kind: TrackKind) -> Option<&(Codec, Quality)> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }
}

fn number(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| RtspError::Protocol(format!("invalid value for {key}: {value:?}")))
}

/// `kbps-fps-width-height`, any suffix may be omitted.
fn video_quality(value: &str) -> Result<Quality> {
    let mut quality = Quality::video_default();
    let fields = fields(value)?;
    if let Some(&kbps) = fields.first() {
        quality.bitrate = bitrate(kbps, value)?;
    }
    if let Some(&fps) = fields.get(1) {
        quality.frame_rate = fps;
    }
    if let (Some(&width), Some(&height)) = (fields.get(2), fields.get(3)) {
        quality.width = width;
        quality.height = height;
    }
    if quality.frame_rate == 0 || quality.width == 0 || quality.height == 0 {
        return Err(RtspError::Configuration(format!(
            "unsupported video quality {value:?}"
        )));
    }
    Ok(quality)
}

/// `kbps-sampling_rate`, any suffix may be omitted.
fn audio_quality(value: &str, default_rate: u32) -> Result<Quality> {
    let mut quality = Quality::audio_default();
    quality.sampling_rate = default_rate;
    let fields = fields(value)?;
    if let Some(&kbps) = fields.first() {
        quality.bitrate = bitrate(kbps, value)?;
    }
    if let Some(&rate) = fields.get(1) {
        quality.sampling_rate = rate;
    }
    if quality.sampling_rate == 0 {
        return Err(RtspError::Configuration(format!(
            "unsupported audio quality {value:?}"
        )));
    }
    Ok(quality)
}

fn bitrate(kbps: u32, value: &str) -> Result<u32> {
    kbps.checked_mul(1000)
        .ok_or_else(|| RtspError::Configuration(format!("unsupported bitrate {value:?}")))
}

fn fields(value: &str) -> Result<Vec<u32>> {
    value
        .split('-')
        .filter(|f| !f.is_empty())
        .map(|f| {
            f.parse()
                .map_err(|_| RtspError::Protocol(format!("invalid quality {value:?}")))
        })
        .collect()
}
