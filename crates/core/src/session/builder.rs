use std::fmt;
use std::sync::Arc;

use super::track::{Codec, Quality, TrackKind};
use super::{EventHandler, Session, SessionEvent};
use crate::error::{Result, RtspError};
use crate::media::source::EncoderFactory;
use crate::transport::{Resolver, SystemResolver, TransportConfig};

/// Configures and creates [`Session`]s.
///
/// Cheap to clone; the RTSP server keeps one and builds a fresh session for
/// every connection.
///
/// ```no_run
/// use rtsp_stream::media::source::MediaEncoder;
/// use rtsp_stream::session::{Codec, Quality, SessionBuilder, TrackKind};
/// # fn encoder(kind: TrackKind, codec: Codec) -> rtsp_stream::Result<Box<dyn MediaEncoder>> { unimplemented!() }
///
/// let session = SessionBuilder::new(encoder)
///     .video(Codec::H264, Quality::video_default())
///     .destination("192.168.1.20")
///     .build()?;
/// # Ok::<(), rtsp_stream::RtspError>(())
/// ```
#[derive(Clone)]
pub struct SessionBuilder {
    factory: Arc<dyn EncoderFactory>,
    resolver: Arc<dyn Resolver>,
    events: Option<EventHandler>,
    transport_config: TransportConfig,
    audio: Option<(Codec, Quality)>,
    video: Option<(Codec, Quality)>,
    destination: Option<String>,
    origin: String,
    ttl: u32,
}

impl SessionBuilder {
    pub fn new(factory: impl EncoderFactory + 'static) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    pub fn with_factory(factory: Arc<dyn EncoderFactory>) -> Self {
        Self {
            factory,
            resolver: Arc::new(SystemResolver),
            events: None,
            transport_config: TransportConfig::default(),
            audio: None,
            video: None,
            destination: None,
            origin: "127.0.0.1".to_string(),
            ttl: 0,
        }
    }

    pub fn audio(mut self, codec: Codec, quality: Quality) -> Self {
        self.audio = Some((codec, quality));
        self
    }

    pub fn video(mut self, codec: Codec, quality: Quality) -> Self {
        self.video = Some((codec, quality));
        self
    }

    pub fn destination(mut self, host: impl Into<String>) -> Self {
        self.destination = Some(host.into());
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn events(mut self, handler: impl Fn(SessionEvent) + Send + Sync + 'static) -> Self {
        self.events = Some(Arc::new(handler));
        self
    }

    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Whether a track of `kind` will be created.
    pub fn has_track(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio.is_some(),
            TrackKind::Video => self.video.is_some(),
        }
    }

    /// Create the session and its tracks. Encoders are created now but not
    /// configured.
    pub fn build(&self) -> Result<Session> {
        for (expected, selection) in [(TrackKind::Audio, &self.audio), (TrackKind::Video, &self.video)] {
            if let Some((codec, _)) = selection
                && codec.kind() != expected
            {
                return Err(RtspError::Configuration(format!(
                    "{codec} cannot be used as the {} track",
                    expected.media()
                )));
            }
        }

        let session = Session::new(
            self.factory.clone(),
            self.resolver.clone(),
            self.events.clone(),
            self.transport_config.clone(),
            self.destination.clone(),
            self.origin.clone(),
            self.ttl,
        );
        for (codec, quality) in self.audio.iter().chain(self.video.iter()) {
            session.set_track(*codec, quality.clone())?;
        }
        Ok(session)
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("audio", &self.audio)
            .field("video", &self.video)
            .field("destination", &self.destination)
            .field("origin", &self.origin)
            .field("ttl", &self.ttl)
            .field("transport_config", &self.transport_config)
            .finish()
    }
}
