use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Result, RtspError};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::transport::{LowerTransport, TransportHeader};
use crate::protocol::uri::{DestinationRequest, StreamRequest};
use crate::server::ServerConfig;
use crate::session::{Session, TrackKind};
use crate::transport::InterleavedWriter;

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// RTSP state of one connection (RFC 2326 appendix A.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Ready,
    Playing,
}

/// Handles RTSP method requests for a single TCP connection.
///
/// Owns the connection's [`Session`]. Tracks start streaming as soon as
/// they are SET UP; PLAY reports where the streams are, PAUSE stops them
/// and a later PLAY resumes them.
pub struct MethodHandler {
    session: Session,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    writer: InterleavedWriter,
    state: ConnectionState,
    session_id: Option<String>,
    base_uri: Option<String>,
    setup_tracks: Vec<usize>,
    multicast: bool,
    close: bool,
}

impl MethodHandler {
    pub fn new(
        session: Session,
        peer_addr: SocketAddr,
        config: Arc<ServerConfig>,
        writer: InterleavedWriter,
    ) -> Self {
        MethodHandler {
            session,
            peer_addr,
            config,
            writer,
            state: ConnectionState::Init,
            session_id: None,
            base_uri: None,
            setup_tracks: Vec::new(),
            multicast: false,
            close: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether the connection should close once the last response is sent.
    pub fn should_close(&self) -> bool {
        self.close
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        let result = match request.method.as_str() {
            "OPTIONS" => Ok(self.handle_options(cseq)),
            "DESCRIBE" => self.handle_describe(cseq, request),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            other => Err(RtspError::UnknownMethod(other.to_string())),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(
                peer = %self.peer_addr,
                method = %request.method,
                %cseq,
                error = %e,
                "request failed"
            );
            RtspResponse::from_error(&e).add_header("CSeq", cseq)
        })
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS)
    }

    fn handle_describe(&mut self, cseq: &str, request: &RtspRequest) -> Result<RtspResponse> {
        tracing::debug!(%cseq, uri = %request.uri, "DESCRIBE");
        let stream = StreamRequest::parse(&request.uri)?;

        for kind in [TrackKind::Audio, TrackKind::Video] {
            let Some((codec, quality)) = stream.track(kind) else {
                continue;
            };
            if self.session.track_is_streaming(kind.id()) {
                tracing::debug!(track = kind.id(), "track streaming, keeping its configuration");
                continue;
            }
            self.session.set_track(*codec, quality.clone())?;
        }
        if self.session.track_ids().is_empty() {
            return Err(RtspError::Configuration("no track selected".into()));
        }

        self.multicast = matches!(stream.destination, DestinationRequest::Multicast(_));
        let destination = match stream.destination {
            DestinationRequest::Peer => self.peer_addr.ip().to_string(),
            DestinationRequest::Unicast(host) | DestinationRequest::Multicast(host) => host,
        };
        self.session.set_destination(destination);
        if let Some(ttl) = stream.ttl {
            self.session.set_ttl(ttl);
        }

        self.session.configure()?;
        let sdp = self.session.session_description()?;

        let base = content_base(&request.uri);
        self.base_uri = Some(base.clone());

        Ok(RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Base", &base)
            .add_header("Content-Type", "application/sdp")
            .with_body(sdp))
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> Result<RtspResponse> {
        self.check_session(request, false)?;

        let id = track_id(&request.uri)
            .ok_or_else(|| RtspError::Protocol(format!("no trackID in {}", request.uri)))?;
        if !self.session.has_track(id) {
            return Err(RtspError::TrackNotFound(id));
        }
        // Transport changes need the track stopped (PAUSE) first.
        if self.session.track_is_streaming(id) {
            tracing::debug!(peer = %self.peer_addr, track = id, "SETUP on a streaming track");
            return Ok(RtspResponse::invalid_state().add_header("CSeq", cseq));
        }
        let transport = request
            .get_header("Transport")
            .ok_or_else(|| RtspError::Protocol("SETUP missing Transport header".into()))?;
        let client = TransportHeader::parse(transport)?;

        if self.session.destination().is_none() {
            self.session.set_destination(self.peer_addr.ip().to_string());
        }

        let ssrc = self.session.track_ssrc(id)?;
        let reply = match client.lower {
            LowerTransport::Tcp => {
                let default_channel = (id * 2) as u8;
                let (rtp_channel, _) = client
                    .interleaved
                    .unwrap_or((default_channel, default_channel + 1));
                self.session
                    .set_track_interleaved(id, self.writer.clone(), rtp_channel)?;
                TransportHeader {
                    lower: LowerTransport::Tcp,
                    interleaved: Some((rtp_channel, rtp_channel.wrapping_add(1))),
                    ssrc: Some(ssrc),
                    mode: Some("play".into()),
                    ..TransportHeader::default()
                }
            }
            LowerTransport::Udp => {
                let (rtp, rtcp) = client
                    .client_port
                    .ok_or_else(|| RtspError::Protocol("SETUP missing client_port".into()))?;
                self.session.set_track_destination_ports(id, rtp, rtcp)?;
                TransportHeader {
                    lower: LowerTransport::Udp,
                    multicast: self.multicast,
                    destination: self.session.destination(),
                    client_port: Some((rtp, rtcp)),
                    server_port: Some(self.session.track_local_ports(id)?),
                    ssrc: Some(ssrc),
                    mode: Some("play".into()),
                    ..TransportHeader::default()
                }
            }
        };

        self.session.start_track(id)?;
        if !self.setup_tracks.contains(&id) {
            self.setup_tracks.push(id);
        }
        if self.state == ConnectionState::Init {
            self.state = ConnectionState::Ready;
        }

        let session_header = self.session_header();
        tracing::info!(
            peer = %self.peer_addr,
            session_id = self.session_id.as_deref().unwrap_or_default(),
            track = id,
            transport = %reply,
            "track set up"
        );

        Ok(RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &reply.to_string())
            .add_header("Session", &session_header))
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> Result<RtspResponse> {
        self.check_session(request, true)?;
        if self.setup_tracks.is_empty() {
            return Ok(RtspResponse::invalid_state().add_header("CSeq", cseq));
        }

        // Resume after PAUSE.
        for &id in &self.setup_tracks {
            self.session.start_track(id)?;
        }

        let base = self
            .base_uri
            .clone()
            .unwrap_or_else(|| content_base(&request.uri));
        let rtp_info = self
            .setup_tracks
            .iter()
            .map(|&id| {
                let seq = self.session.track_next_sequence(id)?;
                Ok(format!("url={base}trackID={id};seq={seq}"))
            })
            .collect::<Result<Vec<_>>>()?
            .join(",");

        self.state = ConnectionState::Playing;
        tracing::info!(peer = %self.peer_addr, session_id = self.session_id.as_deref().unwrap_or_default(), "playing");

        Ok(RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &self.session_header())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info))
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> Result<RtspResponse> {
        self.check_session(request, true)?;
        for &id in &self.setup_tracks {
            self.session.stop_track(id)?;
        }
        if self.state == ConnectionState::Playing {
            self.state = ConnectionState::Ready;
        }
        tracing::info!(peer = %self.peer_addr, "paused");
        Ok(RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &self.session_header()))
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> Result<RtspResponse> {
        self.check_session(request, false)?;
        self.session.stop();
        self.setup_tracks.clear();
        self.state = ConnectionState::Init;
        self.close = true;
        tracing::info!(peer = %self.peer_addr, "teardown");
        Ok(RtspResponse::ok().add_header("CSeq", cseq))
    }

    fn handle_get_parameter(&mut self, cseq: &str, request: &RtspRequest) -> Result<RtspResponse> {
        self.check_session(request, false)?;
        let mut response = RtspResponse::ok().add_header("CSeq", cseq);
        if self.session_id.is_some() {
            response = response.add_header("Session", &self.session_header());
        }
        Ok(response)
    }

    /// A `Session` header, when present (or `required`), must name this
    /// connection's session.
    fn check_session(&self, request: &RtspRequest, required: bool) -> Result<()> {
        match (request.session_id(), self.session_id.as_deref()) {
            (Some(given), Some(ours)) if given == ours => Ok(()),
            (Some(given), _) => Err(RtspError::SessionNotFound(given.to_string())),
            (None, _) if required => Err(RtspError::SessionNotFound(String::new())),
            (None, _) => Ok(()),
        }
    }

    fn session_header(&mut self) -> String {
        let id = self
            .session_id
            .get_or_insert_with(|| format!("{:016X}", rand::random::<u64>()));
        format!("{id};timeout={}", self.config.session_timeout.as_secs())
    }

    /// Stop every track; called when the connection goes away.
    pub fn shutdown(&mut self) {
        if self.session.is_streaming() {
            tracing::info!(peer = %self.peer_addr, "stopping tracks of closed connection");
        }
        self.session.stop();
        self.setup_tracks.clear();
        self.state = ConnectionState::Init;
    }
}

/// Request URI without its query, ending in `/`, so that relative
/// `trackID=n` controls resolve under it.
fn content_base(uri: &str) -> String {
    let base = uri.split('?').next().unwrap_or(uri);
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}

fn track_id(uri: &str) -> Option<usize> {
    let path = uri.split('?').next().unwrap_or(uri);
    let (_, rest) = path.rsplit_once("trackID=")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
