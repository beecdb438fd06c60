//! RTSP client for the push role.
//!
//! Announces a [`Session`] to an ingest server and records into it:
//!
//! ```text
//! ANNOUNCE (SDP) ─▶ 401 ─▶ ANNOUNCE + Authorization ─▶ 200
//! SETUP trackID=n (one per track)                    ─▶ 200 + Transport
//! RECORD                                             ─▶ 200, session starts
//! OPTIONS every heartbeat interval while started
//! ```
//!
//! A failed heartbeat stops the session and enters a reconnect loop that
//! repeats the whole sequence every `reconnect_delay` until it succeeds or
//! [`RtspClient::stop`] is called. Rejected credentials are never retried.

use std::fmt;
use std::io::BufReader;
use std::net::{IpAddr, Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::protocol::auth::{Challenge, Credentials};
use crate::protocol::request::USER_AGENT;
use crate::protocol::transport::{LowerTransport, TransportHeader};
use crate::protocol::{self, RtspRequest, RtspResponse};
use crate::session::Session;
use crate::transport::InterleavedWriter;

/// Lower transport requested in SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientTransport {
    #[default]
    Udp,
    /// RTP and RTCP interleaved on the RTSP connection.
    Tcp,
}

/// Where and how to push.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Path of the stream on the server, e.g. `/live/cam1`.
    pub path: String,
    pub credentials: Option<Credentials>,
    pub transport: ClientTransport,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    /// Connect and read timeout of the RTSP socket.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1935,
            path: "/".to_string(),
            credentials: None,
            transport: ClientTransport::Udp,
            heartbeat_interval: Duration::from_secs(6),
            reconnect_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Parse `rtsp://[user:password@]host[:port]/path`.
    ///
    /// ```
    /// use rtsp_stream::ClientConfig;
    ///
    /// let config = ClientConfig::from_url("rtsp://me:pw@ingest.local:8554/live/cam").unwrap();
    /// assert_eq!((config.host.as_str(), config.port), ("ingest.local", 8554));
    /// assert_eq!(config.path, "/live/cam");
    /// assert!(config.credentials.is_some());
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("rtsp://")
            .ok_or_else(|| RtspError::Configuration(format!("not an rtsp:// URL: {url}")))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };

        let mut config = Self {
            path: path.to_string(),
            ..Self::default()
        };
        match hostport.rsplit_once(':') {
            Some((host, port)) => {
                config.host = host.to_string();
                config.port = port
                    .parse()
                    .map_err(|_| RtspError::Configuration(format!("invalid port in {url}")))?;
            }
            None => config.host = hostport.to_string(),
        }
        if config.host.is_empty() {
            return Err(RtspError::Configuration(format!("no host in {url}")));
        }
        if let Some(userinfo) = userinfo {
            let (user, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
            config.credentials = Some(Credentials::new(user, password));
        }
        Ok(config)
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn transport(mut self, transport: ClientTransport) -> Self {
        self.transport = transport;
        self
    }

    /// `rtsp://host:port/path`, without credentials.
    pub fn uri(&self) -> String {
        format!("rtsp://{}:{}{}", self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Connecting,
    Started,
}

/// Asynchronous notifications from an [`RtspClient`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A heartbeat failed; the session is stopped and reconnection begins.
    ConnectionLost,
    /// Reconnected and recording again.
    ConnectionRecovered,
    /// The reconnect loop gave up, e.g. because credentials were rejected.
    Error(RtspError),
}

pub type ClientEventHandler = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// One RTSP control connection to the ingest server.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: InterleavedWriter,
    stream: TcpStream,
    credentials: Option<Credentials>,
    challenge: Option<Challenge>,
    cseq: u32,
    session_id: Option<String>,
}

impl Connection {
    fn open(config: &ClientConfig) -> Result<Self> {
        let unreachable =
            |e: std::io::Error| RtspError::Connectivity(format!("{}:{}: {e}", config.host, config.port));
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(unreachable)?
            .next()
            .ok_or_else(|| RtspError::Connectivity(format!("cannot resolve {}", config.host)))?;
        let stream = TcpStream::connect_timeout(&addr, config.timeout).map_err(unreachable)?;
        stream.set_read_timeout(Some(config.timeout))?;
        stream.set_write_timeout(Some(config.timeout))?;
        let _ = stream.set_nodelay(true);

        tracing::debug!(%addr, "connected to ingest server");
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: InterleavedWriter::new(stream.try_clone()?),
            stream,
            credentials: config.credentials.clone(),
            challenge: None,
            cseq: 0,
            session_id: None,
        })
    }

    fn local_ip(&self) -> Option<IpAddr> {
        self.stream.local_addr().ok().map(|addr| addr.ip())
    }

    /// Send one request and read its response.
    fn exchange(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        self.cseq += 1;
        let mut request = request
            .clone()
            .add_header("CSeq", self.cseq.to_string())
            .add_header("User-Agent", USER_AGENT);
        if let Some(session_id) = &self.session_id {
            request = request.add_header("Session", session_id.as_str());
        }
        if let (Some(challenge), Some(credentials)) = (&self.challenge, &self.credentials) {
            let authorization = challenge.authorization(credentials, &request.method, &request.uri);
            request = request.add_header("Authorization", authorization);
        }

        tracing::debug!(method = %request.method, uri = %request.uri, cseq = self.cseq, "request");
        self.writer
            .write_message(request.serialize().as_bytes())
            .map_err(|e| RtspError::Connectivity(format!("write failed: {e}")))?;

        let expected = self.cseq.to_string();
        loop {
            let message = match protocol::read_message(&mut self.reader) {
                Ok(Some(message)) => message,
                Ok(None) => return Err(RtspError::Connectivity("server closed the connection".into())),
                Err(RtspError::Io(e)) => return Err(RtspError::Connectivity(format!("read failed: {e}"))),
                Err(e) => return Err(e),
            };
            let mut response = RtspResponse::parse(&message.head)?;
            if !message.body.is_empty() {
                response.body = Some(message.body);
            }
            match response.get_header("CSeq") {
                Some(cseq) if cseq.trim() != expected => {
                    tracing::debug!(cseq, expected, "skipping stale response");
                }
                _ => {
                    tracing::debug!(status = response.status_code, "response");
                    return Ok(response);
                }
            }
        }
    }

    /// Send a request, answering a `401` challenge once. A second `401`
    /// means the credentials were rejected.
    fn request(&mut self, request: RtspRequest) -> Result<RtspResponse> {
        let mut response = self.exchange(&request)?;
        if response.status_code == 401 {
            if self.credentials.is_none() {
                return Err(RtspError::Authentication("server requires credentials".into()));
            }
            if self.challenge.is_some() {
                return Err(RtspError::Authentication("credentials rejected".into()));
            }
            let header = response
                .get_header("WWW-Authenticate")
                .ok_or_else(|| RtspError::Authentication("401 without WWW-Authenticate".into()))?;
            self.challenge = Some(Challenge::parse(header)?);
            response = self.exchange(&request)?;
            if response.status_code == 401 {
                return Err(RtspError::Authentication("credentials rejected".into()));
            }
        }
        if !response.is_success() {
            return Err(RtspError::Protocol(format!(
                "{} answered {} {}",
                request.method, response.status_code, response.status_text
            )));
        }
        Ok(response)
    }

    /// Best-effort TEARDOWN, then close.
    fn close(mut self, uri: &str) {
        if self.session_id.is_some() {
            let teardown = RtspRequest::new("TEARDOWN", uri);
            if let Err(e) = self.exchange(&teardown) {
                tracing::debug!(error = %e, "TEARDOWN failed");
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct Shared {
    config: ClientConfig,
    session: Arc<Session>,
    events: Option<ClientEventHandler>,
    state: Mutex<ClientState>,
    connection: Mutex<Option<Connection>>,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            events(event);
        }
    }

    /// Full handshake on a fresh connection, then start the session.
    fn connect(&self) -> Result<()> {
        let mut conn = Connection::open(&self.config)?;
        let uri = self.config.uri();

        self.session.set_destination(self.config.host.clone());
        if let Some(ip) = conn.local_ip() {
            self.session.set_origin(ip.to_string());
        }
        self.session.configure()?;
        let sdp = self.session.session_description()?;

        conn.request(RtspRequest::new("ANNOUNCE", &uri).with_body("application/sdp", sdp))?;

        for id in self.session.track_ids() {
            self.setup_track(&mut conn, &uri, id)?;
        }

        conn.request(RtspRequest::new("RECORD", &uri).add_header("Range", "npt=0.000-"))?;
        self.session.start()?;

        tracing::info!(uri = %uri, session_id = conn.session_id.as_deref().unwrap_or_default(), "recording");
        *self.connection.lock() = Some(conn);
        Ok(())
    }

    fn setup_track(&self, conn: &mut Connection, uri: &str, id: usize) -> Result<()> {
        let track_uri = format!("{}/trackID={id}", uri.trim_end_matches('/'));
        let requested = match self.config.transport {
            ClientTransport::Udp => TransportHeader {
                client_port: Some(self.session.track_local_ports(id)?),
                mode: Some("record".into()),
                ..TransportHeader::default()
            },
            ClientTransport::Tcp => {
                let channel = (id * 2) as u8;
                TransportHeader {
                    lower: LowerTransport::Tcp,
                    interleaved: Some((channel, channel + 1)),
                    mode: Some("record".into()),
                    ..TransportHeader::default()
                }
            }
        };

        let response = conn.request(
            RtspRequest::new("SETUP", &track_uri).add_header("Transport", requested.to_string()),
        )?;

        if let Some(session) = response.get_header("Session") {
            let id = session.split(';').next().unwrap_or(session).trim();
            conn.session_id = Some(id.to_string());
        }
        let granted = response
            .get_header("Transport")
            .map(TransportHeader::parse)
            .transpose()?
            .unwrap_or_else(|| requested.clone());

        match self.config.transport {
            ClientTransport::Udp => {
                let (rtp, rtcp) = granted.server_port.ok_or_else(|| {
                    RtspError::Protocol(format!("SETUP {track_uri}: no server_port in reply"))
                })?;
                self.session.set_track_destination_ports(id, rtp, rtcp)?;
            }
            ClientTransport::Tcp => {
                let (channel, _) = granted
                    .interleaved
                    .or(requested.interleaved)
                    .unwrap_or_default();
                self.session
                    .set_track_interleaved(id, conn.writer.clone(), channel)?;
            }
        }
        tracing::debug!(track = id, transport = %granted, "track set up");
        Ok(())
    }

    fn heartbeat(&self) -> Result<()> {
        let mut connection = self.connection.lock();
        let conn = connection
            .as_mut()
            .ok_or_else(|| RtspError::Connectivity("not connected".into()))?;
        conn.request(RtspRequest::new("OPTIONS", &self.config.uri()))?;
        Ok(())
    }

    /// Move from `from` to `to` unless `stop` changed the state meanwhile.
    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn drop_connection(&self) {
        if let Some(conn) = self.connection.lock().take() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }

    /// Heartbeat while started, reconnect while connecting. Exits on stop
    /// or when credentials are rejected.
    fn schedule(&self, stop: &Receiver<()>) {
        loop {
            let state = *self.state.lock();
            let wait = match state {
                ClientState::Started => self.config.heartbeat_interval,
                ClientState::Connecting => self.config.reconnect_delay,
                ClientState::Stopped => break,
            };
            match stop.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }

            match state {
                ClientState::Started => {
                    if let Err(e) = self.heartbeat() {
                        tracing::warn!(error = %e, "heartbeat failed, reconnecting");
                        self.session.stop();
                        self.drop_connection();
                        if self.transition(ClientState::Started, ClientState::Connecting) {
                            self.emit(ClientEvent::ConnectionLost);
                        }
                    }
                }
                ClientState::Connecting => match self.connect() {
                    Ok(()) => {
                        if self.transition(ClientState::Connecting, ClientState::Started) {
                            tracing::info!("connection recovered");
                            self.emit(ClientEvent::ConnectionRecovered);
                        }
                    }
                    Err(e @ RtspError::Authentication(_)) => {
                        tracing::error!(error = %e, "giving up reconnecting");
                        self.session.stop();
                        if self.transition(ClientState::Connecting, ClientState::Stopped) {
                            self.emit(ClientEvent::Error(e));
                        }
                        break;
                    }
                    Err(e) => {
                        self.session.stop();
                        tracing::debug!(error = %e, "reconnect attempt failed");
                    }
                },
                ClientState::Stopped => break,
            }
        }
        tracing::debug!("client scheduler exited");
    }
}

struct Scheduler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
    thread: ThreadId,
}

/// Pushes a [`Session`] to a remote ingest server.
pub struct RtspClient {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl RtspClient {
    pub fn new(session: Arc<Session>, config: ClientConfig) -> Self {
        Self::build(session, config, None)
    }

    pub fn with_events(
        session: Arc<Session>,
        config: ClientConfig,
        events: impl Fn(ClientEvent) + Send + Sync + 'static,
    ) -> Self {
        Self::build(session, config, Some(Arc::new(events)))
    }

    fn build(session: Arc<Session>, config: ClientConfig, events: Option<ClientEventHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                session,
                events,
                state: Mutex::new(ClientState::Stopped),
                connection: Mutex::new(None),
            }),
            scheduler: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    /// Connect, authenticate, SETUP every track, RECORD and start the
    /// session. Errors of this first attempt are returned; later
    /// connection losses are handled in the background.
    pub fn start_stream(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != ClientState::Stopped {
                return Err(RtspError::AlreadyRunning);
            }
            *state = ClientState::Connecting;
        }

        if let Err(e) = self.shared.connect() {
            tracing::warn!(uri = %self.shared.config.uri(), error = %e, "cannot start stream");
            self.shared.session.stop();
            self.shared.drop_connection();
            *self.shared.state.lock() = ClientState::Stopped;
            return Err(e);
        }
        *self.shared.state.lock() = ClientState::Started;

        let (stop_tx, stop_rx) = bounded(1);
        let shared = self.shared.clone();
        let handle = thread::spawn(move || shared.schedule(&stop_rx));
        *self.scheduler.lock() = Some(Scheduler {
            stop_tx,
            thread: handle.thread().id(),
            handle,
        });
        Ok(())
    }

    /// Stop streaming, send TEARDOWN and close the connection. Safe to call
    /// repeatedly.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.shared.state.lock(), ClientState::Stopped);

        if let Some(scheduler) = self.scheduler.lock().take() {
            let _ = scheduler.stop_tx.try_send(());
            if thread::current().id() != scheduler.thread {
                let _ = scheduler.handle.join();
            }
        }
        if previous == ClientState::Stopped {
            return;
        }

        self.shared.session.stop();
        let connection = self.shared.connection.lock().take();
        if let Some(conn) = connection {
            conn.close(&self.shared.config.uri());
        }
        tracing::info!("stream stopped");
    }
}

impl Drop for RtspClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for RtspClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtspClient")
            .field("uri", &self.shared.config.uri())
            .field("state", &self.state())
            .finish()
    }
}
