//! Error types for the streaming engine.

use std::fmt;

/// Errors that can occur anywhere in the streaming stack.
///
/// Variants fall into a small taxonomy:
///
/// - **Configuration**: [`Configuration`](Self::Configuration): unsupported
///   codec or quality, missing parameter sets.
/// - **Transport**: [`Io`](Self::Io), [`Transport`](Self::Transport),
///   [`DestinationNotSet`](Self::DestinationNotSet): bind/send failures.
/// - **Protocol**: [`Parse`](Self::Parse), [`Protocol`](Self::Protocol),
///   [`UnknownMethod`](Self::UnknownMethod): malformed RTSP/RTCP traffic.
/// - **Authentication**: [`Authentication`](Self::Authentication): rejected
///   credentials. Never retried.
/// - **Connectivity**: [`Connectivity`](Self::Connectivity): peer unreachable
///   or gone. Retried by [`RtspClient`](crate::client::RtspClient) only.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested codec or quality cannot be produced.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A transport could not be bound, written or is no longer usable.
    #[error("transport error: {0}")]
    Transport(String),

    /// `start()` or SDP generation was attempted before a destination was set.
    #[error("destination address not set")]
    DestinationNotSet,

    /// Failed to parse an RTSP message (RFC 2326 §6, §7).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Peer violated the protocol (bad status, missing header, bad transport).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request used a method this endpoint does not implement.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Credentials were rejected by the remote server.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Remote peer is unreachable or the connection dropped.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// No track with the given id exists in the session.
    #[error("track not found: {0}")]
    TrackNotFound(usize),

    /// No RTSP session with the given id exists on this connection.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// [`RtspServer::start`](crate::RtspServer::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// `start()` was called while already running.
    #[error("already running")]
    AlreadyRunning,
}

impl RtspError {
    /// RTSP status code a server answers with when a request fails with this error.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::Parse { .. } | Self::Protocol(_) | Self::UnknownMethod(_) => {
                (400, "Bad Request")
            }
            Self::TrackNotFound(_) => (404, "Not Found"),
            Self::SessionNotFound(_) => (454, "Session Not Found"),
            Self::Configuration(_) => (415, "Unsupported Media Type"),
            Self::Authentication(_) => (401, "Unauthorized"),
            _ => (500, "Internal Server Error"),
        }
    }

    /// Whether a push client should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Connectivity(_) | Self::Transport(_))
    }
}

// `io::Error` is not `Clone`; a copy keeps its kind and message.
impl Clone for RtspError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Configuration(m) => Self::Configuration(m.clone()),
            Self::Transport(m) => Self::Transport(m.clone()),
            Self::DestinationNotSet => Self::DestinationNotSet,
            Self::Parse { kind } => Self::Parse { kind: *kind },
            Self::Protocol(m) => Self::Protocol(m.clone()),
            Self::UnknownMethod(m) => Self::UnknownMethod(m.clone()),
            Self::Authentication(m) => Self::Authentication(m.clone()),
            Self::Connectivity(m) => Self::Connectivity(m.clone()),
            Self::TrackNotFound(id) => Self::TrackNotFound(*id),
            Self::SessionNotFound(id) => Self::SessionNotFound(id.clone()),
            Self::NotStarted => Self::NotStarted,
            Self::AlreadyRunning => Self::AlreadyRunning,
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
