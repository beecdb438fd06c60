//! Real-time RTP/RTCP streaming engine with an RTSP server (pull) and an
//! announcing RTSP client (push).
//!
//! Encoded audio and video come from a [`MediaEncoder`](media::source::MediaEncoder)
//! supplied by the caller. A [`Session`] packetizes each track, paces the
//! packets onto UDP or the RTSP connection and sends RTCP sender reports.

pub mod client;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{ClientConfig, ClientEvent, ClientTransport, RtspClient};
pub use error::{Result, RtspError};
pub use media::Packetizer;
pub use server::{RtspServer, ServerConfig};
pub use session::{Session, SessionBuilder, SessionEvent};
