//! Media codecs and RTP packetization.
//!
//! This module provides the [`Packetizer`] trait and codec-specific
//! implementations that turn an elementary stream into RTP packets written
//! to an [`RtpTransport`].
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded unit is split into one or more RTP packets. Every RTP packet
//! carries a 12-byte fixed header ([`rtp::RtpHeader`]) containing:
//!
//! - **Sequence number** (16-bit, wrapping): assigned by the transport.
//! - **Timestamp** (32-bit): media clock, 90 kHz for video, the sampling
//!   rate for audio.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of a unit.
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | H.263 | [`h263`] | [RFC 4629](https://tools.ietf.org/html/rfc4629) |
//! | AAC | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) |
//! | AMR-NB | [`amr`] | [RFC 3267](https://tools.ietf.org/html/rfc3267) |

pub mod aac;
pub mod amr;
pub mod h263;
pub mod h264;
pub mod rtp;
pub mod source;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, RtspError};
use crate::transport::RtpTransport;
pub use source::{MediaEncoder, MediaSource, SourceCloser};

/// Codec-specific RTP packetizer.
///
/// A packetizer owns the framing rules of one codec. Its
/// [`run`](Self::run) loop reads the elementary stream, slices it into
/// payloads and commits them to the transport until the source ends or
/// fails. Threading is handled by [`PacketizerHandle`].
pub trait Packetizer: Send {
    /// Codec name for logs (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// Packetize `source` into `transport` until end of stream.
    fn run(&mut self, source: &mut dyn MediaSource, transport: &RtpTransport) -> Result<()>;
}

/// Convert a presentation time into RTP clock units.
pub(crate) fn media_time_to_rtp(pts: Duration, clock_rate: u32) -> u32 {
    (pts.as_nanos() * clock_rate as u128 / 1_000_000_000) as u32
}

/// Copy `payload` into a fresh buffer and commit it.
pub(crate) fn send_payload(
    transport: &RtpTransport,
    parts: &[&[u8]],
    timestamp: u32,
    marker: bool,
) -> Result<()> {
    let mut buffer = transport.acquire()?;
    let out = buffer.payload_mut();
    let mut len = 0;
    for part in parts {
        out[len..len + part.len()].copy_from_slice(part);
        len += part.len();
    }
    buffer.set_timestamp(timestamp);
    if marker {
        buffer.mark_last();
    }
    transport.commit(buffer, len)
}

/// Running packetizer thread bound to one source and one transport.
///
/// [`stop`](Self::stop) closes the source, which unblocks any pending read,
/// and joins the thread: once it returns the packetizer no longer touches
/// the transport.
pub struct PacketizerHandle {
    closer: SourceCloser,
    stopping: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PacketizerHandle {
    /// Spawn the packetizer thread. `on_exit` runs on that thread with the
    /// outcome, unless the exit was requested through [`stop`](Self::stop).
    pub fn start(
        mut packetizer: Box<dyn Packetizer>,
        mut source: Box<dyn MediaSource>,
        transport: Arc<RtpTransport>,
        on_exit: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Self {
        transport.set_clock_rate(packetizer.clock_rate());
        let closer = source.closer();
        let stopping = Arc::new(AtomicBool::new(false));
        let stop_flag = stopping.clone();

        let thread = thread::spawn(move || {
            let codec = packetizer.codec_name();
            tracing::debug!(codec, ssrc = format_args!("{:#010X}", transport.ssrc()), "packetizer started");

            let result = match packetizer.run(source.as_mut(), &transport) {
                Err(RtspError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::info!(codec, "elementary stream ended");
                    Ok(())
                }
                other => other,
            };

            if stop_flag.load(Ordering::SeqCst) {
                tracing::debug!(codec, "packetizer stopped");
                return;
            }
            if let Err(e) = &result {
                tracing::error!(codec, error = %e, "packetizer failed");
            }
            on_exit(result);
        });

        Self {
            closer,
            stopping,
            thread: Some(thread),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.closer.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PacketizerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
