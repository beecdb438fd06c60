use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::RtspError;
use crate::protocol::{self, MethodHandler, RtspRequest, RtspResponse};
use crate::server::ServerConfig;
use crate::session::SessionBuilder;

/// A stalled viewer must not block the packetizers forever.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes `$`-framed packets (RFC 2326 §10.12) and RTSP messages onto one
/// shared stream.
///
/// Every call writes its whole frame under one lock, so frames from several
/// tracks and responses from the connection never interleave.
#[derive(Clone)]
pub struct InterleavedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl InterleavedWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write `$ <channel> <len16> <payload>`.
    pub fn write_frame(&self, channel: u8, payload: &[u8]) -> io::Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interleaved payload of {} bytes", payload.len()),
            )
        })?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.push(b'$');
        frame.push(channel);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);

        let mut writer = self.inner.lock();
        writer.write_all(&frame)?;
        writer.flush()
    }

    /// Write a complete RTSP message.
    pub fn write_message(&self, message: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock();
        writer.write_all(message)?;
        writer.flush()
    }
}

impl fmt::Debug for InterleavedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InterleavedWriter")
    }
}

/// Open connections, kept so the server can shut them down on stop.
#[derive(Clone, Default)]
pub(crate) struct ConnectionRegistry {
    streams: Arc<Mutex<HashMap<u64, TcpStream>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    fn register(&self, stream: TcpStream) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(id, stream);
        id
    }

    fn unregister(&self, id: u64) {
        self.streams.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Unblock every connection thread.
    pub(crate) fn shutdown_all(&self) {
        for (_, stream) in self.streams.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::RtspServer::stop`] can terminate it promptly.
/// Joins every connection thread before returning.
pub(crate) fn accept_loop(
    listener: TcpListener,
    sessions: SessionBuilder,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
    registry: ConnectionRegistry,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sessions = sessions.clone();
                let config = config.clone();
                let running = running.clone();
                let registry = registry.clone();
                connections.push(thread::spawn(move || {
                    Connection::handle(stream, sessions, config, running, registry);
                }));
                connections.retain(|handle| !handle.is_finished());
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }

    registry.shutdown_all();
    for connection in connections {
        let _ = connection.join();
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own session.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: InterleavedWriter,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(
        stream: TcpStream,
        sessions: SessionBuilder,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
        registry: ConnectionRegistry,
    ) {
        let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            _ => return,
        };

        tracing::info!(%peer_addr, "client connected");

        if !config.session_timeout.is_zero() {
            let _ = stream.set_read_timeout(Some(config.session_timeout));
        }
        let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));

        let (Ok(reader_stream), Ok(writer_stream), Ok(registered)) =
            (stream.try_clone(), stream.try_clone(), stream.try_clone())
        else {
            return;
        };
        let registration = registry.register(registered);
        // The server may have stopped between accept and registration.
        if !running.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let session = match sessions.build() {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "cannot create session");
                registry.unregister(registration);
                return;
            }
        };
        let origin = config
            .public_host
            .clone()
            .unwrap_or_else(|| local_addr.ip().to_string());
        session.set_origin(origin);

        let writer = InterleavedWriter::new(writer_stream);
        let handler = MethodHandler::new(session, peer_addr, config, writer.clone());

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
        };

        let reason = conn.run(&running);
        conn.handler.shutdown();
        let _ = stream.shutdown(Shutdown::Both);
        registry.unregister(registration);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let message = match protocol::read_message(&mut self.reader) {
                Ok(Some(message)) => message,
                Ok(None) => return "connection closed by client",
                Err(RtspError::Io(e))
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return "session timed out";
                }
                Err(e @ RtspError::Parse { .. }) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "malformed message");
                    if self.respond(&RtspResponse::bad_request()).is_err() {
                        return "write error";
                    }
                    continue;
                }
                Err(e) => {
                    tracing::debug!(peer = %self.peer_addr, error = %e, "read failed");
                    return "read error";
                }
            };

            let mut request = match RtspRequest::parse(&message.head) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    if self.respond(&RtspResponse::bad_request()).is_err() {
                        return "write error";
                    }
                    continue;
                }
            };
            request.body = message.body;

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                version = %request.version,
                "request"
            );

            let handler = &mut self.handler;
            let response = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&request))) {
                Ok(response) => response,
                Err(_) => {
                    tracing::error!(peer = %self.peer_addr, method = %request.method, "request handler panicked");
                    RtspResponse::internal_error().add_header("CSeq", request.cseq().unwrap_or("0"))
                }
            };

            tracing::debug!(
                peer = %self.peer_addr,
                status = response.status_code,
                "response"
            );

            if self.respond(&response).is_err() {
                return "write error";
            }
            if self.handler.should_close() {
                return "teardown";
            }
        }

        "server shutting down"
    }

    fn respond(&self, response: &RtspResponse) -> io::Result<()> {
        self.writer.write_message(response.serialize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frame_layout() {
        let out = Shared::default();
        let writer = InterleavedWriter::new(out.clone());
        writer.write_frame(3, &[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(*out.0.lock(), vec![b'$', 3, 0, 3, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let out = Shared::default();
        let writer = InterleavedWriter::new(out.clone());
        let err = writer.write_frame(0, &vec![0; 70_000]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(out.0.lock().is_empty());
    }

    #[test]
    fn concurrent_frames_stay_whole() {
        let out = Shared::default();
        let writer = InterleavedWriter::new(out.clone());
        let threads: Vec<_> = (0..4u8)
            .map(|channel| {
                let writer = writer.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        writer.write_frame(channel, &[channel; 100]).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let data = out.0.lock();
        let mut i = 0;
        let mut frames = 0;
        while i < data.len() {
            assert_eq!(data[i], b'$');
            let channel = data[i + 1];
            let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
            assert_eq!(len, 100);
            assert!(data[i + 4..i + 4 + len].iter().all(|&b| b == channel));
            i += 4 + len;
            frames += 1;
        }
        assert_eq!(frames, 200);
    }
}
