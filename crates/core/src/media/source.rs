//! Elementary-stream producers consumed by the packetizers.
//!
//! Capture and encoding live outside this crate. They are reached through
//! two traits:
//!
//! - [`MediaEncoder`] configures a codec for a [`Quality`] and exposes the
//!   resulting parameter sets (SPS/PPS, AAC config) before streaming.
//! - [`MediaSource`] is the running encoder output: blocking byte reads plus
//!   an optional presentation time for the unit currently being read.
//!
//! Two sources are provided: [`ChannelSource`] for frames pushed from another
//! thread, and [`ReaderSource`] for any `std::io::Read` (files, pipes).

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select};

use crate::error::Result;
use crate::session::track::{Codec, CodecParameters, Quality, TrackKind};

/// Blocking elementary-stream reader.
///
/// `read` returns `Ok(0)` at end of stream or once the source was closed
/// through its [`SourceCloser`]. Sources that deliver demuxed access units
/// never merge two units into one `read` call, so a caller with a large
/// enough buffer reads exactly one unit per call.
pub trait MediaSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Presentation time of the unit the last `read` returned bytes from.
    fn presentation_time(&self) -> Option<Duration> {
        None
    }

    /// Whether the last `read` ended exactly at the end of an encoded unit.
    /// Lets stream parsers emit a unit without waiting for the next one.
    fn at_unit_boundary(&self) -> bool {
        false
    }

    /// Handle that unblocks a pending `read` from another thread.
    fn closer(&self) -> SourceCloser;
}

/// Thread-safe close action for a [`MediaSource`].
#[derive(Clone)]
pub struct SourceCloser(Arc<dyn Fn() + Send + Sync>);

impl SourceCloser {
    pub fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(close))
    }

    pub fn close(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for SourceCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SourceCloser")
    }
}

/// Fill `buf` completely, failing with `UnexpectedEof` when the source ends.
pub fn read_exact(source: &mut dyn MediaSource, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// One encoded unit handed to a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Vec<u8>,
    pub pts: Option<Duration>,
}

impl MediaFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pts: None }
    }

    pub fn with_pts(data: Vec<u8>, pts: Duration) -> Self {
        Self {
            data,
            pts: Some(pts),
        }
    }
}

/// Source fed with [`MediaFrame`]s over a bounded channel.
///
/// The producer blocks when `capacity` frames are queued. Dropping every
/// sender ends the stream.
pub struct ChannelSource {
    frames: Receiver<MediaFrame>,
    close_rx: Receiver<()>,
    close_tx: Sender<()>,
    closed: Arc<AtomicBool>,
    current: Option<MediaFrame>,
    offset: usize,
    pts: Option<Duration>,
}

impl ChannelSource {
    pub fn channel(capacity: usize) -> (Sender<MediaFrame>, Self) {
        let (tx, frames) = bounded(capacity);
        let (close_tx, close_rx) = bounded(1);
        let source = Self {
            frames,
            close_rx,
            close_tx,
            closed: Arc::new(AtomicBool::new(false)),
            current: None,
            offset: 0,
            pts: None,
        };
        (tx, source)
    }
}

impl MediaSource for ChannelSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) || buf.is_empty() {
            return Ok(0);
        }

        if self.current.is_none() {
            select! {
                recv(self.frames) -> frame => match frame {
                    Ok(frame) => {
                        self.pts = frame.pts;
                        self.offset = 0;
                        self.current = Some(frame);
                    }
                    Err(_) => return Ok(0),
                },
                recv(self.close_rx) -> _ => return Ok(0),
            }
        }

        let Some(frame) = self.current.as_ref() else {
            return Ok(0);
        };
        let remaining = &frame.data[self.offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        if self.offset >= frame.data.len() {
            self.current = None;
        }
        Ok(n)
    }

    fn presentation_time(&self) -> Option<Duration> {
        self.pts
    }

    fn at_unit_boundary(&self) -> bool {
        self.current.is_none()
    }

    fn closer(&self) -> SourceCloser {
        let closed = self.closed.clone();
        let tx = self.close_tx.clone();
        SourceCloser::new(move || {
            closed.store(true, Ordering::SeqCst);
            let _ = tx.try_send(());
        })
    }
}

/// Source over any blocking reader.
///
/// A reader that can block indefinitely (pipe, FIFO, socket) needs a
/// shutdown action given through [`with_closer`](Self::with_closer), so that
/// closing the source also wakes a `read` blocked inside the inner reader.
/// Without one, closing only takes effect between reads.
pub struct ReaderSource<R> {
    inner: R,
    closed: Arc<AtomicBool>,
    shutdown: Option<SourceCloser>,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: None,
        }
    }

    /// `shutdown` runs when the source is closed and must make a pending
    /// `inner.read` return, e.g. by shutting down the socket it reads from.
    pub fn with_closer(inner: R, shutdown: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Some(SourceCloser::new(shutdown)),
        }
    }
}

impl<R: Read + Send> MediaSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        match self.inner.read(buf) {
            // Whatever a shut-down reader returns, a closed source has ended.
            _ if self.closed.load(Ordering::SeqCst) => Ok(0),
            result => result,
        }
    }

    fn closer(&self) -> SourceCloser {
        let closed = self.closed.clone();
        let shutdown = self.shutdown.clone();
        SourceCloser::new(move || {
            if !closed.swap(true, Ordering::SeqCst)
                && let Some(shutdown) = &shutdown
            {
                shutdown.close();
            }
        })
    }
}

/// Codec configuration and output collaborator for one track.
///
/// `configure` is called before any SDP is produced and must return the
/// parameter sets the stream will carry. `open` starts encoding and hands
/// back the elementary stream; `close` releases the encoder.
pub trait MediaEncoder: Send {
    fn configure(&mut self, codec: Codec, quality: &Quality) -> Result<CodecParameters>;

    fn open(&mut self) -> Result<Box<dyn MediaSource>>;

    fn close(&mut self) {}
}

/// Creates the encoder behind a track when a session adds it.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, kind: TrackKind, codec: Codec) -> Result<Box<dyn MediaEncoder>>;
}

impl<F> EncoderFactory for F
where
    F: Fn(TrackKind, Codec) -> Result<Box<dyn MediaEncoder>> + Send + Sync,
{
    fn create(&self, kind: TrackKind, codec: Codec) -> Result<Box<dyn MediaEncoder>> {
        self(kind, codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::thread;

    #[test]
    fn channel_source_reads_one_frame_per_call() {
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send(MediaFrame::with_pts(vec![1, 2, 3], Duration::from_millis(40)))
            .unwrap();
        tx.send(MediaFrame::new(vec![4, 5])).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(source.presentation_time(), Some(Duration::from_millis(40)));
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(source.presentation_time(), None);

        drop(tx);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn channel_source_splits_large_frame() {
        let (tx, mut source) = ChannelSource::channel(1);
        tx.send(MediaFrame::new(vec![7; 10])).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert!(!source.at_unit_boundary());
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert!(source.at_unit_boundary());
    }

    #[test]
    fn closer_unblocks_pending_read() {
        let (_tx, mut source) = ChannelSource::channel(1);
        let closer = source.closer();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            source.read(&mut buf).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        closer.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn read_exact_reports_eof() {
        let mut source = ReaderSource::new(Cursor::new(vec![1u8, 2]));
        let mut buf = [0u8; 3];
        let err = read_exact(&mut source, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn reader_source_closer_unblocks_socket_read() {
        use std::net::{Shutdown, TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let handle = stream.try_clone().unwrap();
        let mut source = ReaderSource::with_closer(stream, move || {
            let _ = handle.shutdown(Shutdown::Both);
        });

        let closer = source.closer();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            source.read(&mut buf).unwrap()
        });
        thread::sleep(Duration::from_millis(50));
        closer.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn reader_source_stops_after_close() {
        let mut source = ReaderSource::new(Cursor::new(vec![1u8; 8]));
        source.closer().close();
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }
}
