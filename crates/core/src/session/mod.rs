//! Media session: at most one audio and one video [`Track`].
//!
//! Lifecycle operations (configure, start, stop, track replacement) run on
//! one worker thread per session, in submission order. Each has a blocking
//! variant returning the typed error and an `_async` variant that returns
//! immediately and reports failures through [`SessionEvent::Error`].
//!
//! The RTSP server builds one session per connection; the push client
//! drives a session it is handed.

pub mod builder;
pub mod track;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::media::source::EncoderFactory;
use crate::protocol::sdp::SessionDescription;
use crate::transport::{InterleavedWriter, Resolver, TransportConfig};

pub use builder::SessionBuilder;
pub use track::{Codec, CodecParameters, Quality, Track, TrackKind};

const BITRATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Notifications from a [`Session`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Configured,
    Started,
    Stopped,
    /// Combined outgoing bitrate of all tracks, bits per second.
    BitrateUpdate(u64),
    /// An operation or a running track failed. `track` is the track id when
    /// the failure belongs to one track.
    Error {
        track: Option<usize>,
        error: RtspError,
    },
}

pub type EventHandler = Arc<dyn Fn(SessionEvent) + Send + Sync>;

type Job = Box<dyn FnOnce(&Inner) + Send>;

enum Message {
    Run(Job),
    Shutdown,
}

struct State {
    tracks: [Option<Track>; 2],
    destination: Option<String>,
    origin: String,
    ttl: u32,
}

impl State {
    fn track_mut(&mut self, id: usize) -> Result<&mut Track> {
        self.tracks
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(RtspError::TrackNotFound(id))
    }

    fn track(&self, id: usize) -> Result<&Track> {
        self.tracks
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(RtspError::TrackNotFound(id))
    }
}

struct BitratePoller {
    stop_tx: Sender<()>,
    active: Arc<AtomicBool>,
}

/// Session state shared with the worker thread.
struct Inner {
    me: Weak<Inner>,
    state: Mutex<State>,
    factory: Arc<dyn EncoderFactory>,
    resolver: Arc<dyn Resolver>,
    events: Option<EventHandler>,
    transport_config: TransportConfig,
    poller: Mutex<Option<BitratePoller>>,
    jobs: Sender<Message>,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            events(event);
        }
    }

    fn fail(&self, track: Option<usize>, error: RtspError) -> RtspError {
        tracing::warn!(track, error = %error, "session operation failed");
        self.emit(SessionEvent::Error {
            track,
            error: error.clone(),
        });
        error
    }

    fn configure(&self) -> Result<()> {
        let failure = {
            let mut state = self.state.lock();
            state
                .tracks
                .iter_mut()
                .flatten()
                .find_map(|track| track.configure().err().map(|e| (track.kind().id(), e)))
        };
        if let Some((id, error)) = failure {
            return Err(self.fail(Some(id), error));
        }
        self.emit(SessionEvent::Configured);
        Ok(())
    }

    /// Resolve the destination host once for this start.
    fn resolve(&self) -> Result<Option<IpAddr>> {
        let host = self.state.lock().destination.clone();
        let Some(host) = host else {
            return Ok(None);
        };
        self.resolver
            .resolve(&host)
            .map(Some)
            .map_err(|e| RtspError::Connectivity(format!("cannot resolve {host}: {e}")))
    }

    fn start(&self) -> Result<()> {
        let ip = self.resolve().map_err(|e| self.fail(None, e))?;
        let failure = {
            let mut state = self.state.lock();
            let ttl = state.ttl;
            state
                .tracks
                .iter_mut()
                .flatten()
                .find_map(|track| self.start_track_locked(track, ip, ttl).err().map(|e| (track.kind().id(), e)))
        };
        if let Some((id, error)) = failure {
            return Err(self.fail(Some(id), error));
        }
        self.ensure_poller();
        self.emit(SessionEvent::Started);
        Ok(())
    }

    fn start_track(&self, id: usize) -> Result<()> {
        let ip = self.resolve().map_err(|e| self.fail(Some(id), e))?;
        let result = {
            let mut state = self.state.lock();
            let ttl = state.ttl;
            state
                .track_mut(id)
                .and_then(|track| self.start_track_locked(track, ip, ttl))
        };
        result.map_err(|e| self.fail(Some(id), e))?;
        self.ensure_poller();
        Ok(())
    }

    fn start_track_locked(&self, track: &mut Track, ip: Option<IpAddr>, ttl: u32) -> Result<()> {
        if track.is_streaming() {
            return Ok(());
        }
        if ttl > 0 {
            track.transport().set_ttl(ttl)?;
        }
        let jobs = self.jobs.clone();
        let id = track.kind().id();
        track.start(ip, move |error| {
            let job: Job = Box::new(move |inner| inner.track_failed(id, error));
            let _ = jobs.send(Message::Run(job));
        })
    }

    fn track_failed(&self, id: usize, error: RtspError) {
        if let Ok(track) = self.state.lock().track_mut(id) {
            track.stop();
        }
        self.fail(Some(id), error);
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock();
            for track in state.tracks.iter_mut().flatten() {
                track.stop();
            }
        }
        self.halt_poller();
        self.emit(SessionEvent::Stopped);
    }

    fn stop_track(&self, id: usize) -> Result<()> {
        self.state.lock().track_mut(id)?.stop();
        Ok(())
    }

    fn set_track(&self, codec: Codec, quality: Quality) -> Result<()> {
        let kind = codec.kind();
        let encoder = self.factory.create(kind, codec)?;
        let track = Track::new(codec, quality, encoder, self.transport_config.clone())?;
        // The replaced track stops when dropped, outside the lock.
        let _old = self.state.lock().tracks[kind.id()].replace(track);
        tracing::debug!(%codec, "session track set");
        Ok(())
    }

    fn remove_track(&self, id: usize) -> Result<()> {
        if TrackKind::from_id(id).is_none() {
            return Err(RtspError::TrackNotFound(id));
        }
        let _old = self.state.lock().tracks[id].take();
        Ok(())
    }

    fn bitrate(&self) -> u64 {
        self.state
            .lock()
            .tracks
            .iter()
            .flatten()
            .map(|track| track.transport().bitrate())
            .sum()
    }

    fn ensure_poller(&self) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let active = Arc::new(AtomicBool::new(true));
        let still_active = active.clone();
        let me = self.me.clone();
        thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(BITRATE_POLL_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(inner) = me.upgrade() else {
                    break;
                };
                let bitrate = inner.bitrate();
                if !still_active.load(Ordering::SeqCst) {
                    break;
                }
                inner.emit(SessionEvent::BitrateUpdate(bitrate));
            }
            tracing::trace!("bitrate poller exited");
        });
        *poller = Some(BitratePoller { stop_tx, active });
    }

    fn halt_poller(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.active.store(false, Ordering::SeqCst);
            let _ = poller.stop_tx.try_send(());
        }
    }

    fn shutdown(&self) {
        let tracks: Vec<Track> = {
            let mut state = self.state.lock();
            state.tracks.iter_mut().filter_map(Option::take).collect()
        };
        drop(tracks);
        self.halt_poller();
    }
}

/// Up to one audio and one video track sharing a destination.
///
/// Created by [`SessionBuilder::build`]. Dropping the session stops every
/// track and joins the worker thread.
pub struct Session {
    inner: Arc<Inner>,
    jobs: Sender<Message>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl Session {
    pub(crate) fn new(
        factory: Arc<dyn EncoderFactory>,
        resolver: Arc<dyn Resolver>,
        events: Option<EventHandler>,
        transport_config: TransportConfig,
        destination: Option<String>,
        origin: String,
        ttl: u32,
    ) -> Self {
        let (jobs, rx) = unbounded::<Message>();
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            state: Mutex::new(State {
                tracks: [None, None],
                destination,
                origin,
                ttl,
            }),
            factory,
            resolver,
            events,
            transport_config,
            poller: Mutex::new(None),
            jobs: jobs.clone(),
        });

        let worker_inner = inner.clone();
        let worker = thread::spawn(move || {
            for message in rx {
                match message {
                    Message::Run(job) => job(&worker_inner),
                    Message::Shutdown => {
                        worker_inner.shutdown();
                        break;
                    }
                }
            }
            tracing::trace!("session worker exited");
        });

        Self {
            inner,
            jobs,
            worker_id: worker.thread().id(),
            worker: Some(worker),
        }
    }

    /// Run `f` on the worker and wait for its result. Called from the worker
    /// itself (an event handler), `f` runs inline.
    fn run<T: Send + 'static>(&self, f: impl FnOnce(&Inner) -> Result<T> + Send + 'static) -> Result<T> {
        if thread::current().id() == self.worker_id {
            return f(&self.inner);
        }
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move |inner| {
            let _ = tx.send(f(inner));
        });
        self.jobs
            .send(Message::Run(job))
            .map_err(|_| RtspError::Transport("session worker stopped".into()))?;
        rx.recv()
            .map_err(|_| RtspError::Transport("session worker stopped".into()))?
    }

    fn run_async(&self, f: impl FnOnce(&Inner) + Send + 'static) {
        let job: Job = Box::new(f);
        if self.jobs.send(Message::Run(job)).is_err() {
            tracing::warn!("session worker stopped, dropping operation");
        }
    }

    /// Run every present, non-streaming track's encoder configuration,
    /// audio first. Stops at the first failure.
    pub fn configure(&self) -> Result<()> {
        self.run(|inner| inner.configure())
    }

    pub fn configure_async(&self) {
        self.run_async(|inner| {
            let _ = inner.configure();
        });
    }

    /// Start every track. Tracks already streaming are left alone.
    pub fn start(&self) -> Result<()> {
        self.run(|inner| inner.start())
    }

    pub fn start_async(&self) {
        self.run_async(|inner| {
            let _ = inner.start();
        });
    }

    /// Stop every track and the bitrate polling.
    pub fn stop(&self) {
        let _ = self.run(|inner| {
            inner.stop();
            Ok(())
        });
    }

    pub fn stop_async(&self) {
        self.run_async(|inner| inner.stop());
    }

    pub fn start_track(&self, id: usize) -> Result<()> {
        self.run(move |inner| inner.start_track(id))
    }

    pub fn stop_track(&self, id: usize) -> Result<()> {
        self.run(move |inner| inner.stop_track(id))
    }

    /// Add a track, replacing (and stopping) any track of the same kind.
    pub fn set_track(&self, codec: Codec, quality: Quality) -> Result<()> {
        self.run(move |inner| inner.set_track(codec, quality))
    }

    pub fn remove_track(&self, id: usize) -> Result<()> {
        self.run(move |inner| inner.remove_track(id))
    }

    /// Host or address media is sent to. Resolved at each start.
    pub fn set_destination(&self, host: impl Into<String>) {
        self.inner.state.lock().destination = Some(host.into());
    }

    pub fn destination(&self) -> Option<String> {
        self.inner.state.lock().destination.clone()
    }

    /// Multicast TTL applied to every track at start. Zero keeps the
    /// system default.
    pub fn set_ttl(&self, ttl: u32) {
        self.inner.state.lock().ttl = ttl;
    }

    /// Address announced in the SDP `o=` line.
    pub fn set_origin(&self, origin: impl Into<String>) {
        self.inner.state.lock().origin = origin.into();
    }

    pub fn set_track_destination_ports(&self, id: usize, rtp: u16, rtcp: u16) -> Result<()> {
        self.inner.state.lock().track_mut(id)?.set_destination_ports(rtp, rtcp);
        Ok(())
    }

    pub fn set_track_interleaved(&self, id: usize, writer: InterleavedWriter, channel: u8) -> Result<()> {
        self.inner.state.lock().track_mut(id)?.set_interleaved(writer, channel);
        Ok(())
    }

    pub fn has_track(&self, id: usize) -> bool {
        self.inner.state.lock().track(id).is_ok()
    }

    /// Ids of the present tracks, in order.
    pub fn track_ids(&self) -> Vec<usize> {
        self.inner
            .state
            .lock()
            .tracks
            .iter()
            .flatten()
            .map(|track| track.kind().id())
            .collect()
    }

    pub fn track_codec(&self, id: usize) -> Result<Codec> {
        Ok(self.inner.state.lock().track(id)?.codec())
    }

    /// Local (RTP, RTCP) ports of a track's transport.
    pub fn track_local_ports(&self, id: usize) -> Result<(u16, u16)> {
        Ok(self.inner.state.lock().track(id)?.transport().local_ports())
    }

    pub fn track_ssrc(&self, id: usize) -> Result<u32> {
        Ok(self.inner.state.lock().track(id)?.transport().ssrc())
    }

    pub fn track_next_sequence(&self, id: usize) -> Result<u16> {
        Ok(self.inner.state.lock().track(id)?.transport().next_sequence())
    }

    pub fn track_is_streaming(&self, id: usize) -> bool {
        self.inner
            .state
            .lock()
            .track(id)
            .is_ok_and(Track::is_streaming)
    }

    /// Whether any track is streaming.
    pub fn is_streaming(&self) -> bool {
        self.inner
            .state
            .lock()
            .tracks
            .iter()
            .flatten()
            .any(Track::is_streaming)
    }

    /// Combined outgoing bitrate, bits per second.
    pub fn bitrate(&self) -> u64 {
        self.inner.bitrate()
    }

    /// SDP describing every present track.
    pub fn session_description(&self) -> Result<String> {
        let state = self.inner.state.lock();
        let destination = state
            .destination
            .clone()
            .ok_or(RtspError::DestinationNotSet)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let description = SessionDescription {
            origin: state.origin.clone(),
            timestamp,
            destination,
            media: state
                .tracks
                .iter()
                .flatten()
                .map(Track::media_description)
                .collect(),
        };
        Ok(description.to_string())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.jobs.send(Message::Shutdown);
        if let Some(worker) = self.worker.take()
            && thread::current().id() != self.worker_id
        {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Session")
            .field("tracks", &state.tracks)
            .field("destination", &state.destination)
            .field("origin", &state.origin)
            .field("ttl", &state.ttl)
            .finish()
    }
}
