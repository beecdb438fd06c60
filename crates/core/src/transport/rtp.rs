//! Paced RTP sender.
//!
//! Packetizers run in bursts: an encoder hands over a whole frame and the
//! packetizer turns it into dozens of packets at once. [`RtpTransport`]
//! decouples that from the wire:
//!
//! ```text
//! packetizer ──acquire()──▶ pool (bounded, 300 buffers)
//!            ──commit()───▶ FIFO ──▶ pacing thread ──▶ UDP / TCP interleaved
//!                                                   └─▶ RtcpReporter
//! ```
//!
//! The pool bound is the backpressure: when the network stalls, `acquire`
//! blocks the packetizer instead of growing memory. The pacing thread
//! sleeps by the RTP timestamp delta between consecutive packets so the
//! receiver sees the capture cadence, not the encoder's bursts.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select, unbounded};
use parking_lot::Mutex;

use super::rtcp::{DEFAULT_RTCP_INTERVAL, RtcpReporter};
use super::tcp::InterleavedWriter;
use super::udp::UdpPair;
use super::Destination;
use crate::error::{Result, RtspError};
use crate::media::rtp::{self, DEFAULT_PAYLOAD_TYPE, RTP_HEADER_LEN, RtpHeader};

/// Default number of packet buffers per transport.
pub const DEFAULT_POOL_SIZE: usize = 300;

/// Default maximum RTP payload size (fits a 1500-byte Ethernet MTU with room
/// for IP/UDP headers and interleaved framing).
pub const DEFAULT_MAX_PAYLOAD: usize = 1400;

const BITRATE_WINDOW: Duration = Duration::from_secs(5);

/// Tunables for an [`RtpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of pre-allocated packet buffers (backpressure bound).
    pub pool_size: usize,
    /// Largest payload a packetizer may put in one packet.
    pub max_payload: usize,
    /// Delay before the first packet is sent, absorbing producer jitter.
    pub cache: Duration,
    /// Interval between RTCP sender reports. Zero disables them.
    pub rtcp_interval: Duration,
    /// If the sender falls this far behind schedule it resynchronizes to
    /// the wall clock instead of bursting to catch up.
    pub max_lag: Duration,
    /// A timestamp jump larger than this is treated as a discontinuity.
    pub max_gap: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_payload: DEFAULT_MAX_PAYLOAD,
            cache: Duration::ZERO,
            rtcp_interval: DEFAULT_RTCP_INTERVAL,
            max_lag: Duration::from_millis(500),
            max_gap: Duration::from_secs(3),
        }
    }
}

/// A packet slot taken from the transport's pool.
///
/// Arrives stamped with version, payload type and SSRC. The packetizer
/// fills [`payload_mut`](Self::payload_mut), sets the timestamp and marker,
/// then hands it back with [`RtpTransport::commit`].
#[derive(Debug)]
pub struct RtpBuffer {
    data: Vec<u8>,
    timestamp: u32,
}

impl RtpBuffer {
    fn new(max_payload: usize) -> Self {
        Self {
            data: vec![0; RTP_HEADER_LEN + max_payload],
            timestamp: 0,
        }
    }

    /// Writable payload area (everything after the 12-byte header).
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[RTP_HEADER_LEN..]
    }

    /// Set the RTP marker bit.
    pub fn mark_last(&mut self) {
        rtp::set_marker(&mut self.data, true);
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
        rtp::set_timestamp(&mut self.data, timestamp);
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

struct Queued {
    buffer: RtpBuffer,
    len: usize,
}

/// Converts RTP timestamps into send deadlines.
///
/// Keeps the wall-clock time the stream has been expected to take so far
/// and compares it with what actually elapsed.
#[derive(Debug)]
struct PacingClock {
    start: Option<Instant>,
    expected: Duration,
    last_timestamp: u32,
    cache: Duration,
    max_lag: Duration,
    max_gap: Duration,
}

impl PacingClock {
    fn new(config: &TransportConfig) -> Self {
        Self {
            start: None,
            expected: Duration::ZERO,
            last_timestamp: 0,
            cache: config.cache,
            max_lag: config.max_lag,
            max_gap: config.max_gap,
        }
    }

    /// How long to wait before sending a packet stamped `timestamp`.
    fn delay(&mut self, timestamp: u32, clock_rate: u32, now: Instant) -> Duration {
        let Some(start) = self.start else {
            self.start = Some(now + self.cache);
            self.expected = Duration::ZERO;
            self.last_timestamp = timestamp;
            return self.cache;
        };

        let delta = timestamp.wrapping_sub(self.last_timestamp) as i32;
        self.last_timestamp = timestamp;
        let delta = if delta < 0 {
            tracing::warn!(timestamp, delta, "RTP timestamp went backwards");
            0
        } else {
            delta as u64
        };

        let step = Duration::from_nanos(delta * 1_000_000_000 / clock_rate.max(1) as u64);
        if step > self.max_gap {
            tracing::debug!(step_ms = step.as_millis() as u64, "timestamp discontinuity, resyncing");
            self.resync(now);
            return Duration::ZERO;
        }

        self.expected += step;
        let elapsed = now.saturating_duration_since(start);
        if elapsed > self.expected + self.max_lag {
            tracing::debug!(
                lag_ms = (elapsed - self.expected).as_millis() as u64,
                "sender behind schedule, resyncing"
            );
            self.resync(now);
            return Duration::ZERO;
        }

        self.expected.saturating_sub(elapsed)
    }

    fn resync(&mut self, now: Instant) {
        self.start = Some(now);
        self.expected = Duration::ZERO;
    }
}

/// Sliding-window throughput estimate.
#[derive(Debug, Default)]
struct BitrateMeter {
    samples: VecDeque<(Instant, usize)>,
    bytes: usize,
    started: Option<Instant>,
}

impl BitrateMeter {
    fn push(&mut self, now: Instant, bytes: usize) {
        self.started.get_or_insert(now);
        self.samples.push_back((now, bytes));
        self.bytes += bytes;
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.duration_since(at) <= BITRATE_WINDOW {
                break;
            }
            self.samples.pop_front();
            self.bytes -= bytes;
        }
    }

    fn bits_per_second(&mut self, now: Instant) -> u64 {
        self.expire(now);
        let Some(started) = self.started else {
            return 0;
        };
        let span = now.duration_since(started).min(BITRATE_WINDOW);
        if span < Duration::from_millis(1) {
            return 0;
        }
        (self.bytes as f64 * 8.0 / span.as_secs_f64()) as u64
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// State shared between the producer side and the pacing thread.
struct Shared {
    config: TransportConfig,
    udp: UdpPair,
    destination: Mutex<Destination>,
    rtcp: Mutex<RtcpReporter>,
    bitrate: Mutex<BitrateMeter>,
    clock_rate: AtomicU32,
    cache_ms: AtomicU64,
    failed: AtomicBool,
}

impl Shared {
    /// Put one packet on the wire. Only interleaved write failures are
    /// returned; UDP is best-effort.
    fn transmit(&self, packet: &[u8], timestamp: u32) -> io::Result<()> {
        let destination = self.destination.lock().clone();
        match destination {
            Destination::Unset => {
                tracing::trace!("no destination, dropping RTP packet");
                return Ok(());
            }
            Destination::Udp(addr) => {
                if let Err(e) = self.udp.send_rtp(packet, addr) {
                    tracing::warn!(error = %e, %addr, "RTP send failed");
                    return Ok(());
                }
            }
            Destination::Interleaved { writer, channel } => {
                writer.write_frame(channel, packet)?;
            }
        }

        self.bitrate.lock().push(Instant::now(), packet.len());
        self.rtcp
            .lock()
            .update(packet.len() - RTP_HEADER_LEN, timestamp)
    }
}

struct Pacer {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Paced RTP sender over UDP or TCP-interleaved output.
///
/// Owned by a track and shared (`Arc`) with that track's packetizer thread.
pub struct RtpTransport {
    shared: Arc<Shared>,
    header: Mutex<RtpHeader>,
    pool_tx: Sender<RtpBuffer>,
    pool_rx: Receiver<RtpBuffer>,
    fifo_tx: Sender<Queued>,
    fifo_rx: Receiver<Queued>,
    sequence: Mutex<u16>,
    pacer: Mutex<Option<Pacer>>,
}

impl RtpTransport {
    pub fn new() -> Result<Self> {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Result<Self> {
        let udp = UdpPair::bind()?;
        let header = RtpHeader::with_random_ssrc(DEFAULT_PAYLOAD_TYPE);

        let mut rtcp = RtcpReporter::new(udp.rtcp_socket(), header.ssrc);
        rtcp.set_interval(config.rtcp_interval);

        let (pool_tx, pool_rx) = bounded(config.pool_size);
        for _ in 0..config.pool_size {
            // The channel was sized for exactly this many buffers.
            let _ = pool_tx.send(RtpBuffer::new(config.max_payload));
        }
        let (fifo_tx, fifo_rx) = unbounded();

        let (rtp_port, rtcp_port) = udp.local_ports();
        tracing::debug!(
            ssrc = format_args!("{:#010X}", header.ssrc),
            rtp_port,
            rtcp_port,
            pool = config.pool_size,
            "RTP transport created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                udp,
                destination: Mutex::new(Destination::Unset),
                rtcp: Mutex::new(rtcp),
                bitrate: Mutex::new(BitrateMeter::default()),
                clock_rate: AtomicU32::new(90_000),
                cache_ms: AtomicU64::new(config.cache.as_millis() as u64),
                config,
                failed: AtomicBool::new(false),
            }),
            header: Mutex::new(header),
            pool_tx,
            pool_rx,
            fifo_tx,
            fifo_rx,
            sequence: Mutex::new(rand::random::<u16>()),
            pacer: Mutex::new(None),
        })
    }

    /// Largest payload one buffer holds.
    pub fn max_payload(&self) -> usize {
        self.shared.config.max_payload
    }

    pub fn ssrc(&self) -> u32 {
        self.header.lock().ssrc
    }

    pub fn set_ssrc(&self, ssrc: u32) {
        self.header.lock().ssrc = ssrc;
        self.shared.rtcp.lock().set_ssrc(ssrc);
    }

    pub fn clock_rate(&self) -> u32 {
        self.shared.clock_rate.load(Ordering::SeqCst)
    }

    pub fn set_clock_rate(&self, clock_rate: u32) {
        self.shared.clock_rate.store(clock_rate, Ordering::SeqCst);
    }

    /// Leading delay before the first packet after a (re)start. Takes effect
    /// the next time the pacing thread starts.
    pub fn set_cache_ms(&self, cache_ms: u64) {
        self.shared.cache_ms.store(cache_ms, Ordering::SeqCst);
    }

    /// Local (RTP, RTCP) UDP ports.
    pub fn local_ports(&self) -> (u16, u16) {
        self.shared.udp.local_ports()
    }

    /// Sequence number the next committed packet will carry.
    pub fn next_sequence(&self) -> u16 {
        *self.sequence.lock()
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        self.shared.udp.set_ttl(ttl)?;
        Ok(())
    }

    /// Send over UDP to `ip:rtp_port`, RTCP to `ip:rtcp_port`.
    pub fn set_destination(&self, ip: IpAddr, rtp_port: u16, rtcp_port: u16) {
        tracing::debug!(%ip, rtp_port, rtcp_port, "RTP destination set");
        *self.shared.destination.lock() = Destination::Udp(SocketAddr::new(ip, rtp_port));
        self.shared
            .rtcp
            .lock()
            .set_destination(Destination::Udp(SocketAddr::new(ip, rtcp_port)));
        self.shared.failed.store(false, Ordering::SeqCst);
    }

    /// Send interleaved on an RTSP connection: RTP on `channel`, RTCP on
    /// `channel + 1`.
    pub fn set_output_stream(&self, writer: InterleavedWriter, channel: u8) {
        tracing::debug!(channel, "RTP interleaved output set");
        *self.shared.destination.lock() = Destination::Interleaved {
            writer: writer.clone(),
            channel,
        };
        self.shared.rtcp.lock().set_destination(Destination::Interleaved {
            writer,
            channel: channel.wrapping_add(1),
        });
        self.shared.failed.store(false, Ordering::SeqCst);
    }

    /// Outgoing throughput over the last few seconds, in bits per second.
    pub fn bitrate(&self) -> u64 {
        self.shared.bitrate.lock().bits_per_second(Instant::now())
    }

    /// Whether every buffer is back in the pool (nothing queued or in flight).
    pub fn is_idle(&self) -> bool {
        self.pool_rx.len() == self.shared.config.pool_size
    }

    /// Take a free buffer, blocking while all of them are queued.
    pub fn acquire(&self) -> Result<RtpBuffer> {
        self.check_failed()?;
        let mut buffer = self
            .pool_rx
            .recv()
            .map_err(|_| RtspError::Transport("buffer pool closed".into()))?;
        if let Err(e) = self.check_failed() {
            let _ = self.pool_tx.try_send(buffer);
            return Err(e);
        }
        self.header.lock().stamp(&mut buffer.data);
        buffer.timestamp = 0;
        Ok(buffer)
    }

    /// Assign the next sequence number and queue the packet for sending.
    pub fn commit(&self, mut buffer: RtpBuffer, payload_len: usize) -> Result<()> {
        if let Err(e) = self.check_failed() {
            let _ = self.pool_tx.try_send(buffer);
            return Err(e);
        }
        let len = payload_len.min(self.shared.config.max_payload);

        // Sequence assignment and enqueue happen under one lock so FIFO
        // order always equals sequence order.
        let mut sequence = self.sequence.lock();
        self.ensure_pacer();
        rtp::set_sequence(&mut buffer.data, *sequence);
        *sequence = sequence.wrapping_add(1);
        self.fifo_tx
            .send(Queued { buffer, len })
            .map_err(|_| RtspError::Transport("RTP queue closed".into()))
    }

    fn check_failed(&self) -> Result<()> {
        if self.shared.failed.load(Ordering::SeqCst) {
            return Err(RtspError::Transport("interleaved output failed".into()));
        }
        Ok(())
    }

    fn ensure_pacer(&self) {
        let mut pacer = self.pacer.lock();
        if pacer.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return;
        }
        if let Some(old) = pacer.take() {
            let _ = old.handle.join();
        }

        let (stop_tx, stop_rx) = bounded(1);
        let shared = self.shared.clone();
        let fifo = self.fifo_rx.clone();
        let pool = self.pool_tx.clone();
        let handle = thread::spawn(move || pace(shared, fifo, pool, stop_rx));
        *pacer = Some(Pacer { stop_tx, handle });
    }

    /// Stop the pacing thread, return queued buffers to the pool and reset
    /// counters. The transport can be committed to again afterwards.
    pub fn close(&self) {
        if let Some(pacer) = self.pacer.lock().take() {
            let _ = pacer.stop_tx.try_send(());
            let _ = pacer.handle.join();
        }
        for queued in self.fifo_rx.try_iter() {
            let _ = self.pool_tx.try_send(queued.buffer);
        }
        self.shared.rtcp.lock().reset();
        self.shared.bitrate.lock().reset();
        *self.shared.destination.lock() = Destination::Unset;
        self.shared.rtcp.lock().set_destination(Destination::Unset);
        self.shared.failed.store(false, Ordering::SeqCst);
        tracing::debug!(ssrc = format_args!("{:#010X}", self.ssrc()), "RTP transport closed");
    }
}

impl Drop for RtpTransport {
    fn drop(&mut self) {
        if let Some(pacer) = self.pacer.get_mut().take() {
            let _ = pacer.stop_tx.try_send(());
            let _ = pacer.handle.join();
        }
    }
}

/// Pacing thread body.
fn pace(shared: Arc<Shared>, fifo: Receiver<Queued>, pool: Sender<RtpBuffer>, stop: Receiver<()>) {
    let mut clock = PacingClock::new(&shared.config);
    clock.cache = Duration::from_millis(shared.cache_ms.load(Ordering::SeqCst));

    loop {
        let queued = select! {
            recv(fifo) -> queued => match queued {
                Ok(queued) => queued,
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        };

        let timestamp = queued.buffer.timestamp;
        let clock_rate = shared.clock_rate.load(Ordering::SeqCst);
        let delay = clock.delay(timestamp, clock_rate, Instant::now());
        if !delay.is_zero() {
            match stop.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => {
                    let _ = pool.try_send(queued.buffer);
                    break;
                }
            }
        }

        let result = shared.transmit(&queued.buffer.data[..RTP_HEADER_LEN + queued.len], timestamp);
        let _ = pool.try_send(queued.buffer);

        if let Err(e) = result {
            tracing::error!(error = %e, "interleaved RTP write failed, stopping transport");
            shared.failed.store(true, Ordering::SeqCst);
            for queued in fifo.try_iter() {
                let _ = pool.try_send(queued.buffer);
            }
            break;
        }
    }
    tracing::trace!("pacing thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpPacketInfo;
    use std::net::UdpSocket;

    fn config() -> TransportConfig {
        TransportConfig::default()
    }

    #[test]
    fn first_packet_waits_for_cache() {
        let mut cfg = config();
        cfg.cache = Duration::from_millis(200);
        let mut clock = PacingClock::new(&cfg);
        let now = Instant::now();
        assert_eq!(clock.delay(0, 90_000, now), Duration::from_millis(200));
    }

    #[test]
    fn delay_follows_timestamp_delta() {
        let mut clock = PacingClock::new(&config());
        let now = Instant::now();
        assert_eq!(clock.delay(1000, 8000, now), Duration::ZERO);
        let d = clock.delay(9000, 8000, now);
        assert_eq!(d, Duration::from_secs(1));
    }

    #[test]
    fn burst_is_spread_over_time() {
        let mut clock = PacingClock::new(&config());
        let now = Instant::now();
        clock.delay(0, 90_000, now);
        // Three frames committed at the same instant, 40 ms apart in media time.
        assert_eq!(clock.delay(3600, 90_000, now), Duration::from_millis(40));
        assert_eq!(clock.delay(7200, 90_000, now), Duration::from_millis(80));
    }

    #[test]
    fn resyncs_when_far_behind() {
        let mut clock = PacingClock::new(&config());
        let start = Instant::now();
        clock.delay(0, 90_000, start);
        let late = start + Duration::from_secs(2);
        assert_eq!(clock.delay(3000, 90_000, late), Duration::ZERO);
        // After resync the schedule is anchored at `late`.
        assert_eq!(clock.delay(6000, 90_000, late), Duration::from_nanos(33_333_333));
    }

    #[test]
    fn large_gap_is_a_discontinuity() {
        let mut clock = PacingClock::new(&config());
        let now = Instant::now();
        clock.delay(0, 8000, now);
        assert_eq!(clock.delay(8000 * 60, 8000, now), Duration::ZERO);
    }

    #[test]
    fn backwards_timestamp_sends_immediately() {
        let mut clock = PacingClock::new(&config());
        let now = Instant::now();
        clock.delay(5000, 8000, now);
        assert_eq!(clock.delay(4000, 8000, now), Duration::ZERO);
    }

    #[test]
    fn bitrate_over_window() {
        let mut meter = BitrateMeter::default();
        let t0 = Instant::now();
        meter.push(t0, 1000);
        meter.push(t0 + Duration::from_millis(500), 1000);
        let bps = meter.bits_per_second(t0 + Duration::from_secs(1));
        assert_eq!(bps, 16_000);
    }

    fn receiver() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        socket
    }

    fn send(transport: &RtpTransport, ts: u32, payload: &[u8]) {
        let mut buf = transport.acquire().unwrap();
        buf.payload_mut()[..payload.len()].copy_from_slice(payload);
        buf.set_timestamp(ts);
        transport.commit(buf, payload.len()).unwrap();
    }

    #[test]
    fn sequence_numbers_are_consecutive() {
        let rx = receiver();
        let transport = RtpTransport::new().unwrap();
        let port = rx.local_addr().unwrap().port();
        transport.set_destination(IpAddr::from([127, 0, 0, 1]), port, port + 1);
        let first = transport.next_sequence();

        for _ in 0..20 {
            send(&transport, 0, &[0xAB; 10]);
        }

        let mut buf = [0u8; 1500];
        for i in 0..20u16 {
            let (n, _) = rx.recv_from(&mut buf).unwrap();
            let info = RtpPacketInfo::parse(&buf[..n]).unwrap();
            assert_eq!(info.sequence, first.wrapping_add(i));
            assert_eq!(info.ssrc, transport.ssrc());
            assert_eq!(n, RTP_HEADER_LEN + 10);
        }
        transport.close();
    }

    #[test]
    fn packets_paced_by_clock_rate() {
        let rx = receiver();
        let transport = RtpTransport::new().unwrap();
        transport.set_clock_rate(8000);
        let port = rx.local_addr().unwrap().port();
        transport.set_destination(IpAddr::from([127, 0, 0, 1]), port, port + 1);

        send(&transport, 1000, &[1]);
        send(&transport, 9000, &[2]);

        let mut buf = [0u8; 64];
        rx.recv_from(&mut buf).unwrap();
        let first = Instant::now();
        rx.recv_from(&mut buf).unwrap();
        let gap = first.elapsed();
        assert!(
            gap >= Duration::from_millis(900) && gap <= Duration::from_millis(1200),
            "gap was {gap:?}"
        );
        transport.close();
    }

    #[test]
    fn interleaved_failure_stops_producer() {
        struct Broken;
        impl io::Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let transport = RtpTransport::new().unwrap();
        transport.set_output_stream(InterleavedWriter::new(Broken), 0);
        send(&transport, 0, &[1, 2, 3]);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match transport.acquire() {
                Err(RtspError::Transport(_)) => break,
                Ok(buf) => {
                    let _ = transport.commit(buf, 0);
                }
                Err(e) => panic!("unexpected error {e}"),
            }
            assert!(Instant::now() < deadline, "transport never failed");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn close_returns_queued_buffers() {
        let mut cfg = config();
        cfg.pool_size = 4;
        cfg.cache = Duration::from_secs(10);
        let transport = RtpTransport::with_config(cfg).unwrap();
        for _ in 0..4 {
            send(&transport, 0, &[0]);
        }
        transport.close();
        // All four buffers are available again.
        let held: Vec<_> = (0..4).map(|_| transport.acquire().unwrap()).collect();
        assert_eq!(held.len(), 4);
    }

    #[test]
    fn cache_delays_first_send() {
        let rx = receiver();
        let transport = RtpTransport::new().unwrap();
        transport.set_cache_ms(300);
        let port = rx.local_addr().unwrap().port();
        transport.set_destination(IpAddr::from([127, 0, 0, 1]), port, port + 1);

        let sent = Instant::now();
        send(&transport, 0, &[1]);
        let mut buf = [0u8; 64];
        rx.recv_from(&mut buf).unwrap();
        assert!(sent.elapsed() >= Duration::from_millis(250));
        transport.close();
    }
}
