//! Integration tests for the pull role: a real server on a loopback port,
//! driven with raw RTSP over TCP.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rtsp_stream::media::source::{ChannelSource, MediaEncoder, MediaFrame, MediaSource};
use rtsp_stream::protocol::TransportHeader;
use rtsp_stream::session::{Codec, CodecParameters, Quality, TrackKind};
use rtsp_stream::{Result, RtspServer, ServerConfig, SessionBuilder};

const SPS: [u8; 4] = [0x67, 0x42, 0xc0, 0x1e];
const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

/// Counts open encoders and keeps the frame senders of the audio streams.
#[derive(Clone, Default)]
struct Encoders {
    open: Arc<AtomicUsize>,
    audio: Arc<Mutex<Vec<Sender<MediaFrame>>>>,
}

struct TestEncoder {
    kind: TrackKind,
    encoders: Encoders,
    senders: Vec<Sender<MediaFrame>>,
}

impl MediaEncoder for TestEncoder {
    fn configure(&mut self, codec: Codec, _: &Quality) -> Result<CodecParameters> {
        Ok(match codec {
            Codec::H264 => CodecParameters::H264 {
                sps: SPS.to_vec(),
                pps: PPS.to_vec(),
            },
            _ => CodecParameters::None,
        })
    }

    fn open(&mut self) -> Result<Box<dyn MediaSource>> {
        let (tx, source) = ChannelSource::channel(16);
        if self.kind == TrackKind::Audio {
            self.encoders.audio.lock().push(tx.clone());
        }
        self.senders.push(tx);
        self.encoders.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(source))
    }

    fn close(&mut self) {
        self.senders.clear();
        self.encoders.open.fetch_sub(1, Ordering::SeqCst);
    }
}

fn start_server() -> (RtspServer, SocketAddr, Encoders) {
    let encoders = Encoders::default();
    let shared = encoders.clone();
    let sessions = SessionBuilder::new(move |kind: TrackKind, _: Codec| -> Result<Box<dyn MediaEncoder>> {
        Ok(Box::new(TestEncoder {
            kind,
            encoders: shared.clone(),
            senders: Vec::new(),
        }))
    })
    .audio(Codec::AmrNb, Quality::audio_default())
    .video(Codec::H264, Quality::video_default());

    let mut server = RtspServer::with_config(sessions, ServerConfig::default().bind("127.0.0.1:0"));
    server.start().expect("server start");
    let addr = server.local_addr().unwrap();
    (server, addr, encoders)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to server");
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream.set_write_timeout(Some(Duration::from_secs(3))).unwrap();
    stream
}

fn rtsp_request(stream: &mut TcpStream, request: &str) -> std::io::Result<String> {
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        response.push_str(&String::from_utf8_lossy(&body));
    }

    Ok(response)
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn status(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn describe_setup_play_teardown_over_udp() {
    let (mut server, addr, encoders) = start_server();
    let mut stream = connect(addr);
    let base = format!("rtsp://{addr}/live");

    let resp = rtsp_request(&mut stream, &format!("OPTIONS {base} RTSP/1.0\r\nCSeq: 1\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK");
    assert!(header(&resp, "Public").unwrap().contains("DESCRIBE"));

    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {base}?h264=500-20-320-240&amr RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK", "{resp}");
    assert_eq!(header(&resp, "CSeq"), Some("2"));
    assert_eq!(header(&resp, "Content-Type"), Some("application/sdp"));
    assert_eq!(header(&resp, "Content-Base"), Some(format!("{base}/").as_str()));
    assert!(resp.contains("c=IN IP4 127.0.0.1\r\n"));
    assert!(resp.contains("m=audio 0 RTP/AVP 96\r\na=rtpmap:96 AMR/8000\r\n"));
    assert!(resp.contains("a=rtpmap:96 H264/90000\r\n"));
    assert!(resp.contains("a=control:trackID=0\r\n"));
    assert!(resp.contains("a=control:trackID=1\r\n"));

    let audio_rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    audio_rtp.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let audio_port = audio_rtp.local_addr().unwrap().port();
    let video_port = audio_port + 2;

    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {base}/trackID=0 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port={audio_port}-{}\r\n\r\n",
            audio_port + 1
        ),
    )
    .unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK", "{resp}");
    let transport = TransportHeader::parse(header(&resp, "Transport").unwrap()).unwrap();
    assert_eq!(transport.client_port, Some((audio_port, audio_port + 1)));
    let (server_rtp, server_rtcp) = transport.server_port.unwrap();
    assert_eq!(server_rtcp, server_rtp + 1);
    let audio_ssrc = transport.ssrc.unwrap();
    let session = header(&resp, "Session").unwrap();
    let session_id = session.split(';').next().unwrap().to_string();
    assert!(session.ends_with(";timeout=60"));

    // Tracks stream as soon as they are set up.
    wait_until("audio encoder to open", || encoders.open.load(Ordering::SeqCst) == 1);

    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {base}/trackID=1 RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\nTransport: RTP/AVP;unicast;client_port={video_port}-{}\r\n\r\n",
            video_port + 1
        ),
    )
    .unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK", "{resp}");
    wait_until("video encoder to open", || encoders.open.load(Ordering::SeqCst) == 2);

    let mut frame = b"#!AMR\n".to_vec();
    frame.push(0x3C);
    frame.extend_from_slice(&[0x55; 31]);
    for sender in encoders.audio.lock().iter() {
        sender.send(MediaFrame::new(frame.clone())).unwrap();
    }
    let mut packet = [0u8; 1500];
    let (len, from) = audio_rtp.recv_from(&mut packet).expect("RTP packet");
    assert_eq!(from.port(), server_rtp);
    assert_eq!(len, 12 + 2 + 31);
    assert_eq!(packet[0] >> 6, 2);
    assert_eq!(packet[1] & 0x7f, 96);
    assert_eq!(u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]), audio_ssrc);
    assert_eq!(&packet[12..14], &[0xF0, 0x3C]);

    let resp = rtsp_request(
        &mut stream,
        &format!("PLAY {base}/ RTSP/1.0\r\nCSeq: 5\r\nSession: {session_id}\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK", "{resp}");
    assert_eq!(header(&resp, "Range"), Some("npt=0.000-"));
    let rtp_info = header(&resp, "RTP-Info").unwrap();
    assert!(rtp_info.contains(&format!("url={base}/trackID=0;seq=")));
    assert!(rtp_info.contains(&format!("url={base}/trackID=1;seq=")));

    let resp = rtsp_request(
        &mut stream,
        &format!("TEARDOWN {base}/ RTSP/1.0\r\nCSeq: 6\r\nSession: {session_id}\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK");
    wait_until("encoders to close", || encoders.open.load(Ordering::SeqCst) == 0);

    // The server closes the connection after TEARDOWN.
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap_or(0), 0);

    server.stop();
}

#[test]
fn interleaved_setup_streams_on_the_connection() {
    let (mut server, addr, encoders) = start_server();
    let mut stream = connect(addr);
    let base = format!("rtsp://{addr}/live");

    let resp = rtsp_request(
        &mut stream,
        &format!("SETUP {base}/trackID=0 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK", "{resp}");
    let transport = TransportHeader::parse(header(&resp, "Transport").unwrap()).unwrap();
    assert_eq!(transport.interleaved, Some((0, 1)));
    wait_until("audio encoder to open", || encoders.open.load(Ordering::SeqCst) == 1);

    let mut frame = b"#!AMR\n".to_vec();
    frame.push(0x3C);
    frame.extend_from_slice(&[0x11; 31]);
    for sender in encoders.audio.lock().iter() {
        sender.send(MediaFrame::new(frame.clone())).unwrap();
    }

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(head[0], b'$');
    assert_eq!(head[1], 0);
    let len = u16::from_be_bytes([head[2], head[3]]) as usize;
    assert_eq!(len, 12 + 2 + 31);
    let mut packet = vec![0u8; len];
    stream.read_exact(&mut packet).unwrap();
    assert_eq!(packet[1] & 0x7f, 96);

    drop(stream);
    wait_until("encoder to close after disconnect", || encoders.open.load(Ordering::SeqCst) == 0);
    server.stop();
}

#[test]
fn request_errors_keep_the_connection() {
    let (mut server, addr, _encoders) = start_server();
    let mut stream = connect(addr);
    let base = format!("rtsp://{addr}/live");

    let resp = rtsp_request(&mut stream, &format!("RECORD {base} RTSP/1.0\r\nCSeq: 1\r\n\r\n")).unwrap();
    assert!(status(&resp).starts_with("RTSP/1.0 400"), "{resp}");
    assert_eq!(header(&resp, "CSeq"), Some("1"));

    let resp = rtsp_request(&mut stream, "HELLO\r\n\r\n").unwrap();
    assert!(status(&resp).starts_with("RTSP/1.0 400"), "{resp}");

    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {base}?h264=fast RTSP/1.0\r\nCSeq: 2\r\n\r\n"),
    )
    .unwrap();
    assert!(status(&resp).starts_with("RTSP/1.0 400"), "{resp}");

    let resp = rtsp_request(
        &mut stream,
        &format!("SETUP {base}/trackID=7 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port=6000-6001\r\n\r\n"),
    )
    .unwrap();
    assert!(status(&resp).starts_with("RTSP/1.0 404"), "{resp}");

    let resp = rtsp_request(&mut stream, &format!("OPTIONS {base} RTSP/1.0\r\nCSeq: 4\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK");

    server.stop();
}

#[test]
fn stop_closes_open_connections() {
    let (mut server, addr, encoders) = start_server();
    let mut stream = connect(addr);
    let base = format!("rtsp://{addr}/live");

    let resp = rtsp_request(
        &mut stream,
        &format!("SETUP {base}/trackID=1 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=6100-6101\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), "RTSP/1.0 200 OK", "{resp}");
    wait_until("video encoder to open", || encoders.open.load(Ordering::SeqCst) == 1);
    assert_eq!(server.connection_count(), 1);

    server.stop();
    assert!(!server.is_running());
    assert_eq!(encoders.open.load(Ordering::SeqCst), 0);
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap_or(0), 0);
}
