use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::{Args, Parser, Subcommand};
use rtsp_stream::media::aac::{AacFraming, AdtsHeader, audio_specific_config};
use rtsp_stream::media::h264::extract_nal_units;
use rtsp_stream::media::source::{MediaEncoder, MediaSource, ReaderSource};
use rtsp_stream::session::{Codec, CodecParameters, Quality, TrackKind};
use rtsp_stream::{
    ClientConfig, ClientEvent, ClientTransport, Result, RtspClient, RtspError, RtspServer, ServerConfig,
    SessionBuilder,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rtsp-stream", version, about = "Stream elementary-stream files over RTSP/RTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the files to RTSP viewers (pull)
    Serve {
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:8086")]
        bind: String,
        /// Address announced in the SDP origin line
        #[arg(long)]
        public_host: Option<String>,
        #[command(flatten)]
        media: MediaArgs,
    },
    /// Push the files to an RTSP ingest server (ANNOUNCE/RECORD)
    Push {
        /// rtsp://[user:password@]host[:port]/path
        #[arg(long)]
        url: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Interleave RTP on the RTSP connection instead of UDP
        #[arg(long)]
        tcp: bool,
        #[command(flatten)]
        media: MediaArgs,
    },
}

#[derive(Args, Clone)]
struct MediaArgs {
    /// H.264 Annex-B elementary stream
    #[arg(long, conflicts_with = "h263")]
    h264: Option<PathBuf>,
    /// H.263 elementary stream
    #[arg(long)]
    h263: Option<PathBuf>,
    /// AAC stream with ADTS headers
    #[arg(long, conflicts_with = "amr")]
    aac: Option<PathBuf>,
    /// AMR-NB file (`#!AMR` storage format)
    #[arg(long)]
    amr: Option<PathBuf>,
    /// Video frame rate used when the stream carries no timing
    #[arg(long, default_value_t = 20)]
    fps: u32,
}

impl MediaArgs {
    fn files(&self) -> Vec<(Codec, PathBuf)> {
        [
            (Codec::H264, &self.h264),
            (Codec::H263, &self.h263),
            (Codec::Aac, &self.aac),
            (Codec::AmrNb, &self.amr),
        ]
        .into_iter()
        .filter_map(|(codec, path)| path.clone().map(|p| (codec, p)))
        .collect()
    }

    /// Builder with one track per given file and an encoder factory
    /// reading those files.
    fn session_builder(&self) -> Result<SessionBuilder> {
        let files = self.files();
        if files.is_empty() {
            return Err(RtspError::Configuration(
                "give at least one of --h264, --h263, --aac, --amr".into(),
            ));
        }

        let sources = files.clone();
        let mut builder = SessionBuilder::new(move |_: TrackKind, codec: Codec| -> Result<Box<dyn MediaEncoder>> {
            let path = sources
                .iter()
                .find(|(c, _)| *c == codec)
                .map(|(_, path)| path.clone())
                .ok_or_else(|| RtspError::Configuration(format!("no {codec} file to stream")))?;
            Ok(Box::new(FileEncoder { path }))
        });

        for (codec, _) in files {
            let mut quality = Quality::default_for(codec.kind());
            match codec.kind() {
                TrackKind::Video => {
                    quality.frame_rate = self.fps;
                    builder = builder.video(codec, quality);
                }
                TrackKind::Audio => {
                    if codec == Codec::AmrNb {
                        quality.sampling_rate = 8_000;
                    }
                    builder = builder.audio(codec, quality);
                }
            }
        }
        Ok(builder)
    }
}

/// Streams an elementary-stream file. Parameter sets are read from the
/// start of the file.
struct FileEncoder {
    path: PathBuf,
}

impl FileEncoder {
    fn head(&self, len: usize) -> Result<Vec<u8>> {
        let mut head = Vec::with_capacity(len);
        File::open(&self.path)?.take(len as u64).read_to_end(&mut head)?;
        Ok(head)
    }
}

impl MediaEncoder for FileEncoder {
    fn configure(&mut self, codec: Codec, _: &Quality) -> Result<CodecParameters> {
        match codec {
            Codec::H264 => {
                let head = self.head(256 * 1024)?;
                let nals = extract_nal_units(&head);
                let find = |nal_type: u8| {
                    nals.iter()
                        .find(|nal| !nal.is_empty() && nal[0] & 0x1f == nal_type)
                        .map(|nal| nal.to_vec())
                };
                match (find(7), find(8)) {
                    (Some(sps), Some(pps)) => Ok(CodecParameters::H264 { sps, pps }),
                    _ => Err(RtspError::Configuration(format!(
                        "{}: no SPS/PPS near the start of the stream",
                        self.path.display()
                    ))),
                }
            }
            Codec::Aac => {
                let head = self.head(16)?;
                let invalid = || RtspError::Configuration(format!("{}: not an ADTS stream", self.path.display()));
                let header = AdtsHeader::parse(&head).ok_or_else(invalid)?;
                let sampling_rate = header.sampling_rate().ok_or_else(invalid)?;
                let config = audio_specific_config(header.object_type, sampling_rate, header.channels)
                    .ok_or_else(invalid)?;
                Ok(CodecParameters::Aac {
                    sampling_rate,
                    channels: header.channels,
                    config,
                    framing: AacFraming::Adts,
                })
            }
            Codec::H263 | Codec::AmrNb => Ok(CodecParameters::None),
        }
    }

    fn open(&mut self) -> Result<Box<dyn MediaSource>> {
        let file = File::open(&self.path)?;
        tracing::info!(path = %self.path.display(), "streaming file");
        Ok(Box::new(ReaderSource::new(BufReader::new(file))))
    }
}

/// Whether a line was read from `input`. A closed or unreadable input
/// yields `false` and is logged.
fn read_stop_line(input: &mut impl BufRead) -> bool {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) => {
            tracing::info!("stdin closed, running until the process is terminated");
            false
        }
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "cannot read stdin, running until the process is terminated");
            false
        }
    }
}

/// Block until Enter is pressed. Without a usable stdin (service
/// managers, `< /dev/null`) this never returns.
fn wait_for_enter() {
    if read_stop_line(&mut io::stdin().lock()) {
        return;
    }
    loop {
        thread::park();
    }
}

fn serve(bind: String, public_host: Option<String>, media: MediaArgs) -> Result<()> {
    let mut config = ServerConfig::default().bind(bind);
    config.public_host = public_host;

    let mut server = RtspServer::with_config(media.session_builder()?, config);
    server.start()?;

    println!("RTSP server on {}, press Enter to stop", server.local_addr()?);
    wait_for_enter();

    server.stop();
    Ok(())
}

fn push(
    url: String,
    user: Option<String>,
    password: Option<String>,
    tcp: bool,
    media: MediaArgs,
) -> Result<()> {
    let mut config = ClientConfig::from_url(&url)?;
    if let Some(user) = user {
        config = config.credentials(user, password.unwrap_or_default());
    }
    if tcp {
        config = config.transport(ClientTransport::Tcp);
    }

    let session = Arc::new(media.session_builder()?.build()?);
    let client = RtspClient::with_events(session, config, |event| match event {
        ClientEvent::ConnectionLost => tracing::warn!("connection to ingest server lost"),
        ClientEvent::ConnectionRecovered => tracing::info!("connection to ingest server recovered"),
        ClientEvent::Error(e) => tracing::error!(error = %e, "push stopped"),
    });
    client.start_stream()?;

    println!("Pushing to {url}, press Enter to stop");
    wait_for_enter();

    client.stop();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve {
            bind,
            public_host,
            media,
        } => serve(bind, public_host, media),
        Command::Push {
            url,
            user,
            password,
            tcp,
            media,
        } => push(url, user, password, tcp, media),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
