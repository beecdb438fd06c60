use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, RtspError};
use crate::session::SessionBuilder;
use crate::transport::tcp::{self, ConnectionRegistry};

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (`host:port`).
    pub bind: String,
    /// Address advertised in the SDP `o=` line. When `None`, the local
    /// address of each connection is used.
    pub public_host: Option<String>,
    /// Idle time after which a silent connection is closed and its tracks
    /// stopped. Also advertised in the `Session` header. Zero disables it.
    pub session_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8086".to_string(),
            public_host: None,
            session_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}

/// RTSP server for the pull role.
///
/// Every accepted connection gets its own [`Session`](crate::Session) from
/// the [`SessionBuilder`], configured by the viewer's DESCRIBE URI and torn
/// down with the connection.
pub struct RtspServer {
    sessions: SessionBuilder,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
    registry: ConnectionRegistry,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
}

impl RtspServer {
    pub fn new(sessions: SessionBuilder) -> Self {
        Self::with_config(sessions, ServerConfig::default())
    }

    pub fn with_config(sessions: SessionBuilder, config: ServerConfig) -> Self {
        Self {
            sessions,
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(false)),
            registry: ConnectionRegistry::default(),
            local_addr: None,
            acceptor: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        let sessions = self.sessions.clone();
        let config = self.config.clone();
        let running = self.running.clone();
        let registry = self.registry.clone();

        tracing::info!(addr = %local_addr, "RTSP server listening");

        self.acceptor = Some(thread::spawn(move || {
            tcp::accept_loop(listener, sessions, config, running, registry);
        }));

        Ok(())
    }

    /// Close every connection, stopping their tracks, and wait for the
    /// connection threads to exit.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        self.registry.shutdown_all();
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        tracing::info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address, once started. Useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(RtspError::NotStarted)
    }

    /// Number of open RTSP connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for RtspServer {
    fn drop(&mut self) {
        self.stop();
    }
}
