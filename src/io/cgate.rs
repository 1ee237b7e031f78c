//! C-Gate TCP connection
//!
//! One socket to the C-Gate server, either to the event port (receive only,
//! no handshake) or to the command port (`EVENT ON` plus an optional `LOGIN`
//! on connect). The connection owns reconnection with exponential backoff;
//! received bytes are framed into lines and forwarded to the owner, and
//! connectivity transitions are reported on a status channel.

use crate::infra::metrics::Metrics;
use crate::io::framer::LineFramer;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Log connection failure (cold path)
#[cold]
fn log_connect_failed(kind: ChannelKind, host: &str, port: u16, err: &dyn std::fmt::Display) {
    warn!(kind = kind.as_str(), host = %host, port = port, error = %err, "cgate_connect_failed");
}

/// Log read error (cold path)
#[cold]
fn log_read_error(kind: ChannelKind, err: &std::io::Error) {
    error!(kind = kind.as_str(), error = %err, "cgate_read_error");
}

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

static CLOCK_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since process start, for activity stamping.
pub fn monotonic_ms() -> u64 {
    CLOCK_START.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Event port: C-Gate pushes bus events, nothing is written.
    Event,
    /// Command port: request/response, handshaken with `EVENT ON`.
    Command,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Event => "event",
            ChannelKind::Command => "command",
        }
    }
}

/// Exponential backoff policy: `min(initial * 2^(attempt-1), max)`, with an
/// optional total-attempt budget after which the connection goes terminal.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: Option<u32>,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.initial.saturating_mul(1u32 << exp);
        delay.min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Socket connected and handshaken.
    Up,
    /// Socket closed or errored; a reconnect may follow.
    Down,
    /// Reconnect budget exhausted; the connection will not come back.
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkStatus {
    pub index: usize,
    pub event: LinkEvent,
}

/// Shared per-socket state: the writable half plus the connection record
/// (connected / destroyed / retry count / last activity).
pub struct CgateLink {
    index: usize,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    destroyed: AtomicBool,
    retry_count: AtomicU32,
    last_activity_ms: AtomicU64,
}

impl CgateLink {
    fn new(index: usize) -> Self {
        Self {
            index,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.destroyed.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last send or receive on this socket.
    pub fn idle_ms(&self) -> u64 {
        monotonic_ms().saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    fn stamp_activity(&self) {
        self.last_activity_ms.store(monotonic_ms(), Ordering::Relaxed);
    }

    /// Write one line to the socket. Returns false when there is no
    /// writable socket or the write fails; a failed write tears the
    /// socket down so the run loop reconnects.
    pub async fn send(&self, line: &str) -> bool {
        if self.destroyed.load(Ordering::Relaxed) {
            return false;
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(line.as_bytes())).await {
            Ok(Ok(())) => {
                self.stamp_activity();
                true
            }
            _ => {
                // Dropping the half sends FIN; the read loop will observe
                // the close and drive the reconnect.
                *guard = None;
                self.connected.store(false, Ordering::Relaxed);
                false
            }
        }
    }

    /// Explicit terminal close: no reconnect will follow.
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock().await = None;
    }
}

pub struct CgateConnection {
    kind: ChannelKind,
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    connect_timeout: Duration,
    backoff: Backoff,
    link: Arc<CgateLink>,
    line_tx: mpsc::Sender<String>,
    status_tx: mpsc::Sender<LinkStatus>,
    metrics: Arc<Metrics>,
}

impl CgateConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        kind: ChannelKind,
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        connect_timeout: Duration,
        backoff: Backoff,
        line_tx: mpsc::Sender<String>,
        status_tx: mpsc::Sender<LinkStatus>,
        metrics: Arc<Metrics>,
    ) -> (Self, Arc<CgateLink>) {
        let link = Arc::new(CgateLink::new(index));
        let conn = Self {
            kind,
            host: host.to_string(),
            port,
            credentials,
            connect_timeout,
            backoff,
            link: link.clone(),
            line_tx,
            status_tx,
            metrics,
        };
        (conn, link)
    }

    /// Connect / read / reconnect until shutdown, terminal failure, or
    /// explicit destroy.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() || self.link.is_destroyed() {
                break;
            }

            match self.connect_once().await {
                Ok(read_half) => {
                    attempts = 0;
                    self.link.retry_count.store(0, Ordering::Relaxed);
                    let _ = self
                        .status_tx
                        .send(LinkStatus { index: self.link.index, event: LinkEvent::Up })
                        .await;

                    self.read_until_closed(read_half, &mut shutdown).await;

                    self.link.connected.store(false, Ordering::Relaxed);
                    *self.link.writer.lock().await = None;
                    let _ = self
                        .status_tx
                        .send(LinkStatus { index: self.link.index, event: LinkEvent::Down })
                        .await;
                }
                Err(e) => {
                    log_connect_failed(self.kind, &self.host, self.port, &e);
                }
            }

            if *shutdown.borrow() || self.link.is_destroyed() {
                break;
            }

            attempts += 1;
            self.link.retry_count.store(attempts, Ordering::Relaxed);
            self.metrics.record_reconnect();

            if let Some(max) = self.backoff.max_attempts {
                if attempts > max {
                    error!(
                        kind = self.kind.as_str(),
                        attempts = attempts,
                        "cgate_reconnect_budget_exhausted"
                    );
                    self.link.destroy().await;
                    let _ = self
                        .status_tx
                        .send(LinkStatus { index: self.link.index, event: LinkEvent::Failed })
                        .await;
                    return;
                }
            }

            let delay = self.backoff.delay(attempts);
            debug!(
                kind = self.kind.as_str(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "cgate_reconnect_scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(kind = self.kind.as_str(), index = self.link.index, "cgate_connection_closed");
    }

    async fn connect_once(
        &self,
    ) -> Result<tokio::net::tcp::OwnedReadHalf, Box<dyn std::error::Error + Send + Sync>> {
        debug!(kind = self.kind.as_str(), host = %self.host, port = self.port, "cgate_connecting");

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        {
            let mut guard = self.link.writer.lock().await;
            *guard = Some(write_half);
        }
        self.link.connected.store(true, Ordering::Relaxed);
        self.link.stamp_activity();

        if self.kind == ChannelKind::Command {
            if !self.link.send("EVENT ON\n").await {
                return Err("handshake write failed".into());
            }
            if let Some((user, pass)) = &self.credentials {
                if !self.link.send(&format!("LOGIN {} {}\n", user, pass)).await {
                    return Err("login write failed".into());
                }
            }
        }

        info!(
            kind = self.kind.as_str(),
            index = self.link.index,
            host = %self.host,
            port = self.port,
            "cgate_connected"
        );
        Ok(read_half)
    }

    async fn read_until_closed(
        &self,
        read_half: tokio::net::tcp::OwnedReadHalf,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        use tokio::io::AsyncReadExt;

        let mut read_half = read_half;
        let mut buf = [0u8; 4096];
        let mut framer = LineFramer::new();

        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => {
                    let n = match result {
                        Ok(0) => {
                            warn!(kind = self.kind.as_str(), index = self.link.index, "cgate_connection_eof");
                            return;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            log_read_error(self.kind, &e);
                            return;
                        }
                    };

                    self.link.stamp_activity();

                    let mut lines = Vec::new();
                    if let Err(e) = framer.feed(&buf[..n], |l| lines.push(l.to_string())) {
                        error!(kind = self.kind.as_str(), error = %e, "cgate_protocol_error");
                        return;
                    }
                    for line in lines {
                        if self.line_tx.send(line).await.is_err() {
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
