//! C-Gate command connection pool
//!
//! Owns N command-channel connections. Commands are dispatched round-robin
//! over the healthy set; responses from every member fan into one pool-level
//! line stream (C-Gate responses are not demultiplexed per socket). The pool
//! also runs the keep-alive and health-check timers and rebuilds slots that
//! drop, with a per-slot retry budget.

use crate::infra::config::Settings;
use crate::infra::metrics::Metrics;
use crate::io::cgate::{Backoff, CgateConnection, CgateLink, ChannelKind, LinkEvent, LinkStatus};
use anyhow::Context;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Slot rebuild backoff is a pool policy, not a user setting.
const SLOT_BACKOFF_INITIAL: Duration = Duration::from_millis(1000);
const SLOT_BACKOFF_MAX: Duration = Duration::from_millis(30_000);

/// Grace period granted on top of the per-connection timeout at start.
const START_GRACE: Duration = Duration::from_millis(1000);

/// How long `stop` waits for each slot task to wind down.
const STOP_WAIT_PER_SLOT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum PoolError {
    /// No connection was healthy within the dispatch wait.
    NoHealthyConnection,
    /// The chosen connection refused the write; it is now suspect.
    SendFailed { index: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::NoHealthyConnection => write!(f, "no healthy C-Gate connection"),
            PoolError::SendFailed { index } => {
                write!(f, "send failed on pool connection {}", index)
            }
        }
    }
}

impl std::error::Error for PoolError {}

pub struct CgatePool {
    links: Vec<Arc<CgateLink>>,
    cursor: AtomicUsize,
    healthy_rx: watch::Receiver<usize>,
    connection_timeout: Duration,
    keep_alive_interval: Duration,
    health_check_interval: Duration,
    metrics: Arc<Metrics>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CgatePool {
    /// Spawn the slot connections and the pool supervisor, then wait until
    /// at least one slot is healthy. Zero healthy slots within the
    /// per-connection timeout fails the start.
    pub async fn start(
        settings: &Settings,
        line_tx: mpsc::Sender<String>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<CgatePool>> {
        let size = settings.pool_size() as usize;
        let connection_timeout = Duration::from_millis(settings.connection_timeout_ms());
        let (status_tx, status_rx) = mpsc::channel::<LinkStatus>(size * 4 + 4);
        let (healthy_tx, healthy_rx) = watch::channel(0usize);

        let backoff = Backoff {
            initial: SLOT_BACKOFF_INITIAL,
            max: SLOT_BACKOFF_MAX,
            max_attempts: Some(settings.pool_max_retries()),
        };

        let mut links = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size + 1);

        for index in 0..size {
            let (conn, link) = CgateConnection::new(
                index,
                ChannelKind::Command,
                settings.cgate_host(),
                settings.cgate_command_port(),
                settings.cgate_credentials().map(|(u, p)| (u.to_string(), p.to_string())),
                connection_timeout,
                backoff.clone(),
                line_tx.clone(),
                status_tx.clone(),
                metrics.clone(),
            );
            links.push(link);
            handles.push(tokio::spawn(conn.run(shutdown.clone())));
        }

        let pool = Arc::new(CgatePool {
            links,
            cursor: AtomicUsize::new(0),
            healthy_rx: healthy_rx.clone(),
            connection_timeout,
            keep_alive_interval: Duration::from_millis(settings.keep_alive_interval_ms()),
            health_check_interval: Duration::from_millis(settings.health_check_interval_ms()),
            metrics,
            handles: std::sync::Mutex::new(Vec::new()),
        });

        // The supervisor exits on its own via the shutdown watch; only the
        // slot tasks are held for the stop-time wait.
        tokio::spawn(pool.clone().supervise(status_rx, healthy_tx, shutdown.clone()));
        *pool.handles.lock().unwrap() = handles;

        // Started once anyone is up; all slots keep connecting in parallel.
        let mut ready_rx = healthy_rx;
        tokio::time::timeout(connection_timeout + START_GRACE, async {
            while *ready_rx.borrow() == 0 {
                ready_rx.changed().await.map_err(|_| ())?;
            }
            Ok::<(), ()>(())
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .context("no C-Gate command connection became healthy")?;

        info!(healthy = pool.healthy_count(), total = size, "cgate_pool_started");
        Ok(pool)
    }

    pub fn healthy_count(&self) -> usize {
        self.links.iter().filter(|l| l.is_connected()).count()
    }

    pub fn total(&self) -> usize {
        self.links.len()
    }

    /// Watch of the healthy-connection count, for readiness tracking.
    pub fn subscribe_healthy(&self) -> watch::Receiver<usize> {
        self.healthy_rx.clone()
    }

    /// Dispatch one command line round-robin over the healthy set.
    ///
    /// A send failure marks the chosen connection suspect and surfaces the
    /// error without retrying elsewhere: commands are fire-and-forget and a
    /// cross-dispatch could reorder them against a follow-up GET.
    pub async fn execute(&self, line: &str) -> Result<(), PoolError> {
        if self.healthy_count() == 0 {
            self.wait_for_healthy().await?;
        }

        let n = self.links.len();
        for _ in 0..n {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let link = &self.links[idx];
            if !link.is_connected() {
                continue;
            }
            if link.send(line).await {
                self.metrics.record_command_sent();
                debug!(index = idx, line = line.trim_end(), "cgate_command_dispatched");
                return Ok(());
            }
            warn!(index = idx, "cgate_pool_send_failed");
            return Err(PoolError::SendFailed { index: idx });
        }

        Err(PoolError::NoHealthyConnection)
    }

    async fn wait_for_healthy(&self) -> Result<(), PoolError> {
        let mut rx = self.healthy_rx.clone();
        tokio::time::timeout(self.connection_timeout, async {
            while *rx.borrow() == 0 {
                if rx.changed().await.is_err() {
                    return Err(PoolError::NoHealthyConnection);
                }
            }
            Ok(())
        })
        .await
        .unwrap_or(Err(PoolError::NoHealthyConnection))
    }

    /// Pool supervisor: tracks slot transitions, publishes the healthy
    /// count, and drives the keep-alive / health-check timers.
    async fn supervise(
        self: Arc<Self>,
        mut status_rx: mpsc::Receiver<LinkStatus>,
        healthy_tx: watch::Sender<usize>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let start = tokio::time::Instant::now();
        let mut keep_alive = tokio::time::interval_at(
            start + self.keep_alive_interval,
            self.keep_alive_interval,
        );
        let mut health_check = tokio::time::interval_at(
            start + self.health_check_interval,
            self.health_check_interval,
        );
        let mut was_healthy = false;

        loop {
            tokio::select! {
                status = status_rx.recv() => {
                    let Some(status) = status else { break };
                    match status.event {
                        LinkEvent::Up => {
                            debug!(index = status.index, "cgate_pool_slot_up");
                        }
                        LinkEvent::Down => {
                            debug!(index = status.index, "cgate_pool_slot_down");
                        }
                        LinkEvent::Failed => {
                            warn!(index = status.index, "cgate_pool_slot_gave_up");
                        }
                    }

                    let healthy = self.healthy_count();
                    if healthy == 0 && was_healthy {
                        warn!("cgate_pool_unhealthy");
                    }
                    was_healthy = healthy > 0;
                    let _ = healthy_tx.send(healthy);
                }
                _ = keep_alive.tick() => self.send_keep_alive().await,
                _ = health_check.tick() => {
                    self.health_sweep().await;
                    let _ = healthy_tx.send(self.healthy_count());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop().await;
    }

    /// C-Gate ignores comment lines, so a comment doubles as liveness
    /// traffic that keeps idle sockets from being reaped.
    async fn send_keep_alive(&self) {
        let timestamp =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let line = format!("# keep-alive {}\n", timestamp);

        for link in &self.links {
            if link.is_connected() && !link.send(&line).await {
                warn!(index = link.index(), "cgate_keep_alive_failed");
            }
        }
    }

    /// Probe slots that have been idle for more than two keep-alive
    /// periods; a dead socket fails the probe write and gets evicted.
    async fn health_sweep(&self) {
        let idle_limit = (self.keep_alive_interval * 2).as_millis() as u64;

        for link in &self.links {
            if link.is_connected() && link.idle_ms() > idle_limit {
                if !link.send("# health check ping\n").await {
                    warn!(index = link.index(), "cgate_health_probe_failed");
                }
            }
        }

        debug!(
            healthy = self.healthy_count(),
            total = self.links.len(),
            "cgate_pool_health_check"
        );
    }

    /// Disconnect everything and wait briefly for the slot tasks.
    pub async fn stop(&self) {
        for link in &self.links {
            link.destroy().await;
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = tokio::time::timeout(STOP_WAIT_PER_SLOT, handle).await;
        }

        info!("cgate_pool_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::NoHealthyConnection.to_string(), "no healthy C-Gate connection");
        assert_eq!(
            PoolError::SendFailed { index: 2 }.to_string(),
            "send failed on pool connection 2"
        );
    }
}
