//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations; the periodic reporter is the only
//! reader. Counters feed the log stream only - there is no exposition
//! endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector for the bridge.
#[derive(Default)]
pub struct Metrics {
    /// Event-channel lines parsed into valid events (monotonic)
    events_received: AtomicU64,
    /// Lines that failed event or command parsing (monotonic)
    parse_errors: AtomicU64,
    /// C-Gate commands handed to the pool (monotonic)
    commands_sent: AtomicU64,
    /// MQTT publications attempted (monotonic)
    publications: AtomicU64,
    /// 4xx/5xx responses from C-Gate (monotonic)
    cgate_errors: AtomicU64,
    /// Socket reconnects, event channel and pool slots combined (monotonic)
    reconnects: AtomicU64,
    /// Events since last report (reset on report)
    events_since_report: AtomicU64,
    /// Last report time (only accessed from the reporter)
    last_report_time: std::sync::Mutex<Option<Instant>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publication(&self) {
        self.publications.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cgate_error(&self) {
        self.cgate_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn commands_sent(&self) -> u64 {
        self.commands_sent.load(Ordering::Relaxed)
    }

    /// Snapshot the counters and reset the per-period event count.
    pub fn report(&self) -> MetricsSummary {
        let events_period = self.events_since_report.swap(0, Ordering::Relaxed);

        let elapsed_secs = {
            let mut last = self.last_report_time.lock().unwrap();
            let now = Instant::now();
            let elapsed = last.map(|t| now.duration_since(t).as_secs_f64());
            *last = Some(now);
            elapsed
        };

        let events_per_sec = match elapsed_secs {
            Some(secs) if secs > 0.0 => events_period as f64 / secs,
            _ => 0.0,
        };

        MetricsSummary {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_per_sec,
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            publications: self.publications.load(Ordering::Relaxed),
            cgate_errors: self.cgate_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Consistent snapshot of bridge activity for periodic logging.
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_received: u64,
    pub events_per_sec: f64,
    pub parse_errors: u64,
    pub commands_sent: u64,
    pub publications: u64,
    pub cgate_errors: u64,
    pub reconnects: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_received = self.events_received,
            events_per_sec = format!("{:.2}", self.events_per_sec),
            parse_errors = self.parse_errors,
            commands_sent = self.commands_sent,
            publications = self.publications,
            cgate_errors = self.cgate_errors,
            reconnects = self.reconnects,
            "metrics_summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_event_received();
        metrics.record_event_received();
        metrics.record_command_sent();
        metrics.record_parse_error();
        metrics.record_cgate_error();
        metrics.record_reconnect();

        let summary = metrics.report();
        assert_eq!(summary.events_received, 2);
        assert_eq!(summary.commands_sent, 1);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.cgate_errors, 1);
        assert_eq!(summary.reconnects, 1);
    }

    #[test]
    fn test_period_counter_resets() {
        let metrics = Metrics::new();
        metrics.record_event_received();
        let _ = metrics.report();
        let second = metrics.report();
        // Monotonic total survives, the per-period rate restarts at zero.
        assert_eq!(second.events_received, 1);
        assert_eq!(second.events_per_sec, 0.0);
    }
}
