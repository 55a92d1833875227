//! Broker counters, logged on shutdown.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Currently attached connections
    pub active_connections: AtomicU64,
    /// Connections that sent a hello, admitted or not
    pub total_connections: AtomicU64,
    /// Handshakes refused by the gate
    pub rejected_admissions: AtomicU64,
    /// Connections turned away because no session could be created
    pub session_failures: AtomicU64,
    /// Messages committed to the log
    pub messages_appended: AtomicU64,
    /// Input lines dropped as malformed or too long
    pub input_dropped: AtomicU64,
    /// Appends the storage medium refused
    pub append_failures: AtomicU64,

    start_time: Option<Instant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub rejected_admissions: u64,
    pub session_failures: u64,
    pub messages_appended: u64,
    pub input_dropped: u64,
    pub append_failures: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_accepted(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_attached(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_detached(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn admission_rejected(&self) {
        self.rejected_admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_appended(&self) {
        self.messages_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn input_dropped(&self) {
        self.input_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn append_failed(&self) {
        self.append_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_admissions: self.rejected_admissions.load(Ordering::Relaxed),
            session_failures: self.session_failures.load(Ordering::Relaxed),
            messages_appended: self.messages_appended.load(Ordering::Relaxed),
            input_dropped: self.input_dropped.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_lifecycle() {
        let m = ServerMetrics::new();
        m.connection_accepted();
        m.connection_accepted();
        m.connection_attached();
        m.admission_rejected();
        m.message_appended();
        m.message_appended();
        m.connection_detached();

        let s = m.snapshot();
        assert_eq!(s.total_connections, 2);
        assert_eq!(s.active_connections, 0);
        assert_eq!(s.rejected_admissions, 1);
        assert_eq!(s.messages_appended, 2);
        assert_eq!(s.append_failures, 0);
    }
}
