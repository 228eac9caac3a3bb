use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// A single trace session: a label, an optional deadline, and the running
/// counters the `TraceSummary` control endpoint reports back.
pub struct TraceManager {
    label: String,
    started_at: Instant,
    deadline: Option<Instant>,
    events_recorded: AtomicU64,
    bytes_recorded: AtomicU64,
}

impl TraceManager {
    pub fn new(label: impl Into<String>, max_duration: Option<Duration>) -> Self {
        let started_at = Instant::now();
        Self {
            label: label.into(),
            started_at,
            deadline: max_duration.map(|d| started_at + d),
            events_recorded: AtomicU64::new(0),
            bytes_recorded: AtomicU64::new(0),
        }
    }

    pub fn record(&self, bytes: u64) {
        self.events_recorded.fetch_add(1, Ordering::Relaxed);
        self.bytes_recorded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// True once the session's deadline, if any, has passed. The daemon
    /// polls this to drive the Running -> Detaching state transition.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            label: self.label.clone(),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            bytes_recorded: self.bytes_recorded.load(Ordering::Relaxed),
            expired: self.is_expired(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct TraceSummary {
    pub label: String,
    pub elapsed_secs: f64,
    pub events_recorded: u64,
    pub bytes_recorded: u64,
    pub expired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let mgr = TraceManager::new("test", None);
        mgr.record(100);
        mgr.record(200);
        let summary = mgr.summary();
        assert_eq!(summary.events_recorded, 2);
        assert_eq!(summary.bytes_recorded, 300);
        assert!(!summary.expired);
    }

    #[test]
    fn expires_after_deadline() {
        let mgr = TraceManager::new("test", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(mgr.is_expired());
    }

    #[test]
    fn no_deadline_never_expires() {
        let mgr = TraceManager::new("test", None);
        assert!(!mgr.is_expired());
    }
}
