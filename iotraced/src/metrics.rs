use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global metrics for the tracer daemon. Counters are updated from the
/// ring-drain hot path so every field is atomic.
pub struct Metrics {
    pub events_total: AtomicU64,
    pub io_events_total: AtomicU64,
    pub io_cmpl_events_total: AtomicU64,
    pub fs_meta_events_total: AtomicU64,
    pub fs_file_name_events_total: AtomicU64,
    pub fs_file_events_total: AtomicU64,
    pub lost_events_total: AtomicU64,
    pub sink_write_errors_total: AtomicU64,
    pub active_devices: AtomicUsize,
    pub active_sessions: AtomicUsize,
    pub start_time: SystemTime,
    events_this_sec: AtomicU64,
    events_per_sec: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            io_events_total: AtomicU64::new(0),
            io_cmpl_events_total: AtomicU64::new(0),
            fs_meta_events_total: AtomicU64::new(0),
            fs_file_name_events_total: AtomicU64::new(0),
            fs_file_events_total: AtomicU64::new(0),
            lost_events_total: AtomicU64::new(0),
            sink_write_errors_total: AtomicU64::new(0),
            active_devices: AtomicUsize::new(0),
            active_sessions: AtomicUsize::new(0),
            start_time: SystemTime::now(),
            events_this_sec: AtomicU64::new(0),
            events_per_sec: AtomicU64::new(0),
        }
    }

    pub fn record_record_type(&self, record_type: iotrace_common::RecordType) {
        use iotrace_common::RecordType::*;
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_this_sec.fetch_add(1, Ordering::Relaxed);
        match record_type {
            Io => self.io_events_total.fetch_add(1, Ordering::Relaxed),
            IoCmpl => self.io_cmpl_events_total.fetch_add(1, Ordering::Relaxed),
            FsMeta => self.fs_meta_events_total.fetch_add(1, Ordering::Relaxed),
            FsFileName => self
                .fs_file_name_events_total
                .fetch_add(1, Ordering::Relaxed),
            FsFileEvent => self.fs_file_events_total.fetch_add(1, Ordering::Relaxed),
            DeviceDesc | Padding => 0,
        };
    }

    pub fn record_loss(&self, count: u64) {
        self.lost_events_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_sink_write_error(&self) {
        self.sink_write_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_devices(&self, count: usize) {
        self.active_devices.store(count, Ordering::Relaxed);
    }

    pub fn active_devices(&self) -> usize {
        self.active_devices.load(Ordering::Relaxed)
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Called periodically to refresh the events-per-second gauge.
    pub fn rollup(&self) {
        let per_sec = self.events_this_sec.swap(0, Ordering::Relaxed);
        self.events_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn events_per_sec(&self) -> u64 {
        self.events_per_sec.load(Ordering::Relaxed)
    }

    pub fn lost_events_total(&self) -> u64 {
        self.lost_events_total.load(Ordering::Relaxed)
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotrace_common::RecordType;

    #[test]
    fn counts_by_record_type() {
        let m = Metrics::new();
        m.record_record_type(RecordType::Io);
        m.record_record_type(RecordType::Io);
        m.record_record_type(RecordType::IoCmpl);
        assert_eq!(m.io_events_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.io_cmpl_events_total.load(Ordering::Relaxed), 1);
        assert_eq!(m.events_total(), 3);
    }

    #[test]
    fn rollup_resets_per_second_counter() {
        let m = Metrics::new();
        m.record_record_type(RecordType::Io);
        m.rollup();
        assert_eq!(m.events_per_sec(), 1);
        m.rollup();
        assert_eq!(m.events_per_sec(), 0);
    }

    #[test]
    fn loss_accumulates() {
        let m = Metrics::new();
        m.record_loss(3);
        m.record_loss(4);
        assert_eq!(m.lost_events_total(), 7);
    }
}
