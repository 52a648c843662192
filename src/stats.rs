use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};
use std::time::Duration;

#[derive(Debug)]
pub struct PipelineStats {
    pub broker_connections: AtomicU64,
    pub records_consumed: AtomicU64,
    pub records_rejected: AtomicU64,
    pub records_distributed: AtomicU64,
    pub flushes_ok: AtomicU64,
    pub flushes_failed: AtomicU64,
    pub records_archived: AtomicU64,
    pub records_discarded: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub buffered_records: AtomicU64,
    sink_drops: Mutex<BTreeMap<String, u64>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub broker_connected: bool,
    pub broker_connections: u64,
    pub records_consumed: u64,
    pub records_rejected: u64,
    pub records_distributed: u64,
    pub sink_drops: BTreeMap<String, u64>,
    pub flushes_ok: u64,
    pub flushes_failed: u64,
    pub records_archived: u64,
    pub records_discarded: u64,
    pub buffered_records: u64,
    /// Unset until the first successful flush.
    pub last_flush_unix_ms: Option<u64>,
    pub last_batch_len: u64,
    pub average_flush_micros: u64,
    pub last_error: Option<String>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            broker_connections: AtomicU64::new(0),
            records_consumed: AtomicU64::new(0),
            records_rejected: AtomicU64::new(0),
            records_distributed: AtomicU64::new(0),
            flushes_ok: AtomicU64::new(0),
            flushes_failed: AtomicU64::new(0),
            records_archived: AtomicU64::new(0),
            records_discarded: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            buffered_records: AtomicU64::new(0),
            sink_drops: Mutex::new(BTreeMap::new()),
            last_error: Mutex::new(None),
        }
    }

    pub fn broker_connected(&self) {
        self.broker_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_disconnected(&self) {
        let _ = self
            .broker_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_sub(1)
            });
    }

    pub fn record_sink_drop(&self, sink: &str) {
        if let Ok(mut guard) = self.sink_drops.lock() {
            *guard.entry(sink.to_string()).or_insert(0) += 1;
        }
    }

    pub fn sink_drops(&self, sink: &str) -> u64 {
        self.sink_drops
            .lock()
            .ok()
            .and_then(|guard| guard.get(sink).copied())
            .unwrap_or(0)
    }

    pub fn record_flush(&self, len: usize, elapsed: Duration) {
        self.flushes_ok.fetch_add(1, Ordering::Relaxed);
        self.records_archived.fetch_add(len as u64, Ordering::Relaxed);
        self.last_batch_len.store(len as u64, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let micros = elapsed.as_micros() as u64;
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 {
            micros
        } else {
            (prev + micros) / 2
        };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
        self.clear_error();
    }

    pub fn record_discard(&self, len: usize, err: impl Into<String>) {
        self.flushes_failed.fetch_add(1, Ordering::Relaxed);
        self.records_discarded.fetch_add(len as u64, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn set_buffered(&self, len: usize) {
        self.buffered_records.store(len as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let broker_connections = self.broker_connections.load(Ordering::Relaxed);
        StatsSnapshot {
            broker_connected: broker_connections > 0,
            broker_connections,
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            records_distributed: self.records_distributed.load(Ordering::Relaxed),
            sink_drops: self
                .sink_drops
                .lock()
                .map(|guard| guard.clone())
                .unwrap_or_default(),
            flushes_ok: self.flushes_ok.load(Ordering::Relaxed),
            flushes_failed: self.flushes_failed.load(Ordering::Relaxed),
            records_archived: self.records_archived.load(Ordering::Relaxed),
            records_discarded: self.records_discarded.load(Ordering::Relaxed),
            buffered_records: self.buffered_records.load(Ordering::Relaxed),
            last_flush_unix_ms: Some(self.last_flush_unix_ms.load(Ordering::Relaxed))
                .filter(|ms| *ms != 0),
            last_batch_len: self.last_batch_len.load(Ordering::Relaxed),
            average_flush_micros: self.average_flush_micros.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .ok()
                .and_then(|guard| guard.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_connection_buffer_and_flush_state() {
        let stats = PipelineStats::new();
        let idle = stats.snapshot();
        assert!(!idle.broker_connected);
        assert_eq!(idle.buffered_records, 0);
        assert_eq!(idle.last_flush_unix_ms, None);

        stats.broker_connected();
        stats.broker_connected();
        stats.broker_disconnected();
        stats.set_buffered(7);
        stats.record_flush(3, Duration::from_micros(400));
        let busy = stats.snapshot();
        assert!(busy.broker_connected);
        assert_eq!(busy.broker_connections, 1);
        assert_eq!(busy.buffered_records, 7);
        assert!(busy.last_flush_unix_ms.is_some_and(|ms| ms > 0));
        assert_eq!(busy.records_archived, 3);

        stats.broker_disconnected();
        stats.broker_disconnected();
        assert!(!stats.snapshot().broker_connected);
    }
}
