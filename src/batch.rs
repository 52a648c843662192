use crate::archive::ArchiveStore;
use crate::stats::PipelineStats;
use crate::telemetry::TelemetryRecord;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct BatchSettings {
    pub max_size: usize,
    pub flush_interval: Duration,
    /// Total write attempts per batch before it is discarded.
    pub write_attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Interval,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Accumulates telemetry for the archive store. The record sequence is only
/// ever swapped out whole under the lock; writes happen after it is released.
pub struct BatchBuffer {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
    settings: BatchSettings,
    store: Arc<dyn ArchiveStore>,
    stats: Arc<PipelineStats>,
}

pub struct BatchHandle {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl BatchHandle {
    pub fn buffered(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forces a final flush and waits up to `grace` for it. Returns false when
    /// the grace period elapsed first; whatever was still buffered is lost.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.shutdown.cancel();
        match tokio::time::timeout(grace, self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::error!(error=%err, "batch buffer task failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "final batch flush did not finish within grace period"
                );
                false
            }
        }
    }
}

impl BatchBuffer {
    pub fn new(
        mut settings: BatchSettings,
        store: Arc<dyn ArchiveStore>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        settings.max_size = settings.max_size.max(1);
        settings.write_attempts = settings.write_attempts.max(1);
        Self {
            records: Arc::new(Mutex::new(Vec::with_capacity(settings.max_size))),
            settings,
            store,
            stats,
        }
    }

    pub fn spawn(self, rx: mpsc::Receiver<TelemetryRecord>) -> BatchHandle {
        let shutdown = CancellationToken::new();
        let records = self.records.clone();
        tracing::info!(
            max_batch_size = self.settings.max_size,
            flush_interval_ms = self.settings.flush_interval.as_millis() as u64,
            "starting batch buffer"
        );
        let join = tokio::spawn(self.run(rx, shutdown.clone()));
        BatchHandle {
            records,
            shutdown,
            join,
        }
    }

    async fn run(self, mut rx: mpsc::Receiver<TelemetryRecord>, shutdown: CancellationToken) {
        let interval = self.settings.flush_interval;
        let timer = tokio::time::sleep(interval);
        tokio::pin!(timer);
        let mut inflight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("batch buffer received shutdown signal");
                    rx.close();
                    while let Some(record) = rx.recv().await {
                        if self.append(record) >= self.settings.max_size {
                            self.flush(&mut inflight, FlushTrigger::Size).await;
                        }
                    }
                    break;
                }
                _ = &mut timer => {
                    if !self.is_empty() {
                        self.flush(&mut inflight, FlushTrigger::Interval).await;
                    }
                    timer.as_mut().reset(Instant::now() + interval);
                }
                next = rx.recv() => {
                    match next {
                        Some(record) => {
                            if self.append(record) >= self.settings.max_size {
                                self.flush(&mut inflight, FlushTrigger::Size).await;
                                timer.as_mut().reset(Instant::now() + interval);
                            }
                        }
                        None => {
                            tracing::info!("batch input closed");
                            break;
                        }
                    }
                }
            }
        }

        self.flush(&mut inflight, FlushTrigger::Shutdown).await;
        if let Some(handle) = inflight.take() {
            if let Err(err) = handle.await {
                tracing::error!(error=%err, "final batch write task failed");
            }
        }
    }

    fn append(&self, record: TelemetryRecord) -> usize {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        guard.push(record);
        let len = guard.len();
        self.stats.set_buffered(len);
        tracing::trace!(buffer_size = len, "buffered record");
        len
    }

    fn is_empty(&self) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn take_batch(&self) -> Vec<TelemetryRecord> {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        self.stats.set_buffered(0);
        std::mem::replace(&mut *guard, Vec::with_capacity(self.settings.max_size))
    }

    async fn flush(&self, inflight: &mut Option<JoinHandle<()>>, trigger: FlushTrigger) {
        // One write at a time per buffer.
        if let Some(previous) = inflight.take() {
            if let Err(err) = previous.await {
                tracing::error!(error=%err, "batch write task failed");
            }
        }

        let batch = self.take_batch();
        if batch.is_empty() {
            return;
        }
        tracing::debug!(
            batch_size = batch.len(),
            trigger = trigger.as_str(),
            "flushing batch"
        );

        let store = self.store.clone();
        let stats = self.stats.clone();
        let settings = self.settings.clone();
        *inflight = Some(tokio::spawn(async move {
            write_with_retry(store.as_ref(), batch, &settings, &stats).await;
        }));
    }
}

async fn write_with_retry(
    store: &dyn ArchiveStore,
    batch: Vec<TelemetryRecord>,
    settings: &BatchSettings,
    stats: &PipelineStats,
) -> bool {
    let len = batch.len();
    let started = Instant::now();
    let max_attempts = settings.write_attempts;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match store.write_batch(&batch).await {
            Ok(()) => {
                stats.record_flush(len, started.elapsed());
                tracing::info!(batch_size = len, attempt, "flushed batch to archive");
                return true;
            }
            Err(err) => {
                tracing::error!(
                    attempt,
                    max_attempts,
                    batch_size = len,
                    error=%err,
                    "failed to write batch to archive"
                );
                last_error = err.to_string();
                if attempt < max_attempts {
                    tokio::time::sleep(settings.retry_delay * attempt).await;
                }
            }
        }
    }

    tracing::error!(
        batch_size = len,
        error = %last_error,
        "discarding batch after exhausting write attempts"
    );
    stats.record_discard(len, last_error);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArchiveError;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MemoryArchive {
        writes: Mutex<Vec<Vec<TelemetryRecord>>>,
        attempts: AtomicU32,
        fail_first: u32,
        write_delay: Duration,
        inflight: AtomicU32,
        max_inflight: AtomicU32,
    }

    impl MemoryArchive {
        fn failing(fail_first: u32) -> Self {
            Self {
                fail_first,
                ..Default::default()
            }
        }

        fn slow(write_delay: Duration) -> Self {
            Self {
                write_delay,
                ..Default::default()
            }
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.writes.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl ArchiveStore for MemoryArchive {
        async fn write_batch(&self, records: &[TelemetryRecord]) -> Result<(), ArchiveError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let current = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inflight.fetch_max(current, Ordering::SeqCst);
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            if attempt <= self.fail_first {
                return Err(ArchiveError::Rejected(format!("attempt {attempt} refused")));
            }
            self.writes.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    fn record(i: usize) -> TelemetryRecord {
        TelemetryRecord {
            device_id: format!("device-{}", i % 3),
            timestamp: Utc::now(),
            payload: Map::new(),
        }
    }

    fn settings(max_size: usize, flush_interval: Duration) -> BatchSettings {
        BatchSettings {
            max_size,
            flush_interval,
            write_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }

    fn start(
        settings: BatchSettings,
        store: Arc<MemoryArchive>,
    ) -> (mpsc::Sender<TelemetryRecord>, BatchHandle, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = mpsc::channel(64);
        let handle = BatchBuffer::new(settings, store, stats.clone()).spawn(rx);
        (tx, handle, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_once_on_interval() {
        let store = Arc::new(MemoryArchive::default());
        let (tx, handle, stats) = start(settings(10, Duration::from_secs(1)), store.clone());

        for i in 0..4 {
            tx.send(record(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.batch_sizes().is_empty());
        assert_eq!(handle.buffered(), 4);
        assert_eq!(stats.snapshot().buffered_records, 4);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.batch_sizes(), vec![4]);
        assert_eq!(stats.snapshot().buffered_records, 0);
        assert!(stats.snapshot().last_flush_unix_ms.is_some());

        // Further ticks on an empty buffer write nothing.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.batch_sizes(), vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_immediately_and_remainder_starts_new_batch() {
        let store = Arc::new(MemoryArchive::default());
        let (tx, handle, _stats) = start(settings(3, Duration::from_secs(60)), store.clone());

        for i in 0..7 {
            tx.send(record(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.batch_sizes(), vec![3, 3]);
        assert_eq!(handle.buffered(), 1);

        let ordered: Vec<String> = store.writes.lock().unwrap()[0]
            .iter()
            .map(|r| r.device_id.clone())
            .collect();
        assert_eq!(ordered, vec!["device-0", "device-1", "device-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn size_flush_resets_the_interval_timer() {
        let store = Arc::new(MemoryArchive::default());
        let (tx, _handle, _stats) = start(settings(2, Duration::from_secs(1)), store.clone());

        tokio::time::sleep(Duration::from_millis(900)).await;
        tx.send(record(0)).await.unwrap();
        tx.send(record(1)).await.unwrap();
        tx.send(record(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Without the reset, the 1s deadline would have flushed the leftover record.
        assert_eq!(store.batch_sizes(), vec![2]);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(store.batch_sizes(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_discarded_after_exhausting_attempts() {
        let store = Arc::new(MemoryArchive::failing(u32::MAX));
        let (tx, handle, stats) = start(settings(2, Duration::from_secs(60)), store.clone());

        tx.send(record(0)).await.unwrap();
        tx.send(record(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(store.batch_sizes().is_empty());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.flushes_failed, 1);
        assert_eq!(snapshot.records_discarded, 2);
        assert!(snapshot.last_error.is_some());
        assert_eq!(handle.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_use_linear_backoff_and_recover() {
        let store = Arc::new(MemoryArchive::failing(2));
        let (tx, _handle, stats) = start(settings(1, Duration::from_secs(60)), store.clone());

        tx.send(record(0)).await.unwrap();
        // Attempt 1 at t=0, attempt 2 after 100ms, attempt 3 after a further 200ms.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.batch_sizes(), vec![1]);
        assert_eq!(stats.snapshot().records_archived, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_write_in_flight() {
        let store = Arc::new(MemoryArchive::slow(Duration::from_millis(500)));
        let (tx, handle, _stats) = start(settings(2, Duration::from_secs(60)), store.clone());

        for i in 0..6 {
            tx.send(record(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(store.batch_sizes(), vec![2, 2, 2]);
        assert_eq!(store.max_inflight.load(Ordering::SeqCst), 1);
        assert_eq!(handle.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_forces_final_flush() {
        let store = Arc::new(MemoryArchive::default());
        let (tx, handle, _stats) = start(settings(10, Duration::from_secs(60)), store.clone());

        tx.send(record(0)).await.unwrap();
        tx.send(record(1)).await.unwrap();
        assert!(handle.shutdown(Duration::from_secs(1)).await);
        assert_eq!(store.batch_sizes(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_when_grace_period_elapses() {
        let store = Arc::new(MemoryArchive::slow(Duration::from_secs(3600)));
        let (tx, handle, _stats) = start(settings(10, Duration::from_secs(60)), store.clone());

        tx.send(record(0)).await.unwrap();
        assert!(!handle.shutdown(Duration::from_millis(100)).await);
        assert!(store.batch_sizes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_flushes_and_stops() {
        let store = Arc::new(MemoryArchive::default());
        let (tx, handle, _stats) = start(settings(10, Duration::from_secs(60)), store.clone());

        tx.send(record(0)).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.batch_sizes(), vec![1]);
        assert!(handle.shutdown(Duration::from_millis(10)).await);
    }
}
