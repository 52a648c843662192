use crate::error::SinkError;
use crate::stats::PipelineStats;
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sends on a bounded channel, giving up once `timeout` elapses with the channel still full.
pub async fn timed_send<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    timeout: Duration,
    sink: &str,
) -> Result<(), SinkError> {
    tx.send_timeout(item, timeout).await.map_err(|err| match err {
        SendTimeoutError::Timeout(_) => SinkError::Full {
            sink: sink.to_string(),
        },
        SendTimeoutError::Closed(_) => SinkError::Closed {
            sink: sink.to_string(),
        },
    })
}

struct Sink<T> {
    name: String,
    tx: mpsc::Sender<T>,
}

/// Fans each inbound record out to every registered sink. A slow sink only
/// loses its own copy of a record; the others and the inbound side keep moving.
pub struct Distributor<T> {
    sinks: Vec<Sink<T>>,
    send_timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl<T: Clone + Send + 'static> Distributor<T> {
    pub fn new(send_timeout: Duration, stats: Arc<PipelineStats>) -> Self {
        Self {
            sinks: Vec::new(),
            send_timeout,
            stats,
        }
    }

    pub fn register(&mut self, name: &str, capacity: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.add_sink(name, tx);
        rx
    }

    pub fn add_sink(&mut self, name: &str, tx: mpsc::Sender<T>) {
        self.sinks.push(Sink {
            name: name.to_string(),
            tx,
        });
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Returns how many sinks accepted the record.
    pub async fn distribute(&mut self, record: T) -> usize {
        let timeout = self.send_timeout;
        let sends = self
            .sinks
            .iter()
            .map(|sink| timed_send(&sink.tx, record.clone(), timeout, &sink.name));
        let results = join_all(sends).await;

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => delivered += 1,
                Err(err @ SinkError::Full { .. }) => {
                    self.stats.record_sink_drop(&self.sinks[index].name);
                    tracing::warn!(
                        sink = %self.sinks[index].name,
                        timeout_ms = timeout.as_millis() as u64,
                        error = %err,
                        "dropping record for slow sink"
                    );
                }
                Err(err @ SinkError::Closed { .. }) => {
                    tracing::warn!(
                        sink = %self.sinks[index].name,
                        error = %err,
                        "removing closed sink"
                    );
                    closed.push(index);
                }
            }
        }
        for index in closed.into_iter().rev() {
            self.sinks.remove(index);
        }
        self.stats.records_distributed.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Runs until the inbound channel is closed and drained. Outbound senders
    /// are dropped only after that, so sinks see every record before closure.
    pub fn spawn(
        mut self,
        mut inbound: mpsc::Receiver<T>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(sinks = self.sinks.len(), "starting distributor");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        inbound.close();
                        while let Some(record) = inbound.recv().await {
                            self.distribute(record).await;
                        }
                        break;
                    }
                    next = inbound.recv() => match next {
                        Some(record) => {
                            self.distribute(record).await;
                        }
                        None => break,
                    },
                }
            }
            tracing::info!(sinks = self.sinks.len(), "inbound drained; closing sinks");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::Instant;

    fn distributor() -> (Distributor<u32>, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        (
            Distributor::new(Duration::from_millis(100), stats.clone()),
            stats,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_sink_does_not_block_healthy_sink() {
        let (mut distributor, stats) = distributor();
        let mut healthy = distributor.register("healthy", 8);
        let _stalled = distributor.register("stalled", 1);

        let started = Instant::now();
        for value in 0..3 {
            distributor.distribute(value).await;
        }
        // Two timed-out sends, each bounded by the send timeout.
        assert!(started.elapsed() <= Duration::from_millis(250));

        for expected in 0..3 {
            assert_eq!(healthy.recv().await, Some(expected));
        }
        assert_eq!(stats.sink_drops("stalled"), 2);
        assert_eq!(stats.sink_drops("healthy"), 0);
        assert_eq!(distributor.sink_count(), 2);
    }

    #[tokio::test]
    async fn closed_sink_is_skipped_and_removed() {
        let (mut distributor, _stats) = distributor();
        let mut open = distributor.register("open", 4);
        let gone = distributor.register("gone", 4);
        drop(gone);

        assert_eq!(distributor.distribute(7).await, 1);
        assert_eq!(distributor.sink_count(), 1);
        assert_eq!(distributor.distribute(8).await, 1);
        assert_eq!(open.recv().await, Some(7));
        assert_eq!(open.recv().await, Some(8));
    }

    #[tokio::test]
    async fn sinks_close_only_after_inbound_is_drained() {
        let (mut distributor, stats) = distributor();
        let mut first = distributor.register("first", 16);
        let mut second = distributor.register("second", 16);
        let (tx, rx) = mpsc::channel(16);
        let handle = distributor.spawn(rx, CancellationToken::new());

        for value in 0..5 {
            tx.send(value).await.unwrap();
        }
        for expected in 0..5 {
            assert_eq!(first.recv().await, Some(expected));
        }
        assert!(matches!(first.try_recv(), Err(TryRecvError::Empty)));

        drop(tx);
        handle.await.unwrap();
        assert_eq!(first.recv().await, None);
        for expected in 0..5 {
            assert_eq!(second.recv().await, Some(expected));
        }
        assert_eq!(second.recv().await, None);
        assert_eq!(stats.snapshot().records_distributed, 5);
    }

    #[tokio::test]
    async fn cancel_drains_buffered_inbound_records() {
        let (mut distributor, _stats) = distributor();
        let mut sink = distributor.register("sink", 16);
        let (tx, rx) = mpsc::channel(16);
        for value in 0..3 {
            tx.send(value).await.unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handle = distributor.spawn(rx, cancel);
        handle.await.unwrap();

        let mut received = Vec::new();
        while let Some(value) = sink.recv().await {
            received.push(value);
        }
        assert_eq!(received, vec![0, 1, 2]);
        assert!(tx.send(9).await.is_err());
    }
}
