use crate::health::HealthEvent;
use crate::telemetry::TelemetryRecord;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Downstream consumer of one distributor channel, such as anomaly checks or
/// notification senders.
#[async_trait]
pub trait RecordProcessor<T: Send + 'static>: Send + 'static {
    async fn process(&mut self, item: T) -> Result<()>;
}

/// Drains `rx` into `processor` until the sending side closes. Processing
/// errors are logged and never stop the drain.
pub fn spawn_processor<T, P>(
    name: &str,
    mut rx: mpsc::Receiver<T>,
    mut processor: P,
) -> JoinHandle<u64>
where
    T: Send + 'static,
    P: RecordProcessor<T>,
{
    let name = name.to_string();
    tokio::spawn(async move {
        let mut processed: u64 = 0;
        while let Some(item) = rx.recv().await {
            processed += 1;
            if let Err(err) = processor.process(item).await {
                tracing::warn!(processor = %name, error = %err, "processor failed");
            }
        }
        tracing::info!(processor = %name, processed, "processor drained");
        processed
    })
}

/// Logs each telemetry record at debug level.
pub struct TelemetryLogger;

#[async_trait]
impl RecordProcessor<TelemetryRecord> for TelemetryLogger {
    async fn process(&mut self, record: TelemetryRecord) -> Result<()> {
        tracing::debug!(
            device_id = %record.device_id,
            timestamp = %record.timestamp,
            fields = record.payload.len(),
            "telemetry"
        );
        Ok(())
    }
}

pub struct HealthEventLogger;

#[async_trait]
impl RecordProcessor<HealthEvent> for HealthEventLogger {
    async fn process(&mut self, event: HealthEvent) -> Result<()> {
        match event {
            HealthEvent::Timeout {
                device_id,
                last_seen,
                elapsed,
                last_heartbeat,
            } => {
                tracing::warn!(
                    device_id = %device_id,
                    last_seen = %last_seen,
                    elapsed_secs = elapsed.as_secs(),
                    wifi_connected = last_heartbeat.as_ref().map(|hb| hb.wifi_connected),
                    uptime_ms = last_heartbeat.as_ref().and_then(|hb| hb.uptime_ms),
                    "device offline"
                );
            }
            HealthEvent::Recovered {
                device_id,
                down_duration,
            } => {
                tracing::info!(
                    device_id = %device_id,
                    down_secs = down_duration.as_secs(),
                    "device back online"
                );
            }
        }
        Ok(())
    }
}
