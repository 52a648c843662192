mod archive;
mod batch;
mod config;
mod consumer;
mod distributor;
mod error;
mod health;
mod processor;
mod stats;
mod telemetry;

use crate::archive::{build_pool, PgArchiveStore};
use crate::batch::BatchBuffer;
use crate::config::Config;
use crate::consumer::{AmqpConnector, QueueConsumer};
use crate::distributor::{timed_send, Distributor};
use crate::health::HealthMonitor;
use crate::processor::{spawn_processor, HealthEventLogger, TelemetryLogger};
use crate::stats::PipelineStats;
use crate::telemetry::{HeartbeatRecord, TelemetryRecord};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_relay=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    match config
        .otlp_endpoint
        .as_deref()
        .map(normalize_otlp_http_endpoint)
        .filter(|endpoint| !endpoint.is_empty())
    {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(
                    vec![KeyValue::new("service.name", "telemetry-relay")],
                )))
                .install_batch(Tokio)?;

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() || trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Waits for `handle` until `deadline`, aborting it if the deadline passes.
async fn join_by<T>(
    deadline: Instant,
    component: &'static str,
    mut handle: JoinHandle<T>,
) -> bool {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            tracing::error!(component, error = %err, "task failed");
            true
        }
        Err(_) => {
            handle.abort();
            tracing::warn!(component, "did not finish before shutdown deadline; aborting");
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::from_env()?;
    init_tracing(&config)?;
    config.clamp();

    let stats = Arc::new(PipelineStats::new());

    let pool = build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("failed to connect to archive database")?;
    let store = PgArchiveStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to prepare archive table")?;

    let connector = AmqpConnector::new(config.rabbitmq_url.clone());
    let telemetry_consumer = Arc::new(QueueConsumer::new(
        connector.clone(),
        config.consumer_settings("telemetry", &config.telemetry_queue),
        stats.clone(),
    ));
    let heartbeat_consumer = Arc::new(QueueConsumer::new(
        connector,
        config.consumer_settings("heartbeat", &config.heartbeat_queue),
        stats.clone(),
    ));
    telemetry_consumer
        .connect()
        .await
        .context("failed to connect telemetry consumer")?;
    heartbeat_consumer
        .connect()
        .await
        .context("failed to connect heartbeat consumer")?;

    let mut distributor = Distributor::new(config.sink_send_timeout(), stats.clone());
    let archive_rx = distributor.register("archive", config.sink_capacity);
    let processor_rx = distributor.register("processors", config.sink_capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel::<TelemetryRecord>(config.sink_capacity);
    let distributor_cancel = CancellationToken::new();
    let distributor_handle = distributor.spawn(inbound_rx, distributor_cancel.clone());

    let batch = BatchBuffer::new(config.batch_settings(), Arc::new(store), stats.clone())
        .spawn(archive_rx);
    let telemetry_processor = spawn_processor("telemetry_logger", processor_rx, TelemetryLogger);

    let (event_tx, event_rx) = mpsc::channel(config.sink_capacity);
    let monitor = HealthMonitor::new(config.health_timeout(), event_tx, config.sink_send_timeout());
    for device_id in &config.expected_devices {
        monitor.track(device_id).await;
    }
    let scanner_cancel = CancellationToken::new();
    let scanner = monitor.spawn_scanner(config.health_scan_interval(), scanner_cancel.clone());
    let event_processor = spawn_processor("health_event_logger", event_rx, HealthEventLogger);

    let intake = CancellationToken::new();
    let consumer_exit = CancellationToken::new();

    let telemetry_task = {
        let consumer = telemetry_consumer.clone();
        let cancel = intake.clone();
        let exit = consumer_exit.clone();
        let handler_timeout = config.handler_timeout();
        tokio::spawn(async move {
            consumer
                .consume(cancel, move |record: TelemetryRecord| {
                    let tx = inbound_tx.clone();
                    async move {
                        timed_send(&tx, record, handler_timeout, "distributor").await?;
                        Ok::<_, anyhow::Error>(())
                    }
                })
                .await;
            exit.cancel();
        })
    };

    let heartbeat_task = {
        let consumer = heartbeat_consumer.clone();
        let monitor = monitor.clone();
        let cancel = intake.clone();
        let exit = consumer_exit.clone();
        tokio::spawn(async move {
            consumer
                .consume(cancel, move |record: HeartbeatRecord| {
                    let monitor = monitor.clone();
                    async move {
                        let device_id = record.device_id.clone();
                        monitor.update_heartbeat(&device_id, record).await;
                        Ok::<_, anyhow::Error>(())
                    }
                })
                .await;
            exit.cancel();
        })
    };

    tracing::info!(
        telemetry_queue = %config.telemetry_queue,
        heartbeat_queue = %config.heartbeat_queue,
        expected_devices = config.expected_devices.len(),
        "telemetry relay running"
    );

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        _ = consumer_exit.cancelled() => {
            tracing::error!("a queue consumer stopped unexpectedly; shutting down");
        }
    }

    let deadline = Instant::now() + config.shutdown_timeout();
    let mut unfinished: Vec<&'static str> = Vec::new();

    // Stop intake first; dropping the consumer handlers closes the distributor inbound.
    intake.cancel();
    let (telemetry_closed, heartbeat_closed) = tokio::join!(
        telemetry_consumer.close_by(deadline),
        heartbeat_consumer.close_by(deadline)
    );
    if !telemetry_closed {
        unfinished.push("telemetry_consumer_close");
    }
    if !heartbeat_closed {
        unfinished.push("heartbeat_consumer_close");
    }
    if !join_by(deadline, "telemetry_consumer", telemetry_task).await {
        unfinished.push("telemetry_consumer");
    }
    if !join_by(deadline, "heartbeat_consumer", heartbeat_task).await {
        unfinished.push("heartbeat_consumer");
    }

    distributor_cancel.cancel();
    if !join_by(deadline, "distributor", distributor_handle).await {
        unfinished.push("distributor");
    }

    let grace = config
        .batch_shutdown_grace()
        .min(deadline.saturating_duration_since(Instant::now()));
    if !batch.shutdown(grace).await {
        unfinished.push("batch_buffer");
    }
    if !join_by(deadline, "telemetry_logger", telemetry_processor).await {
        unfinished.push("telemetry_logger");
    }

    scanner_cancel.cancel();
    if !join_by(deadline, "health_scanner", scanner).await {
        unfinished.push("health_scanner");
    }
    let devices = monitor.devices().await;
    tracing::info!(
        devices = devices.len(),
        timed_out = devices
            .iter()
            .filter(|d| d.status == health::DeviceStatus::TimedOut)
            .count(),
        "device health at shutdown"
    );
    drop(monitor);
    if !join_by(deadline, "health_event_logger", event_processor).await {
        unfinished.push("health_event_logger");
    }

    if !unfinished.is_empty() {
        tracing::warn!(
            components = ?unfinished,
            "shutdown deadline reached with unfinished components"
        );
    }

    let snapshot = stats.snapshot();
    tracing::info!(
        broker_connected = snapshot.broker_connected,
        consumed = snapshot.records_consumed,
        rejected = snapshot.records_rejected,
        distributed = snapshot.records_distributed,
        sink_drops = ?snapshot.sink_drops,
        flushes_ok = snapshot.flushes_ok,
        flushes_failed = snapshot.flushes_failed,
        archived = snapshot.records_archived,
        discarded = snapshot.records_discarded,
        buffered = snapshot.buffered_records,
        last_flush_unix_ms = ?snapshot.last_flush_unix_ms,
        average_flush_micros = snapshot.average_flush_micros,
        last_error = ?snapshot.last_error,
        "telemetry relay stopped"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
