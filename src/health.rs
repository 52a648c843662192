mod state;


use crate::distributor::timed_send;
use crate::error::SinkError;
use crate::telemetry::HeartbeatRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_SINK: &str = "health_events";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Healthy,
    TimedOut,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    pub status: DeviceStatus,
    pub timed_out_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<HeartbeatRecord>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HealthEvent {
    Timeout {
        device_id: String,
        last_seen: DateTime<Utc>,
        elapsed: Duration,
        last_heartbeat: Option<HeartbeatRecord>,
    },
    Recovered {
        device_id: String,
        down_duration: Duration,
    },
}

impl HealthEvent {
    pub fn device_id(&self) -> &str {
        match self {
            HealthEvent::Timeout { device_id, .. } | HealthEvent::Recovered { device_id, .. } => {
                device_id
            }
        }
    }
}

/// Liveness registry fed by heartbeats. All access goes through one lock;
/// events are only sent once it has been released.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<RwLock<state::Registry>>,
    timeout: Duration,
    events: mpsc::Sender<HealthEvent>,
    emit_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        timeout: Duration,
        events: mpsc::Sender<HealthEvent>,
        emit_timeout: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(RwLock::new(state::Registry::default())),
            timeout,
            events,
            emit_timeout,
        }
    }

    /// Registers a device expected to report; it times out like any other if it never does.
    pub async fn track(&self, device_id: &str) {
        let added = self
            .registry
            .write()
            .await
            .track(device_id, Instant::now(), Utc::now());
        if added {
            tracing::info!(device_id, "tracking expected device");
        }
    }

    pub async fn update_heartbeat(&self, device_id: &str, record: HeartbeatRecord) {
        let touch = self
            .registry
            .write()
            .await
            .touch(device_id, record, Instant::now(), Utc::now());
        match touch {
            state::Touch::Registered => {
                tracing::info!(device_id, "new device registered");
            }
            state::Touch::Refreshed => {
                tracing::trace!(device_id, "heartbeat");
            }
            state::Touch::Recovered(down_duration) => {
                tracing::info!(
                    device_id,
                    down_secs = down_duration.as_secs_f64(),
                    "device recovered"
                );
                self.emit(HealthEvent::Recovered {
                    device_id: device_id.to_string(),
                    down_duration,
                })
                .await;
            }
        }
    }

    /// One pass over the registry. Returns the number of devices that timed out.
    pub async fn scan(&self) -> usize {
        let events = {
            let mut registry = self.registry.write().await;
            registry.expire(self.timeout, Instant::now(), Utc::now())
        };
        let timed_out = events.len();
        for event in events {
            if let HealthEvent::Timeout {
                device_id, elapsed, ..
            } = &event
            {
                tracing::warn!(
                    device_id = %device_id,
                    elapsed_secs = elapsed.as_secs(),
                    threshold_secs = self.timeout.as_secs(),
                    "device timed out"
                );
            }
            self.emit(event).await;
        }
        timed_out
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceHealth> {
        self.registry
            .read()
            .await
            .devices
            .get(device_id)
            .map(|entry| entry.snapshot(device_id))
    }

    pub async fn devices(&self) -> Vec<DeviceHealth> {
        let registry = self.registry.read().await;
        let mut devices: Vec<DeviceHealth> = registry
            .devices
            .iter()
            .map(|(device_id, entry)| entry.snapshot(device_id))
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn spawn_scanner(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                interval_ms = interval.as_millis() as u64,
                timeout_secs = monitor.timeout.as_secs(),
                "starting health scanner"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.scan().await;
                    }
                }
            }
            tracing::info!("health scanner stopped");
        })
    }

    async fn emit(&self, event: HealthEvent) {
        let device_id = event.device_id().to_string();
        match timed_send(&self.events, event, self.emit_timeout, EVENT_SINK).await {
            Ok(()) => {}
            Err(err @ SinkError::Full { .. }) => {
                tracing::warn!(device_id = %device_id, error = %err, "dropping health event");
            }
            Err(err @ SinkError::Closed { .. }) => {
                tracing::debug!(device_id = %device_id, error = %err, "health event sink closed");
            }
        }
    }
}
