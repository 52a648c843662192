use super::{DeviceHealth, DeviceStatus, HealthEvent};
use crate::telemetry::HeartbeatRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub(in crate::health) struct DeviceEntry {
    pub(in crate::health) last_seen: Instant,
    pub(in crate::health) last_seen_at: DateTime<Utc>,
    pub(in crate::health) status: DeviceStatus,
    pub(in crate::health) timed_out: Option<(Instant, DateTime<Utc>)>,
    pub(in crate::health) last_heartbeat: Option<HeartbeatRecord>,
}

impl DeviceEntry {
    fn fresh(now: Instant, now_at: DateTime<Utc>, heartbeat: Option<HeartbeatRecord>) -> Self {
        Self {
            last_seen: now,
            last_seen_at: now_at,
            status: DeviceStatus::Healthy,
            timed_out: None,
            last_heartbeat: heartbeat,
        }
    }

    pub(in crate::health) fn snapshot(&self, device_id: &str) -> DeviceHealth {
        DeviceHealth {
            device_id: device_id.to_string(),
            last_seen: self.last_seen_at,
            status: self.status,
            timed_out_at: self.timed_out.map(|(_, at)| at),
            last_heartbeat: self.last_heartbeat.clone(),
        }
    }
}

pub(in crate::health) enum Touch {
    Registered,
    Refreshed,
    Recovered(Duration),
}

#[derive(Debug, Default)]
pub(in crate::health) struct Registry {
    pub(in crate::health) devices: HashMap<String, DeviceEntry>,
}

impl Registry {
    pub(in crate::health) fn track(
        &mut self,
        device_id: &str,
        now: Instant,
        now_at: DateTime<Utc>,
    ) -> bool {
        if self.devices.contains_key(device_id) {
            return false;
        }
        self.devices
            .insert(device_id.to_string(), DeviceEntry::fresh(now, now_at, None));
        true
    }

    pub(in crate::health) fn touch(
        &mut self,
        device_id: &str,
        heartbeat: HeartbeatRecord,
        now: Instant,
        now_at: DateTime<Utc>,
    ) -> Touch {
        let Some(entry) = self.devices.get_mut(device_id) else {
            self.devices.insert(
                device_id.to_string(),
                DeviceEntry::fresh(now, now_at, Some(heartbeat)),
            );
            return Touch::Registered;
        };

        entry.last_seen = now;
        entry.last_seen_at = now_at;
        entry.last_heartbeat = Some(heartbeat);
        match (entry.status, entry.timed_out.take()) {
            (DeviceStatus::TimedOut, Some((timed_out_at, _))) => {
                entry.status = DeviceStatus::Healthy;
                Touch::Recovered(now.saturating_duration_since(timed_out_at))
            }
            _ => {
                entry.status = DeviceStatus::Healthy;
                Touch::Refreshed
            }
        }
    }

    /// Marks every healthy device silent for longer than `threshold` as timed
    /// out and returns one event per transition.
    pub(in crate::health) fn expire(
        &mut self,
        threshold: Duration,
        now: Instant,
        now_at: DateTime<Utc>,
    ) -> Vec<HealthEvent> {
        let mut events = Vec::new();
        for (device_id, entry) in self.devices.iter_mut() {
            if entry.status == DeviceStatus::TimedOut {
                continue;
            }
            let elapsed = now.saturating_duration_since(entry.last_seen);
            if elapsed <= threshold {
                continue;
            }
            entry.status = DeviceStatus::TimedOut;
            entry.timed_out = Some((now, now_at));
            events.push(HealthEvent::Timeout {
                device_id: device_id.clone(),
                last_seen: entry.last_seen_at,
                elapsed,
                last_heartbeat: entry.last_heartbeat.clone(),
            });
        }
        events
    }
}
