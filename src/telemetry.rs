use crate::error::DecodeError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A message body the queue consumer knows how to decode and validate.
pub trait InboundRecord: Send + Sized + 'static {
    const KIND: &'static str;

    fn decode(payload: &mut [u8], received_at: DateTime<Utc>) -> Result<Self, DecodeError>;

    fn device_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Remaining message fields, kept verbatim for downstream processors.
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub wifi_connected: bool,
    pub broker_connected: bool,
    pub uptime_ms: Option<i64>,
    pub sensors: BTreeMap<String, bool>,
}

#[derive(Debug, Deserialize)]
struct WireHeartbeat {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    wifi_connected: bool,
    #[serde(default, alias = "mqtt_connected")]
    broker_connected: bool,
    #[serde(default)]
    uptime_ms: Option<i64>,
    #[serde(default)]
    sensors: BTreeMap<String, bool>,
}

impl InboundRecord for TelemetryRecord {
    const KIND: &'static str = "telemetry";

    fn decode(payload: &mut [u8], received_at: DateTime<Utc>) -> Result<Self, DecodeError> {
        let Value::Object(mut fields) = simd_json::serde::from_slice::<Value>(payload)? else {
            return Err(DecodeError::NotAnObject);
        };

        let device_id = fields
            .remove("device_id")
            .as_ref()
            .and_then(Value::as_str)
            .and_then(normalize_device_id)
            .ok_or(DecodeError::MissingDeviceId)?;
        let timestamp = fields
            .remove("timestamp")
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        Ok(Self {
            device_id,
            timestamp,
            payload: fields,
        })
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl InboundRecord for HeartbeatRecord {
    const KIND: &'static str = "heartbeat";

    fn decode(payload: &mut [u8], received_at: DateTime<Utc>) -> Result<Self, DecodeError> {
        if first_non_space(payload) != Some(b'{') {
            return Err(DecodeError::NotAnObject);
        }
        let wire: WireHeartbeat = simd_json::serde::from_slice(payload)?;
        let device_id = wire
            .device_id
            .as_deref()
            .and_then(normalize_device_id)
            .ok_or(DecodeError::MissingDeviceId)?;
        let timestamp = wire
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        Ok(Self {
            device_id,
            timestamp,
            wifi_connected: wire.wifi_connected,
            broker_connected: wire.broker_connected,
            uptime_ms: wire.uptime_ms,
            sensors: wire.sensors,
        })
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

fn normalize_device_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_non_space(payload: &[u8]) -> Option<u8> {
    payload
        .iter()
        .copied()
        .find(|byte| !byte.is_ascii_whitespace())
}

// Strings are RFC 3339, integers are epoch millis, floats are epoch seconds.
// Publishers that leave the field zeroed get the receive time instead.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let parsed = match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(number) => {
            if let Some(ms) = number.as_i64() {
                millis_to_dt(ms)
            } else {
                number.as_f64().and_then(|ts| millis_to_dt((ts * 1000.0) as i64))
            }
        }
        _ => None,
    }?;
    if parsed.timestamp() <= 0 {
        return None;
    }
    Some(parsed)
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    let secs = ms.div_euclid(1000);
    let nanos = (ms.rem_euclid(1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}
