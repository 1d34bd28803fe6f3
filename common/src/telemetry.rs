use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::DeviceConfig;

/// Size of the device's outgoing message buffer.
pub const MAX_TELEMETRY_PAYLOAD_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_c: f32,
    pub humidity: f32,
}

impl Reading {
    /// Stand-in values until a real sensor driver is wired in.
    pub fn simulated(tick: u64) -> Self {
        Self {
            temperature_c: 20.0 + (tick % 10) as f32,
            humidity: 50.0 + (tick % 20) as f32,
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry payload is {len} bytes, limit is {MAX_TELEMETRY_PAYLOAD_BYTES}")]
    PayloadTooLarge { len: usize },
    #[error("failed to serialize telemetry payload")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct TelemetryPayload<'a> {
    #[serde(rename = "msgCount")]
    msg_count: u32,
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    timestamp: String,
    #[serde(rename = "ipAddress")]
    ip_address: String,
    temperature: f64,
    humidity: f64,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Builds the JSON telemetry message and numbers each one.
#[derive(Debug, Default)]
pub struct TelemetryFormatter {
    next_count: u32,
}

impl TelemetryFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages numbered so far.
    pub fn sent(&self) -> u32 {
        self.next_count
    }

    pub fn format(
        &mut self,
        config: &DeviceConfig,
        reading: Reading,
        ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<String, TelemetryError> {
        let msg_count = self.next_count;
        self.next_count = self.next_count.wrapping_add(1);

        let payload = TelemetryPayload {
            msg_count,
            device_id: config.device_id.as_str(),
            timestamp: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ip_address: ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).to_string(),
            temperature: round_hundredths(reading.temperature_c),
            humidity: round_hundredths(reading.humidity),
            latitude: parse_coordinate(config.latitude.as_str()),
            longitude: parse_coordinate(config.longitude.as_str()),
        };

        let body = serde_json::to_string(&payload)?;
        if body.len() > MAX_TELEMETRY_PAYLOAD_BYTES {
            return Err(TelemetryError::PayloadTooLarge { len: body.len() });
        }
        Ok(body)
    }
}

fn round_hundredths(value: f32) -> f64 {
    (f64::from(value) * 100.0).round() / 100.0
}

fn parse_coordinate(text: &str) -> Option<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigField;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.set(ConfigField::DeviceId, Some("sensor-42"));
        config.set(ConfigField::Latitude, Some("-23.5505"));
        config.set(ConfigField::Longitude, Some("-46.6333"));
        config
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn formats_full_message() {
        let mut formatter = TelemetryFormatter::new();
        let reading = Reading {
            temperature_c: 24.5,
            humidity: 61.25,
        };
        let ip = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 42)));

        let body = formatter.format(&config(), reading, ip, now()).unwrap();
        let value: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(
            value,
            json!({
                "msgCount": 0,
                "deviceId": "sensor-42",
                "timestamp": "2026-03-14T15:09:26Z",
                "ipAddress": "192.168.0.42",
                "temperature": 24.5,
                "humidity": 61.25,
                "latitude": -23.5505,
                "longitude": -46.6333,
            })
        );
        assert!(body.starts_with("{\"msgCount\":0,\"deviceId\""));
    }

    #[test]
    fn counter_increments_per_message() {
        let mut formatter = TelemetryFormatter::new();
        let reading = Reading::simulated(0);

        for expected in 0..3_u64 {
            let body = formatter.format(&config(), reading, None, now()).unwrap();
            let value: Value = serde_json::from_str(&body).unwrap();
            assert_eq!(value["msgCount"], json!(expected));
            assert_eq!(value["ipAddress"], json!("0.0.0.0"));
        }
        assert_eq!(formatter.sent(), 3);
    }

    #[test]
    fn unparsable_coordinates_become_null() {
        let mut config = config();
        config.set(ConfigField::Latitude, Some("north"));
        config.set(ConfigField::Longitude, None);

        let body = TelemetryFormatter::new()
            .format(&config, Reading::simulated(1), None, now())
            .unwrap();
        let value: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(value["latitude"], Value::Null);
        assert_eq!(value["longitude"], Value::Null);
    }

    #[test]
    fn rejects_payload_over_buffer_size() {
        let mut config = config();
        config.set(ConfigField::DeviceId, Some("d".repeat(63).as_str()));
        let mut formatter = TelemetryFormatter::new();
        // Long enough to overflow once combined with the other fields.
        let ip = Some(IpAddr::V6("2001:db8:85a3:8d3:1319:8a2e:370:7348".parse().unwrap()));
        let reading = Reading {
            temperature_c: -12345.678,
            humidity: 98765.43,
        };

        let within = formatter.format(&config, Reading::simulated(2), None, now());
        assert!(within.is_ok());

        let mut bloated = config;
        bloated.set(ConfigField::Latitude, Some("-23.555555555555"));
        bloated.set(ConfigField::Longitude, Some("-46.633333333333"));
        let result = formatter.format(&bloated, reading, ip, now());
        assert!(matches!(
            result,
            Err(TelemetryError::PayloadTooLarge { len }) if len > MAX_TELEMETRY_PAYLOAD_BYTES
        ));
    }

    #[test]
    fn simulated_readings_stay_in_range() {
        for tick in 0..50 {
            let reading = Reading::simulated(tick);
            assert!((20.0..30.0).contains(&reading.temperature_c));
            assert!((50.0..70.0).contains(&reading.humidity));
        }
    }
}
