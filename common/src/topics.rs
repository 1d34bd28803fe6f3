//! IoT Hub MQTT identity strings.

pub const IOTHUB_MQTT_PORT: u16 = 8883;
pub const IOTHUB_API_VERSION: &str = "2020-09-30";

pub fn telemetry_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

pub fn mqtt_username(iothub_host: &str, device_id: &str) -> String {
    format!("{iothub_host}/{device_id}/?api-version={IOTHUB_API_VERSION}")
}
