//! Compile-time defaults and feature toggles.
//!
//! Every option is read with `option_env!` when the firmware is built, e.g.
//! `WIFI_SSID=lab DEVICE_ID=sensor-01 cargo build`. Options that are not set
//! fall back to the placeholders below.

/// Values baked into the firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub wifi_ssid: Option<&'static str>,
    pub wifi_password: Option<&'static str>,
    pub iothub_fqdn: Option<&'static str>,
    pub device_id: Option<&'static str>,
    pub device_key: Option<&'static str>,
    pub device_latitude: Option<&'static str>,
    pub device_longitude: Option<&'static str>,
    /// Enables both the HTTP portal and the persisted configuration.
    pub http_config_server: bool,
    /// Bumping this forces every device to re-seed storage on next boot.
    pub storage_version: u16,
}

pub const DEFAULT_STORAGE_VERSION: u16 = 2;

pub const BUILD_OPTIONS: BuildOptions = BuildOptions {
    wifi_ssid: Some(or_default(option_env!("WIFI_SSID"), "<WIFI_SSID>")),
    wifi_password: Some(or_default(option_env!("WIFI_PASSWORD"), "<WIFI_PASSWORD>")),
    iothub_fqdn: Some(or_default(
        option_env!("IOTHUB_FQDN"),
        "<IOT_HUB_NAME>.azure-devices.net",
    )),
    device_id: Some(or_default(option_env!("DEVICE_ID"), "<DEVICE_ID>")),
    device_key: Some(or_default(option_env!("DEVICE_KEY"), "<DEVICE_KEY>")),
    device_latitude: Some(or_default(option_env!("DEVICE_LATITUDE"), "-23.5505")),
    device_longitude: Some(or_default(option_env!("DEVICE_LONGITUDE"), "-46.6333")),
    http_config_server: parse_flag(option_env!("ENABLE_HTTP_CONFIG_SERVER"), true),
    storage_version: parse_u16(option_env!("STORAGE_VERSION"), DEFAULT_STORAGE_VERSION),
};

impl Default for BuildOptions {
    fn default() -> Self {
        BUILD_OPTIONS
    }
}

const fn or_default(value: Option<&'static str>, fallback: &'static str) -> &'static str {
    match value {
        Some(value) => value,
        None => fallback,
    }
}

/// `0` disables, any other non-empty value enables.
const fn parse_flag(value: Option<&str>, fallback: bool) -> bool {
    match value {
        Some(value) => {
            let bytes = value.as_bytes();
            if bytes.is_empty() {
                fallback
            } else {
                !(bytes.len() == 1 && bytes[0] == b'0')
            }
        }
        None => fallback,
    }
}

/// Decimal digits only; anything else (or an overflow) keeps the fallback.
const fn parse_u16(value: Option<&str>, fallback: u16) -> u16 {
    match value {
        Some(value) => {
            let bytes = value.as_bytes();
            if bytes.is_empty() {
                return fallback;
            }

            let mut result: u32 = 0;
            let mut i = 0;
            while i < bytes.len() {
                let digit = bytes[i];
                if digit < b'0' || digit > b'9' {
                    return fallback;
                }
                result = result * 10 + (digit - b'0') as u32;
                if result > u16::MAX as u32 {
                    return fallback;
                }
                i += 1;
            }
            result as u16
        }
        None => fallback,
    }
}
