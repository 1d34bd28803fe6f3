use crate::{field::TextField, options::BuildOptions};

pub const WIFI_SSID_CAPACITY: usize = 64;
pub const WIFI_PASSWORD_CAPACITY: usize = 64;
pub const IOTHUB_HOST_CAPACITY: usize = 128;
pub const DEVICE_ID_CAPACITY: usize = 64;
pub const DEVICE_KEY_CAPACITY: usize = 128;
pub const LATITUDE_CAPACITY: usize = 16;
pub const LONGITUDE_CAPACITY: usize = 16;

/// Sum of all field capacities; the size of the config block inside a
/// persisted record.
pub const DEVICE_CONFIG_BYTES: usize = WIFI_SSID_CAPACITY
    + WIFI_PASSWORD_CAPACITY
    + IOTHUB_HOST_CAPACITY
    + DEVICE_ID_CAPACITY
    + DEVICE_KEY_CAPACITY
    + LATITUDE_CAPACITY
    + LONGITUDE_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceConfig {
    pub wifi_ssid: TextField<WIFI_SSID_CAPACITY>,
    pub wifi_password: TextField<WIFI_PASSWORD_CAPACITY>,
    pub iothub_host: TextField<IOTHUB_HOST_CAPACITY>,
    pub device_id: TextField<DEVICE_ID_CAPACITY>,
    pub device_key: TextField<DEVICE_KEY_CAPACITY>,
    pub latitude: TextField<LATITUDE_CAPACITY>,
    pub longitude: TextField<LONGITUDE_CAPACITY>,
}

/// The seven editable fields, in storage and form order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    WifiSsid,
    WifiPassword,
    IothubHost,
    DeviceId,
    DeviceKey,
    Latitude,
    Longitude,
}

impl ConfigField {
    pub const ALL: [ConfigField; 7] = [
        Self::WifiSsid,
        Self::WifiPassword,
        Self::IothubHost,
        Self::DeviceId,
        Self::DeviceKey,
        Self::Latitude,
        Self::Longitude,
    ];

    pub fn form_name(self) -> &'static str {
        match self {
            Self::WifiSsid => "wifi_ssid",
            Self::WifiPassword => "wifi_password",
            Self::IothubHost => "iothub_host",
            Self::DeviceId => "device_id",
            Self::DeviceKey => "device_key",
            Self::Latitude => "latitude",
            Self::Longitude => "longitude",
        }
    }

    pub fn from_form_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.form_name() == name)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::WifiSsid => "WiFi SSID",
            Self::WifiPassword => "WiFi Password",
            Self::IothubHost => "IoT Hub Host",
            Self::DeviceId => "Device ID",
            Self::DeviceKey => "Device Key",
            Self::Latitude => "Latitude",
            Self::Longitude => "Longitude",
        }
    }

    /// Rendered as a password input.
    pub fn is_secret(self) -> bool {
        matches!(self, Self::WifiPassword | Self::DeviceKey)
    }

    /// Buffer size in bytes, terminator included.
    pub fn capacity(self) -> usize {
        match self {
            Self::WifiSsid => WIFI_SSID_CAPACITY,
            Self::WifiPassword => WIFI_PASSWORD_CAPACITY,
            Self::IothubHost => IOTHUB_HOST_CAPACITY,
            Self::DeviceId => DEVICE_ID_CAPACITY,
            Self::DeviceKey => DEVICE_KEY_CAPACITY,
            Self::Latitude => LATITUDE_CAPACITY,
            Self::Longitude => LONGITUDE_CAPACITY,
        }
    }

    pub fn default_value(self, options: &BuildOptions) -> Option<&'static str> {
        match self {
            Self::WifiSsid => options.wifi_ssid,
            Self::WifiPassword => options.wifi_password,
            Self::IothubHost => options.iothub_fqdn,
            Self::DeviceId => options.device_id,
            Self::DeviceKey => options.device_key,
            Self::Latitude => options.device_latitude,
            Self::Longitude => options.device_longitude,
        }
    }
}

impl DeviceConfig {
    pub fn from_defaults(options: &BuildOptions) -> Self {
        let mut config = Self::default();
        for field in ConfigField::ALL {
            config.set(field, field.default_value(options));
        }
        config
    }

    pub fn get(&self, field: ConfigField) -> &str {
        match field {
            ConfigField::WifiSsid => self.wifi_ssid.as_str(),
            ConfigField::WifiPassword => self.wifi_password.as_str(),
            ConfigField::IothubHost => self.iothub_host.as_str(),
            ConfigField::DeviceId => self.device_id.as_str(),
            ConfigField::DeviceKey => self.device_key.as_str(),
            ConfigField::Latitude => self.latitude.as_str(),
            ConfigField::Longitude => self.longitude.as_str(),
        }
    }

    /// Copy-with-truncation into `field`.
    pub fn set(&mut self, field: ConfigField, value: Option<&str>) {
        match field {
            ConfigField::WifiSsid => self.wifi_ssid.set(value),
            ConfigField::WifiPassword => self.wifi_password.set(value),
            ConfigField::IothubHost => self.iothub_host.set(value),
            ConfigField::DeviceId => self.device_id.set(value),
            ConfigField::DeviceKey => self.device_key.set(value),
            ConfigField::Latitude => self.latitude.set(value),
            ConfigField::Longitude => self.longitude.set(value),
        }
    }

    pub fn raw(&self, field: ConfigField) -> &[u8] {
        match field {
            ConfigField::WifiSsid => self.wifi_ssid.raw(),
            ConfigField::WifiPassword => self.wifi_password.raw(),
            ConfigField::IothubHost => self.iothub_host.raw(),
            ConfigField::DeviceId => self.device_id.raw(),
            ConfigField::DeviceKey => self.device_key.raw(),
            ConfigField::Latitude => self.latitude.raw(),
            ConfigField::Longitude => self.longitude.raw(),
        }
    }

    pub fn load_raw(&mut self, field: ConfigField, raw: &[u8]) {
        match field {
            ConfigField::WifiSsid => self.wifi_ssid.load_raw(raw),
            ConfigField::WifiPassword => self.wifi_password.load_raw(raw),
            ConfigField::IothubHost => self.iothub_host.load_raw(raw),
            ConfigField::DeviceId => self.device_id.load_raw(raw),
            ConfigField::DeviceKey => self.device_key.load_raw(raw),
            ConfigField::Latitude => self.latitude.load_raw(raw),
            ConfigField::Longitude => self.longitude.load_raw(raw),
        }
    }
}
