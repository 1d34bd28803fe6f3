//! Binary layout of the persisted configuration record.
//!
//! ```text
//! offset  size  content
//! 0       4     magic, u32 little endian ("AIZ1")
//! 4       2     storage version, u16 little endian
//! 6       480   seven fields at their fixed capacities, in `ConfigField::ALL` order
//! ```

use crate::config::{ConfigField, DeviceConfig, DEVICE_CONFIG_BYTES};

pub const CONFIG_MAGIC: u32 = 0x4149_5A31;

const MAGIC_BYTES: usize = 4;
const VERSION_BYTES: usize = 2;
const HEADER_BYTES: usize = MAGIC_BYTES + VERSION_BYTES;

pub const RECORD_SIZE: usize = HEADER_BYTES + DEVICE_CONFIG_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedRecord {
    pub magic: u32,
    pub version: u16,
    pub config: DeviceConfig,
}

impl PersistedRecord {
    pub fn new(config: DeviceConfig, version: u16) -> Self {
        Self {
            magic: CONFIG_MAGIC,
            version,
            config,
        }
    }

    /// Both the magic and the version must match what this firmware writes.
    pub fn is_valid(&self, expected_version: u16) -> bool {
        self.magic == CONFIG_MAGIC && self.version == expected_version
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0_u8; RECORD_SIZE];
        bytes[..MAGIC_BYTES].copy_from_slice(&self.magic.to_le_bytes());
        bytes[MAGIC_BYTES..HEADER_BYTES].copy_from_slice(&self.version.to_le_bytes());

        let mut offset = HEADER_BYTES;
        for field in ConfigField::ALL {
            let raw = self.config.raw(field);
            bytes[offset..offset + raw.len()].copy_from_slice(raw);
            offset += raw.len();
        }

        bytes
    }

    /// Decodes without validating; erased or foreign bytes come back as a
    /// record whose magic does not match.
    pub fn decode(bytes: &[u8; RECORD_SIZE]) -> Self {
        let mut magic = [0_u8; MAGIC_BYTES];
        magic.copy_from_slice(&bytes[..MAGIC_BYTES]);
        let mut version = [0_u8; VERSION_BYTES];
        version.copy_from_slice(&bytes[MAGIC_BYTES..HEADER_BYTES]);

        let mut config = DeviceConfig::default();
        let mut offset = HEADER_BYTES;
        for field in ConfigField::ALL {
            let capacity = field.capacity();
            config.load_raw(field, &bytes[offset..offset + capacity]);
            offset += capacity;
        }

        Self {
            magic: u32::from_le_bytes(magic),
            version: u16::from_le_bytes(version),
            config,
        }
    }
}
