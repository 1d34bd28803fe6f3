use crate::{
    config::DeviceConfig,
    options::BuildOptions,
    record::{PersistedRecord, RECORD_SIZE},
    storage::{ByteStorage, StorageError},
};

const RECORD_OFFSET: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Enabled,
    Disabled,
}

/// Which source the loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Persistence is disabled; compiled-in defaults only.
    Defaults,
    /// A valid record was found and replaced the defaults.
    Restored,
    /// No valid record; the defaults were written as the new baseline.
    Seeded,
}

/// Durable configuration lifecycle on top of a [`ByteStorage`] region.
pub struct ConfigStore<S> {
    storage: S,
    options: BuildOptions,
    persistence: Persistence,
    ready: bool,
}

impl<S: ByteStorage> ConfigStore<S> {
    /// Persistence follows the HTTP portal toggle.
    pub fn new(storage: S, options: BuildOptions) -> Self {
        let persistence = if options.http_config_server {
            Persistence::Enabled
        } else {
            Persistence::Disabled
        };
        Self::with_persistence(storage, options, persistence)
    }

    pub fn with_persistence(storage: S, options: BuildOptions, persistence: Persistence) -> Self {
        Self {
            storage,
            options,
            persistence,
            ready: false,
        }
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn storage_version(&self) -> u16 {
        self.options.storage_version
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Fills `out` with the compiled-in defaults, then lets a valid stored
    /// record win. Without one, the defaults are seeded into storage.
    ///
    /// `out` holds usable defaults even when an error is returned.
    pub fn load(&mut self, out: &mut DeviceConfig) -> Result<LoadOutcome, StorageError> {
        *out = DeviceConfig::from_defaults(&self.options);

        if self.persistence == Persistence::Disabled {
            return Ok(LoadOutcome::Defaults);
        }

        self.ensure_ready()?;

        // An unreadable record is handled exactly like an invalid one.
        if let Ok(record) = self.read_record() {
            if record.is_valid(self.options.storage_version) {
                *out = record.config;
                return Ok(LoadOutcome::Restored);
            }
        }

        self.write_record(out)?;
        Ok(LoadOutcome::Seeded)
    }

    pub fn save(&mut self, config: &DeviceConfig) -> Result<(), StorageError> {
        if self.persistence == Persistence::Disabled {
            return Ok(());
        }

        self.ensure_ready()?;
        self.write_record(config)
    }

    /// Initialises the storage region once; later calls do nothing.
    pub fn ensure_ready(&mut self) -> Result<(), StorageError> {
        if !self.ready {
            self.storage.begin(RECORD_SIZE)?;
            self.ready = true;
        }
        Ok(())
    }

    fn read_record(&self) -> Result<PersistedRecord, StorageError> {
        let mut bytes = [0_u8; RECORD_SIZE];
        self.storage.get(RECORD_OFFSET, &mut bytes)?;
        Ok(PersistedRecord::decode(&bytes))
    }

    fn write_record(&mut self, config: &DeviceConfig) -> Result<(), StorageError> {
        let record = PersistedRecord::new(*config, self.options.storage_version);
        self.storage.put(RECORD_OFFSET, &record.encode())?;
        self.storage.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConfigField, record::CONFIG_MAGIC, storage::MemoryRegion};
    use pretty_assertions::assert_eq;

    fn options(version: u16) -> BuildOptions {
        BuildOptions {
            wifi_ssid: Some("factory-ssid"),
            wifi_password: Some("factory-pass"),
            iothub_fqdn: Some("hub.azure-devices.net"),
            device_id: Some("factory-device"),
            device_key: Some("factory-key"),
            device_latitude: Some("-23.5505"),
            device_longitude: Some("-46.6333"),
            http_config_server: true,
            storage_version: version,
        }
    }

    fn stored_config() -> DeviceConfig {
        let mut config = DeviceConfig::from_defaults(&options(2));
        config.set(ConfigField::WifiSsid, Some("field-ssid"));
        config.set(ConfigField::DeviceId, Some("sensor-42"));
        config
    }

    fn region_with(record: PersistedRecord) -> MemoryRegion {
        MemoryRegion::with_contents(&record.encode())
    }

    #[test]
    fn erased_storage_is_seeded_with_defaults() {
        let mut store = ConfigStore::new(MemoryRegion::erased(), options(2));
        let mut config = DeviceConfig::default();

        let outcome = store.load(&mut config).unwrap();

        assert_eq!(outcome, LoadOutcome::Seeded);
        assert_eq!(config, DeviceConfig::from_defaults(&options(2)));

        let written: [u8; RECORD_SIZE] = store.storage().committed().try_into().unwrap();
        let record = PersistedRecord::decode(&written);
        assert_eq!(record.magic, CONFIG_MAGIC);
        assert_eq!(record.version, 2);
        assert_eq!(record.config, config);
    }

    #[test]
    fn valid_record_wins_on_every_load() {
        let region = region_with(PersistedRecord::new(stored_config(), 2));
        let mut store = ConfigStore::new(region, options(2));

        for _ in 0..3 {
            let mut config = DeviceConfig::default();
            assert_eq!(store.load(&mut config).unwrap(), LoadOutcome::Restored);
            assert_eq!(config, stored_config());
        }

        assert_eq!(store.storage().commit_count(), 0);
        assert_eq!(store.storage().begin_count(), 1);
    }

    #[test]
    fn version_bump_reseeds_and_next_boot_restores() {
        let region = region_with(PersistedRecord::new(stored_config(), 1));
        let mut store = ConfigStore::new(region, options(2));
        let mut config = DeviceConfig::default();

        assert_eq!(store.load(&mut config).unwrap(), LoadOutcome::Seeded);
        assert_eq!(config, DeviceConfig::from_defaults(&options(2)));

        // Next boot: a fresh store over the same durable bytes.
        let mut rebooted = ConfigStore::new(store.into_storage(), options(2));
        let mut reloaded = DeviceConfig::default();
        assert_eq!(rebooted.load(&mut reloaded).unwrap(), LoadOutcome::Restored);
        assert_eq!(reloaded, config);
    }

    #[test]
    fn wrong_magic_is_treated_as_absent() {
        let mut record = PersistedRecord::new(stored_config(), 2);
        record.magic = 0xDEAD_BEEF;
        let mut store = ConfigStore::new(region_with(record), options(2));
        let mut config = DeviceConfig::default();

        assert_eq!(store.load(&mut config).unwrap(), LoadOutcome::Seeded);
        assert_eq!(config.get(ConfigField::DeviceId), "factory-device");
    }

    #[test]
    fn short_durable_copy_reads_as_erased_tail() {
        let encoded = PersistedRecord::new(stored_config(), 2).encode();
        let mut store = ConfigStore::new(MemoryRegion::with_contents(&encoded[..4]), options(2));
        let mut config = DeviceConfig::default();

        assert_eq!(store.load(&mut config).unwrap(), LoadOutcome::Seeded);
    }

    #[test]
    fn save_overwrites_record() {
        let mut store = ConfigStore::new(MemoryRegion::erased(), options(2));
        let mut config = DeviceConfig::default();
        store.load(&mut config).unwrap();

        config.set(ConfigField::Latitude, Some("-22.9068"));
        store.save(&config).unwrap();

        let mut rebooted = ConfigStore::new(store.into_storage(), options(2));
        let mut reloaded = DeviceConfig::default();
        rebooted.load(&mut reloaded).unwrap();
        assert_eq!(reloaded.get(ConfigField::Latitude), "-22.9068");
    }

    #[test]
    fn disabled_persistence_never_touches_storage() {
        let mut disabled = options(2);
        disabled.http_config_server = false;
        let mut store = ConfigStore::new(MemoryRegion::erased(), disabled);
        let mut config = DeviceConfig::default();

        assert_eq!(store.load(&mut config).unwrap(), LoadOutcome::Defaults);
        store.save(&config).unwrap();

        assert_eq!(store.persistence(), Persistence::Disabled);
        assert_eq!(store.storage().begin_count(), 0);
        assert_eq!(store.storage().commit_count(), 0);
    }

    #[test]
    fn failed_seed_still_leaves_defaults() {
        let mut region = MemoryRegion::erased();
        region.set_fail_commits(true);
        let mut store = ConfigStore::new(region, options(2));
        let mut config = DeviceConfig::default();

        assert!(store.load(&mut config).is_err());
        assert_eq!(config, DeviceConfig::from_defaults(&options(2)));
    }
}
