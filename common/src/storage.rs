//! Flat, fixed-size byte region with explicit commit, the shape of an
//! EEPROM emulation layer on top of flash.

use thiserror::Error;

/// Value of erased flash cells.
pub const ERASED_BYTE: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage region accessed before begin")]
    NotStarted,
    #[error("access of {len} bytes at offset {offset} exceeds region of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub trait ByteStorage {
    /// Sizes the region and loads its durable content. Calling it again
    /// reloads the region and drops uncommitted writes.
    fn begin(&mut self, size: usize) -> Result<(), StorageError>;

    fn get(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Stages `bytes` at `offset`; nothing is durable until `commit`.
    fn put(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;
}

/// RAM shadow of a region with bounds checking, shared by the concrete
/// backends.
#[derive(Debug, Clone, Default)]
pub struct RegionBuffer {
    bytes: Vec<u8>,
    started: bool,
}

impl RegionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the shadow to `size` erased bytes, then lets `load` fill it
    /// from the durable copy.
    pub fn begin<F>(&mut self, size: usize, load: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut [u8]) -> Result<(), StorageError>,
    {
        self.started = false;
        self.bytes.clear();
        self.bytes.resize(size, ERASED_BYTE);
        load(&mut self.bytes)?;
        self.started = true;
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn bytes(&self) -> Result<&[u8], StorageError> {
        if !self.started {
            return Err(StorageError::NotStarted);
        }
        Ok(&self.bytes)
    }

    pub fn get(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    pub fn put(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StorageError> {
        let range = self.range(offset, bytes.len())?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>, StorageError> {
        if !self.started {
            return Err(StorageError::NotStarted);
        }

        let size = self.bytes.len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset..end),
            _ => Err(StorageError::OutOfBounds { offset, len, size }),
        }
    }
}

/// Volatile storage used on hosts without a backing file and in tests.
/// The committed copy survives `begin`, like flash survives a reboot.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegion {
    shadow: RegionBuffer,
    committed: Vec<u8>,
    begin_count: usize,
    commit_count: usize,
    fail_commits: bool,
}

impl MemoryRegion {
    /// Region whose cells are all erased.
    pub fn erased() -> Self {
        Self::default()
    }

    /// Region whose durable content starts as `bytes`.
    pub fn with_contents(bytes: &[u8]) -> Self {
        Self {
            committed: bytes.to_vec(),
            ..Self::default()
        }
    }

    pub fn committed(&self) -> &[u8] {
        &self.committed
    }

    pub fn begin_count(&self) -> usize {
        self.begin_count
    }

    pub fn commit_count(&self) -> usize {
        self.commit_count
    }

    /// Makes every following commit fail with a backend error.
    pub fn set_fail_commits(&mut self, fail: bool) {
        self.fail_commits = fail;
    }
}

impl ByteStorage for MemoryRegion {
    fn begin(&mut self, size: usize) -> Result<(), StorageError> {
        let committed = &self.committed;
        self.shadow.begin(size, |bytes| {
            let len = committed.len().min(bytes.len());
            bytes[..len].copy_from_slice(&committed[..len]);
            Ok(())
        })?;
        self.begin_count += 1;
        Ok(())
    }

    fn get(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        self.shadow.get(offset, buf)
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StorageError> {
        self.shadow.put(offset, bytes)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.fail_commits {
            return Err(StorageError::Backend("simulated commit failure".to_string()));
        }
        self.committed = self.shadow.bytes()?.to_vec();
        self.commit_count += 1;
        Ok(())
    }
}
