//! On-disk cache of activation identifiers
//!
//! A cache directory holds one flat file per entry. A run either backs the
//! identifiers of a working activation up into it, or replays them from it so a
//! device can be activated again without the SIM that was present the first
//! time. Never both.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{
    IdeviceError,
    device::{self, DeviceChannel},
};

/// Largest entry the cache will write or read, in bytes
///
/// Entries above this are rejected instead of truncated.
pub const MAX_ENTRY_SIZE: u64 = 0x200000;

/// Entry names, one file each
pub mod entry {
    pub const IMEI: &str = "IMEI";
    pub const IMSI: &str = "IMSI";
    pub const ICCID: &str = "ICCID";
    pub const SERIAL_NUMBER: &str = "SerialNumber";
    pub const ACTIVATION_INFO: &str = "ActivationInfo";
    pub const UUID: &str = "UUID";
}

/// Where the cache lives and what a run may do with it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub write_enabled: bool,
    pub replay_enabled: bool,
}

impl CacheConfig {
    /// No cache reads or writes
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Store every identifier sent to the activation server under `dir`
    pub fn backup(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: dir.into(),
            write_enabled: true,
            replay_enabled: false,
        }
    }

    /// Use the identifiers stored under `dir` instead of asking the device
    pub fn replay(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: dir.into(),
            write_enabled: false,
            replay_enabled: true,
        }
    }
}

/// Outcome of [`CacheStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Written,
    /// Backup mode is off; nothing was touched
    Inactive,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    config: CacheConfig,
}

impl CacheStore {
    /// Creates a store, rejecting configs that both write and replay
    pub fn new(config: CacheConfig) -> Result<Self, IdeviceError> {
        if config.write_enabled && config.replay_enabled {
            return Err(IdeviceError::InvalidCacheConfig);
        }
        Ok(Self { config })
    }

    pub fn disabled() -> Self {
        Self {
            config: CacheConfig::disabled(),
        }
    }

    pub fn is_replaying(&self) -> bool {
        self.config.replay_enabled
    }

    pub fn is_writing(&self) -> bool {
        self.config.write_enabled
    }

    pub fn dir(&self) -> &Path {
        &self.config.cache_dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.config.cache_dir.join(name)
    }

    /// Overwrites entry `name` with `bytes`
    ///
    /// # Returns
    /// [`CacheStatus::Inactive`] without touching the filesystem unless backup
    /// mode is on
    ///
    /// # Errors
    /// [`IdeviceError::CacheEntryTooLarge`] above [`MAX_ENTRY_SIZE`],
    /// [`IdeviceError::CacheIo`] if the file can't be written
    pub async fn put(
        &self,
        name: &str,
        bytes: impl AsRef<[u8]>,
    ) -> Result<CacheStatus, IdeviceError> {
        if !self.config.write_enabled {
            return Ok(CacheStatus::Inactive);
        }
        let bytes = bytes.as_ref();
        check_size(name, bytes.len() as u64)?;

        tokio::fs::create_dir_all(&self.config.cache_dir)
            .await
            .map_err(|e| io_error(name, e))?;
        let path = self.path(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_error(name, e))?;
        debug!("Cached {} bytes to {}", bytes.len(), path.display());
        Ok(CacheStatus::Written)
    }

    /// Stores a plist document as XML text
    pub async fn put_plist(
        &self,
        name: &str,
        value: &plist::Value,
    ) -> Result<CacheStatus, IdeviceError> {
        if !self.config.write_enabled {
            return Ok(CacheStatus::Inactive);
        }
        let mut buf = Vec::new();
        value.to_writer_xml(&mut buf)?;
        self.put(name, buf).await
    }

    /// Reads the whole of entry `name`
    ///
    /// # Errors
    /// [`IdeviceError::CacheInactive`] unless replay mode is on,
    /// [`IdeviceError::CacheEntryTooLarge`] above [`MAX_ENTRY_SIZE`],
    /// [`IdeviceError::CacheIo`] if the file can't be read
    pub async fn get(&self, name: &str) -> Result<Vec<u8>, IdeviceError> {
        if !self.config.replay_enabled {
            return Err(IdeviceError::CacheInactive);
        }
        let path = self.path(name);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(name, e))?;
        check_size(name, meta.len())?;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(name, e))?;
        info!("Read {} from cache", path.display());
        Ok(bytes)
    }

    /// Reads entry `name` as text
    pub async fn get_string(&self, name: &str) -> Result<String, IdeviceError> {
        let bytes = self.get(name).await?;
        String::from_utf8(bytes).map_err(|e| {
            io_error(
                name,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }
}

fn check_size(name: &str, size: u64) -> Result<(), IdeviceError> {
    if size > MAX_ENTRY_SIZE {
        return Err(IdeviceError::CacheEntryTooLarge {
            name: name.to_string(),
            size,
        });
    }
    Ok(())
}

fn io_error(name: &str, source: std::io::Error) -> IdeviceError {
    IdeviceError::CacheIo {
        name: name.to_string(),
        source,
    }
}

/// Makes sure a replay cache was made for the attached device
///
/// Compares the cached `UUID` entry with the device's `UniqueDeviceID`, byte
/// for byte. Does nothing outside replay mode.
pub async fn check_device<D: DeviceChannel>(
    cache: &CacheStore,
    device: &mut D,
) -> Result<(), IdeviceError> {
    if !cache.is_replaying() {
        return Ok(());
    }
    let cached = cache.get_string(entry::UUID).await?;
    let live = device::get_string(device, device::UNIQUE_DEVICE_ID).await?;
    if cached != live {
        return Err(IdeviceError::CacheMismatch { cached, live });
    }
    debug!("Cache at {} matches device {live}", cache.dir().display());
    Ok(())
}
