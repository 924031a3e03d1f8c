//! Resolution of the identifiers sent with an activation request
//!
//! Each overridable identifier comes from the first source that has it: a
//! user override, then the replay cache (in replay mode) or the device itself.

use tracing::{debug, warn};

use crate::{
    IdeviceError,
    cache::{CacheStore, entry},
    device::{self, DeviceChannel},
};

/// User supplied values that win over both the cache and the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub imei: Option<String>,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
    pub serial_number: Option<String>,
}

/// Everything about the attached device the activation server needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_class: String,
    pub uuid: String,
    pub imei: Option<String>,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceIdentity {
    /// Whether the device class carries a SIM
    pub fn is_sim_capable(&self) -> bool {
        self.device_class == device::SIM_CAPABLE_CLASS
    }
}

/// One overridable identifier: its device property and cache entry
struct Identifier {
    property: &'static str,
    entry: &'static str,
}

const IMEI: Identifier = Identifier {
    property: device::IMEI,
    entry: entry::IMEI,
};
const IMSI: Identifier = Identifier {
    property: device::IMSI,
    entry: entry::IMSI,
};
const ICCID: Identifier = Identifier {
    property: device::ICCID,
    entry: entry::ICCID,
};
const SERIAL_NUMBER: Identifier = Identifier {
    property: device::SERIAL_NUMBER,
    entry: entry::SERIAL_NUMBER,
};

pub struct IdentityResolver<'a> {
    cache: &'a CacheStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(cache: &'a CacheStore) -> Self {
        Self { cache }
    }

    /// Resolves the full identity of the attached device
    ///
    /// `DeviceClass` and `UniqueDeviceID` always come from the device. The SIM
    /// identifiers are only looked for on SIM-capable classes; the serial
    /// number always is.
    ///
    /// # Errors
    /// [`IdeviceError::PropertyUnavailable`] if the device is asked for a value
    /// and doesn't return a string. Cache misses are never errors.
    pub async fn resolve<D: DeviceChannel>(
        &self,
        device: &mut D,
        overrides: &Overrides,
    ) -> Result<DeviceIdentity, IdeviceError> {
        let device_class = device::get_string(device, device::DEVICE_CLASS).await?;
        let uuid = device::get_string(device, device::UNIQUE_DEVICE_ID).await?;
        debug!("Resolving identifiers for {device_class} {uuid}");

        let mut identity = DeviceIdentity {
            device_class,
            uuid,
            ..Default::default()
        };

        if identity.is_sim_capable() {
            identity.iccid = self
                .resolve_one(device, &ICCID, overrides.iccid.as_deref())
                .await?;
            identity.imei = self
                .resolve_one(device, &IMEI, overrides.imei.as_deref())
                .await?;
            identity.imsi = self
                .resolve_one(device, &IMSI, overrides.imsi.as_deref())
                .await?;
        }
        identity.serial_number = self
            .resolve_one(device, &SERIAL_NUMBER, overrides.serial_number.as_deref())
            .await?;

        Ok(identity)
    }

    async fn resolve_one<D: DeviceChannel>(
        &self,
        device: &mut D,
        id: &Identifier,
        user: Option<&str>,
    ) -> Result<Option<String>, IdeviceError> {
        if let Some(v) = user {
            debug!("Using user supplied {}", id.entry);
            return Ok(non_empty(v.to_string()));
        }

        if self.cache.is_replaying() {
            // read failures degrade to an absent value
            return match self.cache.get_string(id.entry).await {
                Ok(v) => Ok(non_empty(v)),
                Err(e) => {
                    warn!("No cached {}, sending none: {e}", id.entry);
                    Ok(None)
                }
            };
        }

        device::get_string(device, id.property).await.map(non_empty)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}
