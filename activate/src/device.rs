//! The device side of an activation run
//!
//! The activation engine never talks to lockdownd directly; it only needs to
//! read a handful of properties and push or revoke an activation record.

use std::future::Future;

use crate::IdeviceError;

pub const DEVICE_CLASS: &str = "DeviceClass";
pub const UNIQUE_DEVICE_ID: &str = "UniqueDeviceID";
pub const ICCID: &str = "IntegratedCircuitCardIdentity";
pub const IMEI: &str = "InternationalMobileEquipmentIdentity";
pub const IMSI: &str = "InternationalMobileSubscriberIdentity";
pub const SERIAL_NUMBER: &str = "SerialNumber";
pub const ACTIVATION_INFO: &str = "ActivationInfo";

/// Device class that carries a SIM and needs IMEI/IMSI/ICCID to activate
pub const SIM_CAPABLE_CLASS: &str = "iPhone";

/// Control channel to a single attached device
pub trait DeviceChannel: Send {
    /// Reads a property by name
    ///
    /// # Returns
    /// `None` when the device has no value for `key`
    fn get_value(
        &mut self,
        key: &str,
    ) -> impl Future<Output = Result<Option<plist::Value>, IdeviceError>> + Send;

    /// Installs an activation record on the device
    fn activate(
        &mut self,
        record: plist::Value,
    ) -> impl Future<Output = Result<(), IdeviceError>> + Send;

    /// Reverts the device to the unactivated state
    fn deactivate(&mut self) -> impl Future<Output = Result<(), IdeviceError>> + Send;
}

/// Reads a property that must be a string
///
/// Absent values and values of another type are both reported as
/// [`IdeviceError::PropertyUnavailable`].
pub async fn get_string<D: DeviceChannel>(
    device: &mut D,
    key: &str,
) -> Result<String, IdeviceError> {
    match device.get_value(key).await? {
        Some(plist::Value::String(s)) => Ok(s),
        Some(_) => Err(IdeviceError::PropertyUnavailable {
            key: key.to_string(),
            reason: "value is not a string".to_string(),
        }),
        None => Err(IdeviceError::PropertyUnavailable {
            key: key.to_string(),
            reason: "no value returned".to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    };

    use super::*;

    /// In-memory device that records which properties were asked for
    pub(crate) struct MockDevice {
        pub values: HashMap<String, plist::Value>,
        pub queried: Vec<String>,
        pub applied: Option<plist::Value>,
        pub deactivated: bool,
        pub released: Arc<AtomicBool>,
    }

    impl MockDevice {
        pub fn with(values: &[(&str, plist::Value)]) -> Self {
            Self {
                values: values
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                queried: Vec::new(),
                applied: None,
                deactivated: false,
                released: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn iphone() -> Self {
            let mut info = plist::Dictionary::new();
            info.insert("k".into(), "v".into());
            Self::with(&[
                (DEVICE_CLASS, "iPhone".into()),
                (UNIQUE_DEVICE_ID, "00008030-001A".into()),
                (IMEI, "123456789012345".into()),
                (IMSI, "310150123456789".into()),
                (ICCID, "8901260123456789012".into()),
                (SERIAL_NUMBER, "C39ABCDE12345".into()),
                (ACTIVATION_INFO, plist::Value::Dictionary(info)),
            ])
        }

        pub fn was_queried(&self, key: &str) -> bool {
            self.queried.iter().any(|k| k == key)
        }
    }

    impl DeviceChannel for MockDevice {
        async fn get_value(&mut self, key: &str) -> Result<Option<plist::Value>, IdeviceError> {
            self.queried.push(key.to_string());
            Ok(self.values.get(key).cloned())
        }

        async fn activate(&mut self, record: plist::Value) -> Result<(), IdeviceError> {
            self.applied = Some(record);
            Ok(())
        }

        async fn deactivate(&mut self) -> Result<(), IdeviceError> {
            self.deactivated = true;
            Ok(())
        }
    }

    impl Drop for MockDevice {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }
}
