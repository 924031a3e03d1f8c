//! The multipart form posted to the activation server

use reqwest::multipart::Form;
use tracing::debug;

use crate::{
    IdeviceError,
    activation_info::ActivationInfo,
    cache::{CacheStore, entry},
    identity::DeviceIdentity,
};

pub const ACTIVATION_URL: &str =
    "https://albert.apple.com/WebObjects/ALUnbrick.woa/wa/deviceActivation";
pub const USER_AGENT: &str = "iTunes/9.1 (Macintosh; U; Intel Mac OS X 10.5.6)";
pub const HEADERS: &[(&str, &str)] = &[
    ("X-Apple-Tz", "-14400"),
    ("X-Apple-Store-Front", "143441-1"),
];

/// Form fields of one activation request, in the order they're sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRequest {
    fields: Vec<(&'static str, String)>,
}

impl ActivationRequest {
    /// Assembles the form from a resolved identity and ActivationInfo
    ///
    /// Identifiers are only added when they have a value. In backup mode every
    /// value is also written to the cache, with an empty entry standing in for
    /// missing ones, alongside the device's UUID.
    pub async fn build(
        identity: &DeviceIdentity,
        info: &ActivationInfo,
        cache: &CacheStore,
    ) -> Result<Self, IdeviceError> {
        let mut fields = vec![
            ("machineName", "linux".to_string()),
            ("InStoreActivation", "false".to_string()),
        ];

        let identifiers = [
            ("IMEI", entry::IMEI, &identity.imei),
            ("IMSI", entry::IMSI, &identity.imsi),
            ("ICCID", entry::ICCID, &identity.iccid),
            (
                "AppleSerialNumber",
                entry::SERIAL_NUMBER,
                &identity.serial_number,
            ),
        ];
        for (field, name, value) in identifiers {
            match value {
                Some(v) => {
                    fields.push((field, v.clone()));
                    cache.put(name, v).await?;
                }
                None => {
                    debug!("No {field} for this device");
                    cache.put(name, "").await?;
                }
            }
        }

        fields.push(("activation-info", info.as_str().to_string()));
        cache.put(entry::ACTIVATION_INFO, info.as_str()).await?;
        cache.put(entry::UUID, &identity.uuid).await?;

        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[(&'static str, String)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &'static [(&'static str, &'static str)] {
        HEADERS
    }

    /// Encodes the fields as a multipart form
    pub fn to_form(&self) -> Form {
        self.fields
            .iter()
            .fold(Form::new(), |form, (k, v)| form.text(*k, v.clone()))
    }
}
