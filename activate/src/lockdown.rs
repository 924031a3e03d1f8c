//! Lockdown Service Client
//!
//! lockdownd is the device's control service. Activation reads identity
//! properties from it and hands it the activation record.

use plist_macro::plist;
use tracing::{debug, info};

use crate::{
    Idevice, IdeviceError, device::DeviceChannel, pairing_file::PairingFile,
    provider::IdeviceProvider,
};

/// Client for the lockdown service
pub struct LockdownClient {
    pub idevice: Idevice,
}

impl LockdownClient {
    /// The TCP port lockdownd listens on
    pub const LOCKDOWND_PORT: u16 = 62078;

    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Connects to lockdownd through a provider
    pub async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let idevice = provider.connect(Self::LOCKDOWND_PORT).await?;
        Ok(Self::new(idevice))
    }

    /// Starts a TLS session using the host's pairing record
    ///
    /// # Errors
    /// [`IdeviceError::InvalidHostID`] if the device doesn't know the host,
    /// [`IdeviceError::UnexpectedResponse`] if the device declines SSL
    pub async fn start_session(&mut self, pairing_file: &PairingFile) -> Result<(), IdeviceError> {
        let request = plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "StartSession",
            "HostID": pairing_file.host_id.clone(),
            "SystemBUID": pairing_file.system_buid.clone(),
        });
        self.idevice.send_plist(request).await?;

        let response = self.idevice.read_plist().await?;
        match response.get("EnableSessionSSL") {
            Some(plist::Value::Boolean(true)) => {}
            _ => return Err(IdeviceError::UnexpectedResponse),
        }

        self.idevice.start_session(pairing_file).await?;
        debug!("Lockdown session started");
        Ok(())
    }

    /// Reads a value from the device's global domain
    ///
    /// # Returns
    /// `None` if lockdownd answers with `MissingValue`
    pub async fn get_value(&mut self, key: &str) -> Result<Option<plist::Value>, IdeviceError> {
        let request = plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "GetValue",
            "Key": key,
        });
        self.idevice.send_plist(request).await?;

        match self.idevice.read_plist().await {
            Ok(mut res) => Ok(res.remove("Value")),
            Err(IdeviceError::MissingValue) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Hands an activation record to the device
    pub async fn activate(&mut self, record: plist::Value) -> Result<(), IdeviceError> {
        let request = plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "Activate",
            "ActivationRecord": record,
        });
        self.idevice.send_plist(request).await?;
        self.idevice.read_plist().await?;
        info!("Device accepted the activation record");
        Ok(())
    }

    /// Reverts the device to the unactivated state
    pub async fn deactivate(&mut self) -> Result<(), IdeviceError> {
        let request = plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "Deactivate",
        });
        self.idevice.send_plist(request).await?;
        self.idevice.read_plist().await?;
        info!("Device deactivated");
        Ok(())
    }
}

impl From<Idevice> for LockdownClient {
    fn from(value: Idevice) -> Self {
        Self::new(value)
    }
}

impl DeviceChannel for LockdownClient {
    async fn get_value(&mut self, key: &str) -> Result<Option<plist::Value>, IdeviceError> {
        LockdownClient::get_value(self, key).await
    }

    async fn activate(&mut self, record: plist::Value) -> Result<(), IdeviceError> {
        LockdownClient::activate(self, record).await
    }

    async fn deactivate(&mut self) -> Result<(), IdeviceError> {
        LockdownClient::deactivate(self).await
    }
}
