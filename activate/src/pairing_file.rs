//! Host pairing records
//!
//! A pairing record holds the host certificate and key a device trusts, plus
//! the identifiers lockdown expects when a session is started. Records come
//! from usbmuxd or from a plist file on disk.

use std::path::Path;

use plist::Data;
use rustls::pki_types::{CertificateDer, pem::PemObject};
use serde::Deserialize;
use tracing::warn;

use crate::IdeviceError;

/// The parts of a pairing record needed to start a lockdown session
#[derive(Clone, Debug)]
pub struct PairingFile {
    /// Host's certificate in DER format
    pub host_certificate: CertificateDer<'static>,
    /// Host's private key, PEM encoded
    pub host_private_key: Vec<u8>,
    pub host_id: String,
    /// System Build Unique Identifier
    pub system_buid: String,
    pub udid: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    host_certificate: Data,
    host_private_key: Data,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "UDID")]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pairing record from disk
    pub async fn read_from_file(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let f = tokio::fs::read(path).await?;
        Self::from_bytes(&f)
    }

    /// Parses a pairing record in XML or binary plist form
    ///
    /// # Errors
    /// [`IdeviceError::UnexpectedResponse`] if a required key is missing or
    /// the host certificate isn't valid PEM
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeviceError> {
        let r = match plist::from_bytes::<RawPairingFile>(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to convert bytes to raw pairing file: {e:?}");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        r.try_into().map_err(|e| {
            warn!("Unable to convert raw pairing file into pairing file: {e:?}");
            IdeviceError::UnexpectedResponse
        })
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = rustls::pki_types::pem::Error;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        let host_certificate: Vec<u8> = value.host_certificate.into();
        Ok(Self {
            host_certificate: CertificateDer::from_pem_slice(&host_certificate)?,
            host_private_key: value.host_private_key.into(),
            host_id: value.host_id,
            system_buid: value.system_buid,
            udid: value.udid,
        })
    }
}
