//! Activation of iOS devices against Apple's activation servers.
//!
//! The engine lives in [`activator::Activator`]: it resolves the device
//! identifiers, builds the activation request, posts it, pulls the activation
//! record out of the response and hands it back to the device. The device is
//! reached through the [`device::DeviceChannel`] trait, implemented here by
//! [`lockdown::LockdownClient`] over usbmuxd or TCP.
// Jackson Coxson

pub mod activation_info;
pub mod activator;
pub mod cache;
pub mod device;
pub mod identity;
pub mod lockdown;
pub mod pairing_file;
pub mod provider;
pub mod request;
pub mod ticket;
mod tls;
pub mod transport;
pub mod usbmuxd;
mod util;

pub use activator::Activator;
pub use util::decode_plist;

use plist_macro::pretty_print_plist;
use rustls::{crypto::CryptoProvider, pki_types::ServerName};
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

#[cfg(not(any(feature = "aws-lc", feature = "ring")))]
compile_error!("either the `aws-lc` or the `ring` feature must be enabled");

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream and UnixStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Main handle for a plist-framed connection to a device service
///
/// Owns the socket; dropping the handle closes the connection.
pub struct Idevice {
    /// The underlying connection socket, boxed for dynamic dispatch
    socket: Option<Box<dyn ReadWrite>>,
    /// Label sent with every lockdown request
    label: String,
}

impl Idevice {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Identifier for this client, shown in the device's logs
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sends a length-prefixed XML plist to the device
    async fn send_plist(&mut self, message: plist::Value) -> Result<(), IdeviceError> {
        let Some(socket) = &mut self.socket else {
            return Err(IdeviceError::NoEstablishedConnection);
        };
        debug!("Sending plist: {}", pretty_print_plist(&message));

        let mut buf = Vec::new();
        message.to_writer_xml(&mut buf)?;
        let len = buf.len() as u32;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads a length-prefixed plist from the device
    ///
    /// A response carrying an `Error` key is turned into the matching
    /// [`IdeviceError`].
    async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let Some(socket) = &mut self.socket else {
            return Err(IdeviceError::NoEstablishedConnection);
        };

        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        let res: plist::Dictionary = plist::from_bytes(&buf)?;
        debug!(
            "Received plist: {}",
            pretty_print_plist(&plist::Value::Dictionary(res.clone()))
        );

        if let Some(e) = res.get("Error") {
            let e: String = plist::from_value(e)?;
            return Err(IdeviceError::from_device_error_type(&e, &res)
                .unwrap_or(IdeviceError::UnknownErrorType(e)));
        }
        Ok(res)
    }

    /// Upgrades the connection to TLS using the host's pairing credentials
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), IdeviceError> {
        if CryptoProvider::get_default().is_none() {
            #[cfg(feature = "aws-lc")]
            let provider = rustls::crypto::aws_lc_rs::default_provider();
            #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
            let provider = rustls::crypto::ring::default_provider();

            // A second install races with whoever won; log and move on.
            if let Err(e) = CryptoProvider::install_default(provider) {
                warn!("Failed to set crypto provider: {e:?}");
            }
        }
        let config = tls::create_client_config(pairing_file)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let socket = self
            .socket
            .take()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        let server_name = ServerName::try_from("Device")
            .map_err(|e| IdeviceError::InternalError(e.to_string()))?;
        let socket = connector.connect(server_name, socket).await?;

        self.socket = Some(Box::new(socket));
        Ok(())
    }
}

/// Every failure the activation flow can run into
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum IdeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error) = -2,
    #[error("TLS error")]
    Rustls(#[from] rustls::Error) = -3,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -5,
    #[error("unexpected response from device")]
    UnexpectedResponse = -7,
    #[error("this request was prohibited")]
    GetProhibited = -8,
    #[error("no SSL session is active")]
    SessionInactive = -9,
    #[error("device does not have pairing file")]
    InvalidHostID = -10,
    #[error("no established connection")]
    NoEstablishedConnection = -11,
    #[error("the device has no value for the requested key")]
    MissingValue = -12,
    #[error("device not found")]
    DeviceNotFound = -20,
    #[error("device locked")]
    DeviceLocked = -21,
    #[error("device refused connection")]
    UsbConnectionRefused = -22,
    #[error("bad command")]
    UsbBadCommand = -23,
    #[error("bad device")]
    UsbBadDevice = -24,
    #[error("usb bad version")]
    UsbBadVersion = -25,
    #[error("internal error: {0}")]
    InternalError(String) = -39,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String) = -59,

    #[error("unable to get {key} from lockdownd: {reason}")]
    PropertyUnavailable { key: String, reason: String } = -100,
    #[error("{key} is not a {expected}")]
    WrongNodeType {
        key: &'static str,
        expected: &'static str,
    } = -101,
    #[error("unable to locate {0}")]
    Extraction(&'static str) = -102,
    #[error("activation request failed")]
    Transport(#[from] reqwest::Error) = -103,
    #[error("malformed activation response: {0}")]
    MalformedResponse(String) = -104,
    #[error("unable to find {0} node")]
    Navigation(&'static str) = -105,
    #[error(
        "cache belongs to device {cached}, but device {live} is attached; use the cache made for this device"
    )]
    CacheMismatch { cached: String, live: String } = -106,
    #[error("cache is not active for this operation")]
    CacheInactive = -107,
    #[error("cache entry {name} is {size} bytes, over the {max} byte limit", max = cache::MAX_ENTRY_SIZE)]
    CacheEntryTooLarge { name: String, size: u64 } = -108,
    #[error("cache entry {name} failed")]
    CacheIo {
        name: String,
        #[source]
        source: io::Error,
    } = -109,
    #[error("cache cannot back up and replay in the same run")]
    InvalidCacheConfig = -110,
    #[error("device refused the activation record")]
    ActivationFailed = -111,
    #[error("unable to read activation record file")]
    RecordIo(#[source] io::Error) = -112,
}

impl IdeviceError {
    /// Converts a device-reported error string to a typed error
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "MissingValue" => Some(Self::MissingValue),
            "InvalidActivationRecord" | "ActivationFailed" => Some(Self::ActivationFailed),
            "InternalError" => Some(Self::InternalError(
                context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string(),
            )),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            IdeviceError::Socket(_) => -1,
            IdeviceError::PemParseFailed(_) => -2,
            IdeviceError::Rustls(_) => -3,
            IdeviceError::Plist(_) => -5,
            IdeviceError::UnexpectedResponse => -7,
            IdeviceError::GetProhibited => -8,
            IdeviceError::SessionInactive => -9,
            IdeviceError::InvalidHostID => -10,
            IdeviceError::NoEstablishedConnection => -11,
            IdeviceError::MissingValue => -12,
            IdeviceError::DeviceNotFound => -20,
            IdeviceError::DeviceLocked => -21,
            IdeviceError::UsbConnectionRefused => -22,
            IdeviceError::UsbBadCommand => -23,
            IdeviceError::UsbBadDevice => -24,
            IdeviceError::UsbBadVersion => -25,
            IdeviceError::InternalError(_) => -39,
            IdeviceError::UnknownErrorType(_) => -59,

            IdeviceError::PropertyUnavailable { .. } => -100,
            IdeviceError::WrongNodeType { .. } => -101,
            IdeviceError::Extraction(_) => -102,
            IdeviceError::Transport(_) => -103,
            IdeviceError::MalformedResponse(_) => -104,
            IdeviceError::Navigation(_) => -105,
            IdeviceError::CacheMismatch { .. } => -106,
            IdeviceError::CacheInactive => -107,
            IdeviceError::CacheEntryTooLarge { .. } => -108,
            IdeviceError::CacheIo { .. } => -109,
            IdeviceError::InvalidCacheConfig => -110,
            IdeviceError::ActivationFailed => -111,
            IdeviceError::RecordIo(_) => -112,
        }
    }
}
