//! USB Multiplexing Daemon (usbmuxd) Client
//!
//! usbmuxd owns the USB link to attached devices. It lists them, hands out
//! the host's pairing records and tunnels TCP connections to device ports.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use plist_macro::{plist, pretty_print_dictionary};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{
    Idevice, IdeviceError, ReadWrite, pairing_file::PairingFile, provider::UsbmuxdProvider,
};

mod des;

const HEADER_LEN: u32 = 16;

/// How a device is attached to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device known to usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
}

/// Active connection to the usbmuxd service
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, IdeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, IdeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads the address from `USBMUXD_SOCKET_ADDRESS`, falling back to the default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => Self::parse(&var),
            Err(_) => Ok(Self::default()),
        }
    }

    /// `host:port` is a TCP address, anything else a socket path
    pub fn parse(s: &str) -> Result<Self, AddrParseError> {
        #[cfg(unix)]
        if !s.contains(':') {
            return Ok(Self::UnixSocket(s.to_string()));
        }
        Ok(Self::TcpSocket(SocketAddr::from_str(s)?))
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

impl UsbmuxdConnection {
    pub const XML_PLIST_VERSION: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Lists every device usbmuxd knows about
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        let req = plist!(dict {
            "MessageType": "ListDevices",
            "ClientVersionString": "idevice-activate",
            "kLibUSBMuxVersion": 3,
        });
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res: des::ListDevicesResponse = plist::from_value(&plist::Value::Dictionary(res))?;

        Ok(res
            .device_list
            .into_iter()
            .flat_map(|x| x.into_usbmuxd_dev())
            .collect())
    }

    /// Finds a device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, IdeviceError> {
        let devices = self.get_devices().await?;
        devices
            .into_iter()
            .find(|x| x.udid == udid)
            .ok_or(IdeviceError::DeviceNotFound)
    }

    /// Reads the host's pairing record for a device
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, IdeviceError> {
        debug!("Getting pair record for {udid}");
        let req = plist!(dict {
            "MessageType": "ReadPairRecord",
            "PairRecordID": udid,
        });
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Opens a tunnel to a port on the device
    ///
    /// On success the muxer connection itself becomes the tunnel.
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Idevice, IdeviceError> {
        debug!("Connecting to device {device_id} on port {port}");
        let port = port.to_be() as u32;
        let req = plist!(dict {
            "MessageType": "Connect",
            "DeviceID": device_id,
            "PortNumber": port,
        });
        self.write_plist(req).await?;
        match self
            .read_plist()
            .await?
            .get("Number")
            .and_then(|n| n.as_unsigned_integer())
        {
            Some(0) => Ok(Idevice::new(self.socket, label)),
            Some(1) => Err(IdeviceError::UsbBadCommand),
            Some(2) => Err(IdeviceError::UsbBadDevice),
            Some(3) => Err(IdeviceError::UsbConnectionRefused),
            Some(6) => Err(IdeviceError::UsbBadVersion),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), IdeviceError> {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &req)?;

        let mut packet = Vec::with_capacity(HEADER_LEN as usize + body.len());
        packet.extend_from_slice(&(body.len() as u32 + HEADER_LEN).to_le_bytes());
        packet.extend_from_slice(&Self::XML_PLIST_VERSION.to_le_bytes());
        packet.extend_from_slice(&Self::PLIST_MESSAGE_TYPE.to_le_bytes());
        packet.extend_from_slice(&self.tag.to_le_bytes());
        packet.extend_from_slice(&body);

        self.socket.write_all(&packet).await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let mut header = [0; HEADER_LEN as usize];
        self.socket.read_exact(&mut header).await?;

        let packet_size = u32::from_le_bytes([header[0], header[1], header[2], header[3]])
            .checked_sub(HEADER_LEN)
            .ok_or(IdeviceError::UnexpectedResponse)?;
        debug!("Reading {packet_size} bytes from muxer");

        let mut body = vec![0; packet_size as usize];
        self.socket.read_exact(&mut body).await?;

        let res = plist::from_bytes(&body)?;
        debug!("Read from muxer: {}", pretty_print_dictionary(&res));
        Ok(res)
    }
}

impl UsbmuxdDevice {
    /// Creates a provider that reaches this device through usbmuxd
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    async fn read_packet(
        socket: &mut tokio::io::DuplexStream,
    ) -> (u32, u32, u32, plist::Dictionary) {
        let mut header = [0u8; 16];
        socket.read_exact(&mut header).await.unwrap();
        let word = |i: usize| u32::from_le_bytes(header[i..i + 4].try_into().unwrap());
        let mut body = vec![0; (word(0) - 16) as usize];
        socket.read_exact(&mut body).await.unwrap();
        (word(4), word(8), word(12), plist::from_bytes(&body).unwrap())
    }

    async fn write_packet(socket: &mut tokio::io::DuplexStream, body: plist::Dictionary) {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &body).unwrap();
        let mut packet = Vec::new();
        packet.extend_from_slice(&(buf.len() as u32 + 16).to_le_bytes());
        packet.extend_from_slice(&1u32.to_le_bytes());
        packet.extend_from_slice(&8u32.to_le_bytes());
        packet.extend_from_slice(&7u32.to_le_bytes());
        packet.extend_from_slice(&buf);
        socket.write_all(&packet).await.unwrap();
    }

    fn usb_device(id: u32, udid: &str) -> plist::Value {
        plist!({
            "DeviceID": id,
            "MessageType": "Attached",
            "Properties": {
                "ConnectionType": "USB",
                "DeviceID": id,
                "SerialNumber": udid,
            }
        })
    }

    #[tokio::test]
    async fn lists_devices() {
        let (client, mut server) = duplex(4096);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 7);

        let muxer = tokio::spawn(async move {
            let (version, kind, tag, req) = read_packet(&mut server).await;
            assert_eq!((version, kind, tag), (1, 8, 7));
            assert_eq!(
                req.get("MessageType").and_then(|v| v.as_string()),
                Some("ListDevices")
            );
            write_packet(
                &mut server,
                plist!(dict {
                    "DeviceList": [usb_device(3, "00008030-001A"), usb_device(4, "other")]
                }),
            )
            .await;
        });

        let devices = conn.get_devices().await.unwrap();
        muxer.await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].udid, "00008030-001A");
        assert_eq!(devices[0].device_id, 3);
        assert_eq!(devices[0].connection_type, Connection::Usb);
    }

    #[tokio::test]
    async fn missing_device_is_not_found() {
        let (client, mut server) = duplex(4096);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 0);

        tokio::spawn(async move {
            read_packet(&mut server).await;
            write_packet(&mut server, plist!(dict { "DeviceList": [] })).await;
        });

        assert!(matches!(
            conn.get_device("00008030-001A").await,
            Err(IdeviceError::DeviceNotFound)
        ));
    }

    #[tokio::test]
    async fn connect_sends_port_in_network_order() {
        let (client, mut server) = duplex(4096);
        let conn = UsbmuxdConnection::new(Box::new(client), 0);

        let muxer = tokio::spawn(async move {
            let (_, _, _, req) = read_packet(&mut server).await;
            write_packet(&mut server, plist!(dict { "Number": 3 })).await;
            req
        });

        assert!(matches!(
            conn.connect_to_device(3, 62078, "test").await,
            Err(IdeviceError::UsbConnectionRefused)
        ));
        let req = muxer.await.unwrap();
        assert_eq!(
            req.get("PortNumber").and_then(|v| v.as_unsigned_integer()),
            Some(62078u16.to_be() as u64)
        );
    }

    #[test]
    fn address_parsing() {
        assert_eq!(
            UsbmuxdAddr::parse("127.0.0.1:27015").unwrap(),
            UsbmuxdAddr::TcpSocket("127.0.0.1:27015".parse().unwrap())
        );
        #[cfg(unix)]
        assert_eq!(
            UsbmuxdAddr::parse("/tmp/usbmuxd").unwrap(),
            UsbmuxdAddr::UnixSocket("/tmp/usbmuxd".into())
        );
    }
}
