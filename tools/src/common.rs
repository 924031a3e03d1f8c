// Jackson Coxson
// Device selection for the tools

use std::{net::IpAddr, str::FromStr};

use idevice_activate::{
    pairing_file::PairingFile,
    provider::{IdeviceProvider, TcpProvider},
    usbmuxd::{Connection, UsbmuxdAddr, UsbmuxdDevice},
};

/// Picks the device to talk to
///
/// A UDID selects that device through usbmuxd. A host and a pairing file
/// select a device over the network. Otherwise the first USB device usbmuxd
/// knows about is used, falling back to the first network one.
pub async fn get_provider(
    udid: Option<&String>,
    host: Option<&String>,
    pairing_file: Option<&String>,
    label: &str,
) -> Result<Box<dyn IdeviceProvider>, String> {
    if let (None, Some(host), Some(pairing_file)) = (udid, host, pairing_file) {
        let addr = IpAddr::from_str(host).map_err(|e| format!("Invalid host: {e:?}"))?;
        let pairing_file = PairingFile::read_from_file(pairing_file)
            .await
            .map_err(|e| format!("Unable to read pairing file: {e}"))?;

        return Ok(Box::new(TcpProvider {
            addr,
            pairing_file,
            label: label.to_string(),
        }));
    }

    let addr = UsbmuxdAddr::from_env_var()
        .map_err(|e| format!("Bad {}: {e}", UsbmuxdAddr::ENV_VAR))?;
    let mut usbmuxd = addr
        .connect(1)
        .await
        .map_err(|e| format!("Unable to connect to usbmuxd: {e}"))?;

    let dev = match udid {
        Some(udid) => usbmuxd
            .get_device(udid)
            .await
            .map_err(|e| format!("Device not found: {e}"))?,
        None => {
            let devs = usbmuxd
                .get_devices()
                .await
                .map_err(|e| format!("Unable to get devices from usbmuxd: {e}"))?;
            choose_device(devs).ok_or("No device found!")?
        }
    };
    Ok(Box::new(dev.to_provider(addr, label)))
}

fn choose_device(devs: Vec<UsbmuxdDevice>) -> Option<UsbmuxdDevice> {
    let usb = devs
        .iter()
        .position(|d| d.connection_type == Connection::Usb)
        .unwrap_or(0);
    devs.into_iter().nth(usb)
}
