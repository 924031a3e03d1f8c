//! The device's ActivationInfo document, as sent to the activation server
//!
//! The server wants the inner `<dict>` of the document only, without the XML
//! prolog and `<plist>` wrapper.

use tracing::debug;

use crate::{
    IdeviceError,
    device::{self, DeviceChannel},
    util::find_bytes,
};

const DICT_OPEN: &[u8] = b"<dict>";
const DICT_CLOSE: &[u8] = b"</dict>";

/// Inner dictionary of the device's ActivationInfo, as XML text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationInfo {
    fragment: String,
}

impl ActivationInfo {
    /// Reads ActivationInfo from the device
    pub async fn fetch<D: DeviceChannel>(device: &mut D) -> Result<Self, IdeviceError> {
        match device.get_value(device::ACTIVATION_INFO).await? {
            Some(v) => Self::from_value(&v),
            None => Err(IdeviceError::PropertyUnavailable {
                key: device::ACTIVATION_INFO.to_string(),
                reason: "no value returned".to_string(),
            }),
        }
    }

    /// Builds the fragment from an ActivationInfo node
    ///
    /// # Errors
    /// [`IdeviceError::WrongNodeType`] if the node isn't a dictionary,
    /// [`IdeviceError::Extraction`] if the dictionary markers can't be found
    pub fn from_value(value: &plist::Value) -> Result<Self, IdeviceError> {
        if value.as_dictionary().is_none() {
            return Err(IdeviceError::WrongNodeType {
                key: device::ACTIVATION_INFO,
                expected: "dictionary",
            });
        }
        let mut xml = Vec::new();
        value.to_writer_xml(&mut xml)?;

        let fragment = dict_fragment(&xml)?;
        let fragment = String::from_utf8(fragment.to_vec())
            .map_err(|_| IdeviceError::Extraction("a UTF-8 ActivationInfo document"))?;
        debug!("ActivationInfo fragment is {} bytes", fragment.len());
        Ok(Self { fragment })
    }

    pub fn as_str(&self) -> &str {
        &self.fragment
    }

    pub fn into_string(self) -> String {
        self.fragment
    }
}

/// Slices the first `<dict>` element out of an XML plist, tags included
///
/// The closing tag is matched by nesting depth, so dictionaries inside the
/// first one don't end it early. Self-closing `<dict/>` elements don't count.
pub fn dict_fragment(xml: &[u8]) -> Result<&[u8], IdeviceError> {
    let start = find_bytes(xml, DICT_OPEN)
        .ok_or(IdeviceError::Extraction("beginning of ActivationInfo"))?;

    let mut depth = 0usize;
    let mut i = start;
    while i < xml.len() {
        let rest = &xml[i..];
        if rest.starts_with(DICT_OPEN) {
            depth += 1;
            i += DICT_OPEN.len();
        } else if rest.starts_with(DICT_CLOSE) {
            depth -= 1;
            i += DICT_CLOSE.len();
            if depth == 0 {
                return Ok(&xml[start..i]);
            }
        } else {
            i += 1;
        }
    }
    Err(IdeviceError::Extraction("end of ActivationInfo"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;

    #[test]
    fn strips_the_plist_wrapper() {
        assert_eq!(
            dict_fragment(b"<plist><dict>A</dict></plist>").unwrap(),
            b"<dict>A</dict>"
        );
    }

    #[test]
    fn missing_open_marker() {
        assert!(matches!(
            dict_fragment(b"<plist><string>A</string></plist>"),
            Err(IdeviceError::Extraction("beginning of ActivationInfo"))
        ));
    }

    #[test]
    fn missing_close_marker() {
        assert!(matches!(
            dict_fragment(b"<plist><dict>A</plist>"),
            Err(IdeviceError::Extraction("end of ActivationInfo"))
        ));
    }

    #[test]
    fn nested_dictionaries_stay_whole() {
        let xml = b"<plist><dict><key>a</key><dict><key>b</key><dict/></dict><key>c</key></dict></plist>";
        assert_eq!(
            dict_fragment(xml).unwrap(),
            &b"<dict><key>a</key><dict><key>b</key><dict/></dict><key>c</key></dict>"[..]
        );
    }

    #[test]
    fn from_value_serializes_the_inner_dict() {
        let mut dict = plist::Dictionary::new();
        dict.insert("ActivationRandomness".into(), "1234".into());
        dict.insert("ActivationState".into(), "Unactivated".into());

        let info = ActivationInfo::from_value(&plist::Value::Dictionary(dict.clone())).unwrap();
        let s = info.as_str();
        assert!(s.starts_with("<dict>"));
        assert!(s.ends_with("</dict>"));
        assert!(!s.contains("<plist"));
        assert!(s.contains("<key>ActivationRandomness</key>"));

        // wrapping the fragment back up gives the same document
        let wrapped = format!("<plist version=\"1.0\">{s}</plist>");
        assert_eq!(
            crate::decode_plist(wrapped.as_bytes()).unwrap(),
            plist::Value::Dictionary(dict)
        );
    }

    #[test]
    fn from_value_rejects_non_dictionaries() {
        assert!(matches!(
            ActivationInfo::from_value(&"not a dict".into()),
            Err(IdeviceError::WrongNodeType { .. })
        ));
    }

    #[tokio::test]
    async fn fetch_requires_the_property() {
        let mut device = MockDevice::iphone();
        device.values.remove(device::ACTIVATION_INFO);

        assert!(matches!(
            ActivationInfo::fetch(&mut device).await,
            Err(IdeviceError::PropertyUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn fetch_reads_the_device() {
        let mut device = MockDevice::iphone();
        let info = ActivationInfo::fetch(&mut device).await.unwrap();

        assert!(device.was_queried(device::ACTIVATION_INFO));
        assert!(info.as_str().contains("<key>k</key>"));
    }
}
