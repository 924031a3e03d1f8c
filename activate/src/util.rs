// Jackson Coxson

use std::io::Cursor;

use crate::IdeviceError;

/// Magic prefix of a binary plist
pub(crate) const BPLIST_MAGIC: &[u8; 8] = b"bplist00";

/// Decodes a plist document in either of its encodings
///
/// Documents starting with `bplist00` go through the binary decoder, anything
/// else is read as XML.
pub fn decode_plist(bytes: &[u8]) -> Result<plist::Value, IdeviceError> {
    if bytes.starts_with(BPLIST_MAGIC) {
        Ok(plist::Value::from_reader(Cursor::new(bytes))?)
    } else {
        Ok(plist::Value::from_reader_xml(bytes)?)
    }
}

/// Position of the first occurrence of `needle` in `haystack`
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_encodings() {
        let mut dict = plist::Dictionary::new();
        dict.insert("ticket".into(), "T1".into());
        let value = plist::Value::Dictionary(dict);

        let mut xml = Vec::new();
        value.to_writer_xml(&mut xml).unwrap();
        let mut binary = Vec::new();
        value.to_writer_binary(&mut binary).unwrap();

        assert!(binary.starts_with(BPLIST_MAGIC));
        assert_eq!(decode_plist(&xml).unwrap(), value);
        assert_eq!(decode_plist(&binary).unwrap(), value);
    }

    #[test]
    fn find_bytes_reports_first_match() {
        assert_eq!(find_bytes(b"a</dict></dict>", b"</dict>"), Some(1));
        assert_eq!(find_bytes(b"abc", b"<dict>"), None);
    }
}
