//! Activation ticket parsing
//!
//! The activation server answers with an HTML page that carries the ticket as
//! an embedded plist. Only the first `<plist ...>...</plist>` element matters.

use std::path::Path;

use tracing::{debug, info};

use crate::{IdeviceError, decode_plist, util::find_bytes};

const PLIST_OPEN: &[u8] = b"<plist";
const PLIST_CLOSE: &[u8] = b"</plist>";

/// Keys the activation node may live under, in order of preference
const ACTIVATION_NODES: [&str; 2] = ["iphone-activation", "device-activation"];
const ACTIVATION_RECORD: &str = "activation-record";

/// Slices the embedded plist out of a response body, tags included
pub fn plist_fragment(body: &[u8]) -> Result<&[u8], IdeviceError> {
    let start = find_bytes(body, PLIST_OPEN).ok_or_else(|| {
        IdeviceError::MalformedResponse("unable to locate beginning of ticket".into())
    })?;
    let stop = find_bytes(&body[start..], PLIST_CLOSE).ok_or_else(|| {
        IdeviceError::MalformedResponse("unable to locate end of ticket".into())
    })?;
    Ok(&body[start..start + stop + PLIST_CLOSE.len()])
}

/// Pulls the activation record out of an activation server response
///
/// # Returns
/// An owned copy of the `activation-record` node
///
/// # Errors
/// [`IdeviceError::MalformedResponse`] if the body holds no decodable plist,
/// [`IdeviceError::Navigation`] if the record isn't where it should be
pub fn parse_response(body: &[u8]) -> Result<plist::Value, IdeviceError> {
    let fragment = plist_fragment(body)?;
    debug!("Ticket is {} bytes", fragment.len());
    let ticket = decode_plist(fragment).map_err(|e| {
        IdeviceError::MalformedResponse(format!(
            "unable to convert activation ticket into plist: {e}"
        ))
    })?;
    find_record(&ticket)
}

/// Walks a decoded ticket down to its activation record
pub fn find_record(ticket: &plist::Value) -> Result<plist::Value, IdeviceError> {
    let ticket = ticket
        .as_dictionary()
        .ok_or(IdeviceError::Navigation("ticket dictionary"))?;

    let node = ACTIVATION_NODES
        .iter()
        .find_map(|k| ticket.get(k))
        .and_then(|n| n.as_dictionary())
        .ok_or(IdeviceError::Navigation("device activation"))?;

    node.get(ACTIVATION_RECORD)
        .cloned()
        .ok_or(IdeviceError::Navigation("activation record"))
}

/// Reads an activation record saved to disk, in binary or XML form
pub async fn read_record_from_file(
    path: impl AsRef<Path>,
) -> Result<plist::Value, IdeviceError> {
    let path = path.as_ref();
    info!("Reading activation record from {}", path.display());
    let bytes = tokio::fs::read(path)
        .await
        .map_err(IdeviceError::RecordIo)?;
    decode_plist(&bytes)
}
