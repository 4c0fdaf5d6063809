//! The compiled specification container.
//!
//! A `.sla` file is a 4-byte header (`"sla"` plus a format version)
//! followed by a zlib-deflated packed tag stream; streams that fail
//! to inflate are accepted as uncompressed for tooling convenience.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::error::Error;

pub mod decode;
pub mod encode;
pub mod format;

pub use decode::{AttrValue, PackedDecoder};
pub use encode::PackedEncoder;

/// Strip and validate the file header, returning the inflated payload.
pub fn open_payload(file_bytes: &[u8]) -> Result<Vec<u8>, Error> {
    if file_bytes.len() < 4 || file_bytes[..3] != format::MAGIC {
        return Err(Error::Format("missing sla magic".into()));
    }
    let version = file_bytes[3];
    if version != format::FORMAT_VERSION {
        return Err(Error::Format(format!(
            "unsupported sla format version {version}, expected {}",
            format::FORMAT_VERSION
        )));
    }
    let body = &file_bytes[4..];
    let mut inflated = Vec::new();
    let mut decoder = ZlibDecoder::new(body);
    match decoder.read_to_end(&mut inflated) {
        Ok(_) => Ok(inflated),
        // Not every producer compresses; fall back to the raw body.
        Err(_) => Ok(body.to_vec()),
    }
}

/// Wrap an encoded payload in the file header, compressing the body.
pub fn seal_payload(payload: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut out = Vec::with_capacity(payload.len() / 2 + 8);
    out.extend_from_slice(&format::MAGIC);
    out.push(format::FORMAT_VERSION);
    let mut encoder = ZlibEncoder::new(&mut out, Compression::default());
    encoder
        .write_all(payload)
        .and_then(|_| encoder.finish().map(|_| ()))
        .expect("writing to a Vec cannot fail");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_payload_round_trips() {
        let payload = b"not a real stream, but bytes all the same".to_vec();
        let file = seal_payload(&payload);
        assert_eq!(&file[..3], b"sla");
        assert_eq!(file[3], format::FORMAT_VERSION);
        assert_eq!(open_payload(&file).unwrap(), payload);
    }

    #[test]
    fn uncompressed_body_is_accepted() {
        let mut file = Vec::new();
        file.extend_from_slice(b"sla");
        file.push(format::FORMAT_VERSION);
        file.extend_from_slice(b"\x41\x81");
        assert_eq!(open_payload(&file).unwrap(), b"\x41\x81");
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(open_payload(b"als\x04").is_err());
        assert!(open_payload(b"sla\x03").is_err());
        assert!(open_payload(b"sl").is_err());
    }
}
