//! Writer for the packed tag stream.
//!
//! The decoder's mirror image; used by specification tooling and by
//! the test suites to assemble fixture streams. Produces the payload
//! only: compression and the file header are applied by the caller.

const KIND_ELEMENT_START: u8 = 0x40;
const KIND_ELEMENT_END: u8 = 0x80;
const KIND_ATTRIBUTE: u8 = 0xc0;
const EXTEND_MASK: u8 = 0x20;
const ID_MASK: u8 = 0x1f;

const TYPE_BOOL: u8 = 1;
const TYPE_POSITIVE: u8 = 2;
const TYPE_NEGATIVE: u8 = 3;
const TYPE_UNSIGNED: u8 = 4;
const TYPE_STRING: u8 = 7;

/// Append-only encoder for one payload.
#[derive(Debug, Default)]
pub struct PackedEncoder {
    bytes: Vec<u8>,
}

impl PackedEncoder {
    /// Start an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open element `id`.
    pub fn open_element(&mut self, id: u16) {
        self.write_header(KIND_ELEMENT_START, id);
    }

    /// Close element `id`.
    pub fn close_element(&mut self, id: u16) {
        self.write_header(KIND_ELEMENT_END, id);
    }

    /// Attach an unsigned integer attribute to the open element.
    pub fn write_uint(&mut self, attr: u16, value: u64) {
        self.write_header(KIND_ATTRIBUTE, attr);
        self.write_integer(TYPE_UNSIGNED, value);
    }

    /// Attach a signed integer attribute to the open element.
    pub fn write_int(&mut self, attr: u16, value: i64) {
        self.write_header(KIND_ATTRIBUTE, attr);
        if value < 0 {
            self.write_integer(TYPE_NEGATIVE, value.unsigned_abs());
        } else {
            self.write_integer(TYPE_POSITIVE, value as u64);
        }
    }

    /// Attach a boolean attribute to the open element.
    pub fn write_bool(&mut self, attr: u16, value: bool) {
        self.write_header(KIND_ATTRIBUTE, attr);
        self.bytes.push((TYPE_BOOL << 4) | u8::from(value));
    }

    /// Attach a string attribute to the open element.
    pub fn write_string(&mut self, attr: u16, value: &str) {
        self.write_header(KIND_ATTRIBUTE, attr);
        let data = value.as_bytes();
        let lenlen = magnitude_len(data.len() as u64);
        self.bytes.push((TYPE_STRING << 4) | lenlen);
        self.push_magnitude(data.len() as u64, lenlen);
        self.bytes.extend_from_slice(data);
    }

    /// Finish and take the payload bytes.
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    fn write_header(&mut self, kind: u8, id: u16) {
        if id <= u16::from(ID_MASK) {
            self.bytes.push(kind | (id as u8));
        } else {
            debug_assert!(id < (1 << 13));
            self.bytes.push(kind | EXTEND_MASK | ((id >> 8) as u8 & ID_MASK));
            self.bytes.push((id & 0xff) as u8);
        }
    }

    fn write_integer(&mut self, code: u8, magnitude: u64) {
        let len = magnitude_len(magnitude);
        self.bytes.push((code << 4) | len);
        self.push_magnitude(magnitude, len);
    }

    fn push_magnitude(&mut self, magnitude: u64, len: u8) {
        for i in (0..len).rev() {
            self.bytes.push((magnitude >> (8 * i)) as u8);
        }
    }
}

fn magnitude_len(magnitude: u64) -> u8 {
    ((64 - magnitude.leading_zeros() + 7) / 8) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_ids_use_two_bytes() {
        let mut enc = PackedEncoder::new();
        enc.open_element(0x1f);
        enc.close_element(0x1f);
        enc.open_element(0x20);
        enc.close_element(0x20);
        let bytes = enc.finish();
        // Short id: one byte each; extended id: two bytes each.
        assert_eq!(bytes.len(), 2 + 4);
    }
}
