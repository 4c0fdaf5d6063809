//! Pull decoder for the packed tag stream.
//!
//! The stream is a sequence of header bytes. The top two bits select
//! the record kind (element open, element close, attribute); bit 5
//! extends the id into the following byte, giving 13-bit ids. An
//! attribute header is followed by a type byte whose high nibble is
//! the type code and whose low nibble is a length code, then the
//! payload. Attributes of an element always precede its children.

use crate::error::Error;

const KIND_MASK: u8 = 0xc0;
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

/// One decoded attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// UTF-8 string.
    Str(String),
}

#[derive(Debug)]
struct Frame {
    id: u16,
    attrs: Vec<(u16, AttrValue)>,
}

/// Streaming decoder over an inflated specification payload.
#[derive(Debug)]
pub struct PackedDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    frames: Vec<Frame>,
}

impl<'a> PackedDecoder<'a> {
    /// Decode from `bytes`, which must already be decompressed.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            frames: Vec::new(),
        }
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Id of the next element open, without consuming it.
    pub fn peek_element(&self) -> Option<u16> {
        let header = *self.bytes.get(self.pos)?;
        if header & KIND_MASK != KIND_ELEMENT_START {
            return None;
        }
        if header & EXTEND_MASK != 0 {
            let next = *self.bytes.get(self.pos + 1)?;
            Some((u16::from(header & ID_MASK) << 8) | u16::from(next))
        } else {
            Some(u16::from(header & ID_MASK))
        }
    }

    /// Open the next element, which must have id `id`.
    pub fn open_element(&mut self, id: u16) -> Result<(), Error> {
        let found = self.open_any()?;
        if found != id {
            return Err(Error::Format(format!(
                "expected element {id}, found {found}"
            )));
        }
        Ok(())
    }

    /// Open whatever element comes next and return its id.
    pub fn open_any(&mut self) -> Result<u16, Error> {
        let (kind, id) = self.read_header()?;
        if kind != KIND_ELEMENT_START {
            return Err(Error::Format(format!(
                "expected element open, found record kind {kind:#x}"
            )));
        }
        let mut attrs = Vec::new();
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b & KIND_MASK == KIND_ATTRIBUTE)
        {
            let (_, attr_id) = self.read_header()?;
            let value = self.read_value()?;
            attrs.push((attr_id, value));
        }
        self.frames.push(Frame { id, attrs });
        Ok(id)
    }

    /// Close the innermost element, which must have id `id`.
    pub fn close_element(&mut self, id: u16) -> Result<(), Error> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Error::Format("element close without open".into()))?;
        if frame.id != id {
            return Err(Error::Format(format!(
                "mismatched element close: open {}, close {id}",
                frame.id
            )));
        }
        let (kind, found) = self.read_header()?;
        if kind != KIND_ELEMENT_END || found != id {
            return Err(Error::Format(format!(
                "expected close of element {id}, found {found}"
            )));
        }
        Ok(())
    }

    /// Whether the current element carries attribute `attr`.
    pub fn has_attr(&self, attr: u16) -> bool {
        self.current(attr).is_some()
    }

    /// Read an unsigned attribute of the current element.
    pub fn read_uint(&self, attr: u16) -> Result<u64, Error> {
        match self.require(attr)? {
            AttrValue::Uint(v) => Ok(*v),
            AttrValue::Int(v) if *v >= 0 => Ok(*v as u64),
            AttrValue::Bool(b) => Ok(u64::from(*b)),
            other => Err(Error::Format(format!(
                "attribute {attr} is not unsigned: {other:?}"
            ))),
        }
    }

    /// Read an unsigned attribute, defaulting when absent.
    pub fn read_uint_or(&self, attr: u16, default: u64) -> Result<u64, Error> {
        if self.has_attr(attr) {
            self.read_uint(attr)
        } else {
            Ok(default)
        }
    }

    /// Read a signed attribute of the current element.
    pub fn read_int(&self, attr: u16) -> Result<i64, Error> {
        match self.require(attr)? {
            AttrValue::Int(v) => Ok(*v),
            AttrValue::Uint(v) => i64::try_from(*v)
                .map_err(|_| Error::Format(format!("attribute {attr} overflows i64"))),
            other => Err(Error::Format(format!(
                "attribute {attr} is not an integer: {other:?}"
            ))),
        }
    }

    /// Read a boolean attribute, defaulting to `false` when absent.
    pub fn read_bool(&self, attr: u16) -> Result<bool, Error> {
        match self.current(attr) {
            None => Ok(false),
            Some(AttrValue::Bool(b)) => Ok(*b),
            Some(AttrValue::Uint(v)) => Ok(*v != 0),
            Some(other) => Err(Error::Format(format!(
                "attribute {attr} is not boolean: {other:?}"
            ))),
        }
    }

    /// Read a string attribute of the current element.
    pub fn read_string(&self, attr: u16) -> Result<String, Error> {
        match self.require(attr)? {
            AttrValue::Str(s) => Ok(s.clone()),
            other => Err(Error::Format(format!(
                "attribute {attr} is not a string: {other:?}"
            ))),
        }
    }

    fn current(&self, attr: u16) -> Option<&AttrValue> {
        let frame = self.frames.last()?;
        frame
            .attrs
            .iter()
            .find(|(id, _)| *id == attr)
            .map(|(_, value)| value)
    }

    fn require(&self, attr: u16) -> Result<&AttrValue, Error> {
        self.current(attr).ok_or_else(|| {
            let element = self.frames.last().map(|f| f.id).unwrap_or(0);
            Error::Format(format!("element {element} missing attribute {attr}"))
        })
    }

    fn read_header(&mut self) -> Result<(u8, u16), Error> {
        let header = self.next_byte()?;
        let kind = header & KIND_MASK;
        let id = if header & EXTEND_MASK != 0 {
            let next = self.next_byte()?;
            (u16::from(header & ID_MASK) << 8) | u16::from(next)
        } else {
            u16::from(header & ID_MASK)
        };
        Ok((kind, id))
    }

    fn read_value(&mut self) -> Result<AttrValue, Error> {
        let type_byte = self.next_byte()?;
        let code = type_byte >> 4;
        let len = usize::from(type_byte & 0x0f);
        match code {
            TYPE_BOOL => Ok(AttrValue::Bool(len != 0)),
            TYPE_POSITIVE => Ok(AttrValue::Int(self.read_magnitude(len)? as i64)),
            TYPE_NEGATIVE => {
                let magnitude = self.read_magnitude(len)?;
                Ok(AttrValue::Int(-(magnitude as i64)))
            }
            TYPE_UNSIGNED => Ok(AttrValue::Uint(self.read_magnitude(len)?)),
            TYPE_STRING => {
                let strlen = self.read_magnitude(len)? as usize;
                let start = self.pos;
                let end = start
                    .checked_add(strlen)
                    .filter(|&end| end <= self.bytes.len())
                    .ok_or_else(|| Error::Format("string runs past end of stream".into()))?;
                self.pos = end;
                let text = std::str::from_utf8(&self.bytes[start..end])
                    .map_err(|_| Error::Format("string is not valid UTF-8".into()))?;
                Ok(AttrValue::Str(text.into()))
            }
            other => Err(Error::Format(format!("unknown attribute type {other}"))),
        }
    }

    fn read_magnitude(&mut self, len: usize) -> Result<u64, Error> {
        if len > 8 {
            return Err(Error::Format(format!("integer of {len} bytes")));
        }
        let mut res: u64 = 0;
        for _ in 0..len {
            res = (res << 8) | u64::from(self.next_byte()?);
        }
        Ok(res)
    }

    fn next_byte(&mut self) -> Result<u8, Error> {
        let byte = self
            .bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::Format("unexpected end of stream".into()))?;
        self.pos += 1;
        Ok(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sla::encode::PackedEncoder;

    #[test]
    fn element_round_trip() {
        let mut enc = PackedEncoder::new();
        enc.open_element(5);
        enc.write_uint(2, 0x1234_5678_9abc);
        enc.write_int(3, -42);
        enc.write_bool(4, true);
        enc.write_string(6, "ram");
        enc.open_element(300);
        enc.close_element(300);
        enc.close_element(5);
        let bytes = enc.finish();

        let mut dec = PackedDecoder::new(&bytes);
        assert_eq!(dec.peek_element(), Some(5));
        dec.open_element(5).unwrap();
        assert_eq!(dec.read_uint(2).unwrap(), 0x1234_5678_9abc);
        assert_eq!(dec.read_int(3).unwrap(), -42);
        assert!(dec.read_bool(4).unwrap());
        assert!(!dec.read_bool(9).unwrap());
        assert_eq!(dec.read_string(6).unwrap(), "ram");
        assert_eq!(dec.peek_element(), Some(300));
        dec.open_element(300).unwrap();
        dec.close_element(300).unwrap();
        dec.close_element(5).unwrap();
        assert!(dec.is_empty());
    }

    #[test]
    fn mismatched_close_is_rejected() {
        let mut enc = PackedEncoder::new();
        enc.open_element(5);
        enc.close_element(5);
        let bytes = enc.finish();
        let mut dec = PackedDecoder::new(&bytes);
        dec.open_element(5).unwrap();
        assert!(dec.close_element(6).is_err());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut enc = PackedEncoder::new();
        enc.open_element(5);
        enc.write_string(6, "truncated");
        enc.close_element(5);
        let bytes = enc.finish();
        let mut dec = PackedDecoder::new(&bytes[..bytes.len() - 4]);
        assert!(dec.open_element(5).is_err() || dec.close_element(5).is_err());
    }

    #[test]
    fn zero_is_encoded_with_no_payload() {
        let mut enc = PackedEncoder::new();
        enc.open_element(1);
        enc.write_uint(2, 0);
        enc.close_element(1);
        let bytes = enc.finish();
        let mut dec = PackedDecoder::new(&bytes);
        dec.open_element(1).unwrap();
        assert_eq!(dec.read_uint(2).unwrap(), 0);
    }
}
