//! ISO 8825 encodings used by C12.22
//!
//! Lengths, universal identifiers and the tagged elements of the ACSE,
//! plus a cursor that reads them back.

use bytes::{BufMut, BytesMut};
use c12_core::{C12Error, C12Result};

/// Tag of an absolute universal identifier
pub const UID_ABSOLUTE: u8 = 0x06;
/// Tag of a relative universal identifier
pub const UID_RELATIVE: u8 = 0x80;
/// Tag of an integer
pub const INTEGER: u8 = 0x02;

const SHORTEST_UID_STRING: usize = 2;
const LONGEST_UID_STRING: usize = 128;

fn bad_uid(uid: &str) -> C12Error {
    C12Error::InvalidData(format!("ISO 8825 universal identifier '{}' is bad", uid))
}

/// Encode a length, short form below 0x80
pub fn encode_length(length: u32, out: &mut BytesMut) {
    let bytes = length.to_be_bytes();
    match length {
        0..=0x7F => out.put_u8(length as u8),
        0x80..=0xFF => {
            out.put_u8(0x81);
            out.put_u8(length as u8);
        }
        0x100..=0xFFFF => {
            out.put_u8(0x82);
            out.put_slice(&bytes[2..]);
        }
        0x1_0000..=0xFF_FFFF => {
            out.put_u8(0x83);
            out.put_slice(&bytes[1..]);
        }
        _ => {
            out.put_u8(0x84);
            out.put_slice(&bytes);
        }
    }
}

pub fn length_bytes(length: u32) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(5);
    encode_length(length, &mut out);
    out.to_vec()
}

/// A relative UID starts with a period
pub fn is_uid_relative(uid: &str) -> bool {
    uid.starts_with('.')
}

/// Binary form of a dotted universal identifier, without tag and length
pub fn encode_uid(uid: &str) -> C12Result<Vec<u8>> {
    if uid.len() < SHORTEST_UID_STRING || uid.len() > LONGEST_UID_STRING {
        return Err(bad_uid(uid));
    }
    let relative = is_uid_relative(uid);
    let body = if relative { &uid[1..] } else { uid };
    let mut arcs = body.split('.').map(|arc| arc.parse::<u32>().map_err(|_| bad_uid(uid)));

    let mut out = Vec::with_capacity(uid.len() / 2 + 1);
    if !relative {
        let first = arcs.next().ok_or_else(|| bad_uid(uid))??;
        let second = arcs.next().ok_or_else(|| bad_uid(uid))??;
        if first > 2 || second > 39 {
            return Err(bad_uid(uid));
        }
        out.push((first * 40 + second) as u8);
    }
    for arc in arcs {
        let number = arc?;
        if number > 0x0FFF_FFFF {
            return Err(bad_uid(uid));
        }
        if number >= 0x20_0000 {
            out.push(((number >> 21) as u8) | 0x80);
        }
        if number >= 0x4000 {
            out.push(((number >> 14) as u8) | 0x80);
        }
        if number >= 0x80 {
            out.push(((number >> 7) as u8) | 0x80);
        }
        out.push((number & 0x7F) as u8);
    }
    Ok(out)
}

/// Dotted form of a binary universal identifier
pub fn decode_uid(bytes: &[u8], relative: bool) -> C12Result<String> {
    if bytes.is_empty() {
        return Err(C12Error::InvalidData(
            "ISO 8825 universal identifier is empty".to_string(),
        ));
    }
    let mut result = String::with_capacity(bytes.len() * 3);
    let mut rest = bytes;
    if !relative {
        let first = bytes[0];
        result.push_str(&format!("{}.{}", (first / 40).min(2), first - (first / 40).min(2) * 40));
        rest = &bytes[1..];
    }
    let mut number: u32 = 0;
    for &b in rest {
        number = (number << 7) | (b & 0x7F) as u32;
        if b & 0x80 == 0 {
            result.push('.');
            result.push_str(&number.to_string());
            number = 0;
        }
    }
    Ok(result)
}

/// `tag, length, 06|80, length, uid`
pub fn encode_tagged_uid(tag: u8, uid: &str, out: &mut BytesMut) -> C12Result<()> {
    let encoded = encode_uid(uid)?;
    out.put_u8(tag);
    out.put_u8((encoded.len() + 2) as u8);
    out.put_u8(if is_uid_relative(uid) { UID_RELATIVE } else { UID_ABSOLUTE });
    out.put_u8(encoded.len() as u8);
    out.put_slice(&encoded);
    Ok(())
}

/// `tag, length, 02, length, value` with the fewest big-endian bytes
pub fn encode_tagged_unsigned(tag: u8, value: u32, out: &mut BytesMut) {
    let size = match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    };
    out.put_u8(tag);
    out.put_u8(size as u8 + 2);
    out.put_u8(INTEGER);
    out.put_u8(size as u8);
    out.put_slice(&value.to_be_bytes()[4 - size..]);
}

/// Read cursor over received bytes
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.buffer[self.position..]
    }

    fn short(&self, wanted: usize) -> C12Error {
        C12Error::PartialData {
            declared: self.position + wanted,
            actual: self.buffer.len(),
        }
    }

    pub fn read_u8(&mut self) -> C12Result<u8> {
        let byte = *self.buffer.get(self.position).ok_or_else(|| self.short(1))?;
        self.position += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, count: usize) -> C12Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(self.short(count));
        }
        let bytes = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(bytes)
    }

    pub fn skip(&mut self, count: usize) -> C12Result<()> {
        self.read_bytes(count).map(|_| ())
    }

    pub fn read_u16(&mut self) -> C12Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> C12Result<u32> {
        let b = self.read_bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    /// ISO length, up to three length octets
    pub fn read_length(&mut self) -> C12Result<usize> {
        let first = self.read_u8()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let octets = (first & 0x7F) as usize;
        if octets == 0 || octets > 3 {
            return Err(C12Error::InvalidData(format!(
                "ISO 8825 length with {} octets is bad",
                octets
            )));
        }
        let bytes = self.read_bytes(octets)?;
        Ok(bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }

    /// `06|80, length, uid`
    pub fn read_uid(&mut self) -> C12Result<String> {
        let kind = self.read_u8()?;
        let relative = match kind {
            UID_ABSOLUTE => false,
            UID_RELATIVE | 0x0D => true,
            other => {
                return Err(C12Error::InvalidData(format!(
                    "Universal identifier tag 0x{:02X} is bad",
                    other
                )));
            }
        };
        let length = self.read_length()?;
        decode_uid(self.read_bytes(length)?, relative)
    }

    /// `02, length, value` of one to four bytes
    pub fn read_integer(&mut self) -> C12Result<u32> {
        let kind = self.read_u8()?;
        let length = self.read_length()?;
        if kind != INTEGER || length == 0 || length > 4 {
            return Err(C12Error::InvalidData(format!(
                "Integer element 0x{:02X} of {} bytes is bad",
                kind, length
            )));
        }
        let bytes = self.read_bytes(length)?;
        Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
    }
}
