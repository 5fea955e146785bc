//! EPSEM envelope of C12.22
//!
//! The user information element carries an EPSEM control byte, an
//! optional device class and a list of services, each preceded by its
//! ISO 8825 length.

use crate::iso8825::{self, Reader};
use bytes::{BufMut, BytesMut};
use c12_core::{C12Error, C12Result, ResponseControl, SecurityMode};

/// Size of the device class field
pub const ED_CLASS_SIZE: usize = 4;

const CONTROL_RESERVED: u8 = 0x80;
const CONTROL_ED_CLASS: u8 = 0x10;

/// EPSEM control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpsemControl {
    pub security_mode: SecurityMode,
    pub response_control: ResponseControl,
    pub ed_class_included: bool,
}

impl EpsemControl {
    pub fn new(security_mode: SecurityMode, response_control: ResponseControl, ed_class_included: bool) -> Self {
        Self {
            security_mode,
            response_control,
            ed_class_included,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut byte = CONTROL_RESERVED | self.response_control as u8 | ((self.security_mode as u8) << 2);
        if self.ed_class_included {
            byte |= CONTROL_ED_CLASS;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> C12Result<Self> {
        let security_mode = SecurityMode::from_bits((byte >> 2) & 0x03).ok_or_else(|| {
            C12Error::Protocol(format!("EPSEM control 0x{:02X} has a bad security mode", byte))
        })?;
        let response_control = ResponseControl::from_bits(byte & 0x03).ok_or_else(|| {
            C12Error::Protocol(format!("EPSEM control 0x{:02X} has a bad response control", byte))
        })?;
        Ok(Self {
            security_mode,
            response_control,
            ed_class_included: byte & CONTROL_ED_CLASS != 0,
        })
    }
}

/// Device class padded with spaces to four bytes
pub fn padded_ed_class(ed_class: &[u8]) -> C12Result<[u8; ED_CLASS_SIZE]> {
    if ed_class.len() > ED_CLASS_SIZE {
        return Err(C12Error::NumberOutOfRange {
            what: "ED class length",
            value: ed_class.len() as u64,
            min: 0,
            max: ED_CLASS_SIZE as u64,
        });
    }
    let mut padded = [b' '; ED_CLASS_SIZE];
    padded[..ed_class.len()].copy_from_slice(ed_class);
    Ok(padded)
}

/// Append one service with its length prefix
pub fn put_service(service: &[u8], out: &mut BytesMut) {
    iso8825::encode_length(service.len() as u32, out);
    out.put_slice(service);
}

/// EPSEM body: optional device class followed by the services
pub fn encode_services<'a, I>(ed_class: Option<&[u8]>, services: I) -> C12Result<BytesMut>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = BytesMut::new();
    if let Some(ed_class) = ed_class {
        out.put_slice(&padded_ed_class(ed_class)?);
    }
    for service in services {
        put_service(service, &mut out);
    }
    Ok(out)
}

/// Split a received EPSEM body into its service responses
///
/// A zero length ends the list early.
pub fn split_responses(epsem: &[u8]) -> C12Result<Vec<Vec<u8>>> {
    let mut reader = Reader::new(epsem);
    let mut responses = Vec::new();
    while reader.remaining() > 0 {
        let length = reader.read_length()?;
        if length == 0 {
            break;
        }
        if length > reader.remaining() {
            return Err(C12Error::Protocol(format!(
                "EPSEM service of {} bytes exceeds the {} bytes left",
                length,
                reader.remaining()
            )));
        }
        responses.push(reader.read_bytes(length)?.to_vec());
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_byte() {
        let control = EpsemControl::new(
            SecurityMode::CipherTextWithAuthentication,
            ResponseControl::OnException,
            true,
        );
        assert_eq!(control.to_byte(), 0x99);
        assert_eq!(EpsemControl::from_byte(0x99).unwrap(), control);
        assert_eq!(
            EpsemControl::new(SecurityMode::ClearText, ResponseControl::Always, false).to_byte(),
            0x80
        );
        assert!(EpsemControl::from_byte(0x8C).is_err());
    }

    #[test]
    fn test_services_with_ed_class() {
        let body = encode_services(Some(b"AB"), [&[0x30u8, 0x00, 0x00][..], &[0x52][..]]).unwrap();
        assert_eq!(
            body.to_vec(),
            vec![b'A', b'B', b' ', b' ', 0x03, 0x30, 0x00, 0x00, 0x01, 0x52]
        );
        assert!(padded_ed_class(b"TOOLONG").is_err());
    }

    #[test]
    fn test_split_responses_stops_at_zero() {
        let responses = split_responses(&[0x01, 0x00, 0x02, 0x00, 0x3C, 0x00, 0xEE]).unwrap();
        assert_eq!(responses, vec![vec![0x00], vec![0x00, 0x3C]]);
        assert!(split_responses(&[0x05, 0x00]).is_err());
    }
}
