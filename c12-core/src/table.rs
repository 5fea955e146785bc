//! Generic table access model
//!
//! A C12 meter exposes its data as numbered tables. The engine does not know
//! table layouts, it only moves raw octets described by a [`TableDescriptor`]
//! and hands back [`TableRawData`].

use crate::error::{C12Error, C12Result};
use serde::{Deserialize, Serialize};

/// Largest table number that fits the two-byte table identifier
pub const MAX_TABLE_NUMBER: u32 = 0xFFFF;

/// Largest offset that fits the three-byte partial access offset
pub const MAX_TABLE_OFFSET: u32 = 0xFF_FFFF;

/// Largest count that fits the two-byte partial access count
pub const MAX_TABLE_COUNT: u32 = 0xFFFF;

/// Manufacturer tables are numbered from this value
pub const MANUFACTURER_TABLE_BASE: u32 = 2048;

/// Full or partial access to a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableAccess {
    /// Whole table
    Full,
    /// `count` bytes starting at `offset`
    Partial { offset: u32, count: u32 },
}

/// Identifies a logical meter table and how it is to be accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table number as the meter knows it
    pub number: u32,
    pub access: TableAccess,
    /// Indexed (paged) tables are read in pieces by the caller
    pub indexed: bool,
    /// Size the caller expects for a full read; larger reads get split into
    /// partial reads that fit the negotiated link limits
    pub expected_size: Option<u32>,
}

impl TableDescriptor {
    /// Full access to a standard table
    pub fn full(number: u32) -> Self {
        Self {
            number,
            access: TableAccess::Full,
            indexed: false,
            expected_size: None,
        }
    }

    /// Partial access to `count` bytes starting at `offset`
    pub fn partial(number: u32, offset: u32, count: u32) -> Self {
        Self {
            number,
            access: TableAccess::Partial { offset, count },
            indexed: false,
            expected_size: None,
        }
    }

    /// Full access to manufacturer table `number` (MT`number`)
    pub fn manufacturer(number: u32) -> Self {
        Self::full(MANUFACTURER_TABLE_BASE + number)
    }

    pub fn with_expected_size(mut self, size: u32) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn indexed(mut self, indexed: bool) -> Self {
        self.indexed = indexed;
        self
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.access, TableAccess::Partial { .. })
    }

    /// Validate the descriptor before any I/O happens
    ///
    /// # Errors
    ///
    /// * `IndexOutOfRange` if the table number does not fit two bytes
    /// * `NumberOutOfRange` if offset, count or expected size do not fit
    ///   their wire fields
    pub fn validate(&self) -> C12Result<()> {
        if self.number > MAX_TABLE_NUMBER {
            return Err(C12Error::IndexOutOfRange {
                what: "table number",
                index: self.number as u64,
                max: MAX_TABLE_NUMBER as u64,
            });
        }
        if let TableAccess::Partial { offset, count } = self.access {
            if offset > MAX_TABLE_OFFSET {
                return Err(C12Error::NumberOutOfRange {
                    what: "table offset",
                    value: offset as u64,
                    min: 0,
                    max: MAX_TABLE_OFFSET as u64,
                });
            }
            if count == 0 || count > MAX_TABLE_COUNT {
                return Err(C12Error::NumberOutOfRange {
                    what: "table count",
                    value: count as u64,
                    min: 1,
                    max: MAX_TABLE_COUNT as u64,
                });
            }
            let end = offset as u64 + count as u64;
            if end > MAX_TABLE_OFFSET as u64 + 1 {
                return Err(C12Error::NumberOutOfRange {
                    what: "table end offset",
                    value: end,
                    min: 1,
                    max: MAX_TABLE_OFFSET as u64 + 1,
                });
            }
        }
        if let Some(size) = self.expected_size {
            if size > MAX_TABLE_OFFSET + 1 {
                return Err(C12Error::NumberOutOfRange {
                    what: "expected table size",
                    value: size as u64,
                    min: 0,
                    max: MAX_TABLE_OFFSET as u64 + 1,
                });
            }
        }
        Ok(())
    }

    /// Validate the descriptor together with the data about to be written
    pub fn validate_write(&self, data: &[u8]) -> C12Result<()> {
        self.validate()?;
        match self.access {
            TableAccess::Full => {
                if data.len() as u64 > MAX_TABLE_OFFSET as u64 + 1 {
                    return Err(C12Error::NumberOutOfRange {
                        what: "table data length",
                        value: data.len() as u64,
                        min: 0,
                        max: MAX_TABLE_OFFSET as u64 + 1,
                    });
                }
            }
            TableAccess::Partial { count, .. } => {
                if data.len() as u64 != count as u64 {
                    return Err(C12Error::NumberOutOfRange {
                        what: "table data length",
                        value: data.len() as u64,
                        min: count as u64,
                        max: count as u64,
                    });
                }
            }
        }
        Ok(())
    }

    /// Table number as it goes on the wire
    pub fn wire_number(&self) -> u16 {
        self.number as u16
    }
}

/// Payload of a successful table read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRawData {
    pub number: u16,
    /// Offset of the first byte for partial reads
    pub offset: Option<u32>,
    pub data: Vec<u8>,
    /// Length announced by the meter in the response
    pub declared_length: usize,
    /// False when the table checksum did not match the data
    pub checksum_valid: bool,
}

impl TableRawData {
    pub fn actual_length(&self) -> usize {
        self.data.len()
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == self.declared_length
    }
}

/// Table data checksum: two's complement of the 8-bit sum of all bytes
pub fn table_checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        assert_eq!(table_checksum(&[]), 0);
        assert_eq!(table_checksum(&[0x01]), 0xFF);
        let data = [0x10, 0x20, 0x30, 0xF0];
        let cksum = table_checksum(&data);
        let total = data.iter().fold(cksum, |acc, b| acc.wrapping_add(*b));
        assert_eq!(total, 0);
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(TableDescriptor::full(0).validate().is_ok());
        assert!(TableDescriptor::partial(64, 0xFF_FF00, 0xFF).validate().is_ok());

        match TableDescriptor::full(0x1_0000).validate() {
            Err(C12Error::IndexOutOfRange { index, .. }) => assert_eq!(index, 0x1_0000),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            TableDescriptor::partial(1, 0x100_0000, 1).validate(),
            Err(C12Error::NumberOutOfRange { what: "table offset", .. })
        ));
        assert!(matches!(
            TableDescriptor::partial(1, 0, 0).validate(),
            Err(C12Error::NumberOutOfRange { what: "table count", .. })
        ));
        assert!(matches!(
            TableDescriptor::partial(1, 0xFF_FFFF, 2).validate(),
            Err(C12Error::NumberOutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_write_length() {
        let desc = TableDescriptor::partial(8, 0, 4);
        assert!(desc.validate_write(&[1, 2, 3, 4]).is_ok());
        assert!(matches!(
            desc.validate_write(&[1, 2, 3]),
            Err(C12Error::NumberOutOfRange { .. })
        ));
    }

    #[test]
    fn test_manufacturer_table() {
        let desc = TableDescriptor::manufacturer(17);
        assert_eq!(desc.number, 2065);
        assert_eq!(desc.wire_number(), 2065);
    }

    #[test]
    fn test_raw_data_lengths() {
        let raw = TableRawData {
            number: 0,
            offset: None,
            data: vec![0; 8],
            declared_length: 8,
            checksum_valid: true,
        };
        assert_eq!(raw.actual_length(), 8);
        assert!(raw.is_complete());
    }
}
