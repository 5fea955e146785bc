//! Procedure tables
//!
//! A procedure runs by writing its request to table 7 and reading the
//! result back from table 8.

use c12_core::{C12Error, C12Result, ProcedureResult};

/// Procedure initiate table
pub const PROCEDURE_REQUEST_TABLE: u16 = 7;
/// Procedure response table
pub const PROCEDURE_RESPONSE_TABLE: u16 = 8;

/// Shortest table 8: number, sequence, result
pub const MIN_PROCEDURE_RESPONSE_SIZE: usize = 4;

/// Contents of table 7
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureRequest {
    pub number: u16,
    pub sequence: u8,
    pub parameters: Vec<u8>,
}

impl ProcedureRequest {
    pub fn new(number: u16, sequence: u8, parameters: &[u8]) -> Self {
        Self {
            number,
            sequence,
            parameters: parameters.to_vec(),
        }
    }

    /// Some meters expect the procedure number low byte first
    pub fn encode(&self, little_endian: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.parameters.len() + 3);
        if little_endian {
            out.extend_from_slice(&self.number.to_le_bytes());
        } else {
            out.extend_from_slice(&self.number.to_be_bytes());
        }
        out.push(self.sequence);
        out.extend_from_slice(&self.parameters);
        out
    }
}

/// Contents of table 8
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureResponse {
    /// Raw number bytes as the meter echoed them
    pub number: [u8; 2],
    pub sequence: u8,
    pub result: ProcedureResult,
    pub data: Vec<u8>,
}

impl ProcedureResponse {
    pub fn decode(table: &[u8]) -> C12Result<Self> {
        if table.len() < MIN_PROCEDURE_RESPONSE_SIZE {
            return Err(C12Error::Protocol(format!(
                "Procedure response table has {} bytes, at least {} expected",
                table.len(),
                MIN_PROCEDURE_RESPONSE_SIZE
            )));
        }
        Ok(Self {
            number: [table[0], table[1]],
            sequence: table[2],
            result: ProcedureResult::from_byte(table[3]),
            data: table[4..].to_vec(),
        })
    }

    /// Response data of a completed procedure
    ///
    /// # Errors
    ///
    /// `BadProcedureResult` for any result but completed.
    pub fn into_data(self) -> C12Result<Vec<u8>> {
        if self.result.is_success() {
            Ok(self.data)
        } else {
            Err(C12Error::BadProcedureResult(self.result))
        }
    }
}
