//! Core types and utilities for ANSI C12 protocols
//!
//! This crate provides the error taxonomy, the generic table access model,
//! the dialect capability table and the protocol configuration used
//! throughout the C12.18/C12.21/C12.22 implementation.

pub mod config;
pub mod dialect;
pub mod error;
pub mod hex;
pub mod table;

pub use config::{C1221Options, C1222Options, ProtocolConfig, ResponseControl, SecurityMode};
pub use dialect::{ChecksumKind, Dialect, DialectCapabilities, Framing, SecurityHandshake};
pub use error::{C12Error, C12Result, FailureDisposition, NokCode, ProcedureResult};
pub use hex::to_hex;
pub use table::{TableAccess, TableDescriptor, TableRawData, table_checksum};
