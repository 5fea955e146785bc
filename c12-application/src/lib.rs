//! Application layer for ANSI C12 protocols
//!
//! This crate provides PSEM service encoding and decoding, the procedure
//! tables, the ISO 8825 encodings and the C12.22 ACSE/EPSEM codec.
//!
//! # 应用层
//! - `service`: PSEM requests and response parsers
//! - `procedure`: tables 7 and 8
//! - `iso8825`: lengths, universal identifiers and tagged elements
//! - `epsem`: EPSEM control byte and service framing
//! - `acse`: C12.22 APDU building, securing, parsing and opening

pub mod acse;
pub mod epsem;
pub mod iso8825;
pub mod procedure;
pub mod service;

pub use acse::{AcseParameters, CallingAuthentication, IncomingApdu, OutgoingApdu, Seal};
pub use epsem::{EpsemControl, split_responses};
pub use procedure::{PROCEDURE_REQUEST_TABLE, PROCEDURE_RESPONSE_TABLE, ProcedureRequest, ProcedureResponse};
pub use service::{
    AuthenticateResponse, AuthenticationFeature, IdentifyResponse, NegotiateResponse, Request, Response,
    ServiceCode, TimingSetup, baud_to_index, index_to_baud, read_table_response,
};
