//! ANSI C12 client sessions
//!
//! This crate drives a meter session on top of the lower layers: it starts
//! the session the way each dialect expects, reads and writes tables in
//! chunks that fit the link, runs procedures and ends the session again.
//!
//! # 客户端
//! - `engine`: session start, table access, procedures and session end
//! - `c1221`: C12.21 timing setup and authentication
//! - `c1222`: C12.22 APDU exchange, invocation ids and EAX security
//! - `session`: caller-facing [`Session`] with deadlines and cancellation
//! - `progress`: progress of long table transfers

mod c1221;
pub mod c1222;
pub mod engine;
pub mod progress;
pub mod session;

pub use c1222::ApduLink;
pub use engine::{Negotiated, Protocol};
pub use progress::{NoProgress, ProgressSink};
pub use session::Session;
