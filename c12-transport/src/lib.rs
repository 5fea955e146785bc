//! Transport layer for ANSI C12 protocols
//!
//! This crate provides the [`Channel`] the protocol engine talks through,
//! and the transports behind it: serial port, Hayes modem, current loop,
//! TCP and UDP, plus in-memory transports for simulated meters.
//!
//! # 架构
//!
//! ```text
//! protocol engine
//!       │ read_exact / write / read_start_char (timeouts, cancellation)
//!       ▼
//!    Channel ── CircularBuffer (read-ahead, unread)
//!       │
//!       ▼
//!  TransportLayer: Serial | Modem | CurrentLoop | Tcp | Udp | Memory
//! ```

pub mod buffer;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod current_loop;
pub mod memory;
pub mod modem;
pub mod serial;
pub mod stream;
pub mod tcp;
pub mod udp;

pub use buffer::{BidirectionalBuffer, CircularBuffer};
pub use cancel::{CancelHandle, Uninterruptible, UninterruptibleGuard};
pub use channel::{Channel, ChannelState, ChannelStatistics};
pub use config::ChannelConfig;
pub use current_loop::CurrentLoopTransport;
pub use memory::{LineStation, MemoryTransport, SharedLine};
pub use modem::{ModemResponse, ModemSettings, ModemTransport};
pub use serial::{DataBits, FlowControl, Parity, SerialSettings, SerialTransport, StopBits};
pub use stream::{StreamAccessor, TransportKind, TransportLayer};
pub use tcp::{TcpSettings, TcpTransport};
pub use udp::{MAX_UDP_PAYLOAD_SIZE, UdpSettings, UdpTransport};
