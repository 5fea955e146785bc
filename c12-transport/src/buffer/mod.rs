//! Byte buffers used to accumulate inbound data and assemble outbound frames

pub mod bidirectional;
pub mod circular;

pub use bidirectional::BidirectionalBuffer;
pub use circular::CircularBuffer;
