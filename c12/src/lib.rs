//! c12 - Rust implementation of the ANSI C12 meter protocols
//!
//! This library talks to electricity meters over the ANSI C12.18 optical
//! port protocol, the C12.21 modem protocol and the C12.22 network
//! protocol, and reads and writes their C12.19 tables.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `c12-core`: Error taxonomy, table model, dialects and configuration
//! - `c12-transport`: Channel and transports (Serial, Modem, Current loop, TCP, UDP)
//! - `c12-security`: AES EAX', AES and DES block modes, security context
//! - `c12-session`: C12.18/C12.21 packet link, C12.22 APDU framing, session states
//! - `c12-application`: PSEM services, C12.22 ACSE/EPSEM, procedures
//! - `c12-client`: Protocol engine and caller-facing sessions
//!
//! # 实现状态
//!
//! ## ✅ 已完成
//! - C12.18 会话（Identify、Negotiate、Logon、Security、Logoff、Terminate）
//! - C12.21 扩展（Timing Setup、DES/AES Authenticate）
//! - C12.22 APDU（ACSE、EPSEM、EAX' 加密和认证）
//! - 表读写（自动分块、校验和）
//! - 过程调用（表 7/8）
//! - 传输层（Serial、Modem、电流环、TCP、UDP）
//!
//! # Usage
//!
//! ```no_run
//! use c12::client::Session;
//! use c12::transport::{ChannelConfig, TcpSettings};
//! use c12::{Dialect, ProtocolConfig, TableDescriptor};
//! use std::time::Duration;
//!
//! # async fn example() -> c12::C12Result<()> {
//! let mut config = ProtocolConfig::default();
//! config.c1222.called_ap_title = ".2.16.124.113620.1.22.0".to_string();
//! config.c1222.calling_ap_title = ".2.16.124.113620.1.22.1".to_string();
//!
//! let channel = ChannelConfig::Tcp(TcpSettings::new("192.168.1.20:1153"));
//! let session = Session::connect(channel, Dialect::C1222, config).await?;
//! let table = session.read_table(&TableDescriptor::full(1), Duration::from_secs(30)).await?;
//! println!("{:?}", table.data);
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

// Re-export core types
pub use c12_core::{
    C1221Options, C1222Options, C12Error, C12Result, Dialect, DialectCapabilities, FailureDisposition, NokCode,
    ProcedureResult, ProtocolConfig, ResponseControl, SecurityMode, TableAccess, TableDescriptor, TableRawData,
    table_checksum,
};

// Re-export client API
pub mod client {
    pub use c12_client::*;
}

pub mod transport {
    pub use c12_transport::*;
}

pub mod session {
    pub use c12_session::*;
}

pub mod security {
    pub use c12_security::*;
}

pub mod application {
    pub use c12_application::*;
}
