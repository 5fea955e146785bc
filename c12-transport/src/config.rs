//! Channel configuration

use crate::current_loop::CurrentLoopTransport;
use crate::modem::{ModemSettings, ModemTransport};
use crate::serial::{SerialSettings, SerialTransport};
use crate::stream::TransportLayer;
use crate::tcp::{TcpSettings, TcpTransport};
use crate::udp::{UdpSettings, UdpTransport};
use serde::{Deserialize, Serialize};

/// Which medium to reach the meter over, with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelConfig {
    Serial(SerialSettings),
    Modem(ModemSettings),
    CurrentLoop(SerialSettings),
    Tcp(TcpSettings),
    Udp(UdpSettings),
}

impl ChannelConfig {
    /// Build the (not yet opened) transport
    pub fn into_transport(self) -> Box<dyn TransportLayer> {
        match self {
            ChannelConfig::Serial(settings) => Box::new(SerialTransport::new(settings)),
            ChannelConfig::Modem(settings) => Box::new(ModemTransport::new(settings)),
            ChannelConfig::CurrentLoop(settings) => Box::new(CurrentLoopTransport::new(settings)),
            ChannelConfig::Tcp(settings) => Box::new(TcpTransport::new(settings)),
            ChannelConfig::Udp(settings) => Box::new(UdpTransport::new(settings)),
        }
    }

    /// Serial line speed, for media that have one
    pub fn baud_rate(&self) -> Option<u32> {
        match self {
            ChannelConfig::Serial(settings) | ChannelConfig::CurrentLoop(settings) => {
                Some(settings.baud_rate)
            }
            ChannelConfig::Modem(settings) => Some(settings.serial.baud_rate),
            ChannelConfig::Tcp(_) | ChannelConfig::Udp(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TransportKind;

    #[test]
    fn test_into_transport_kind() {
        let serial = SerialSettings::new("/dev/ttyUSB0", 9600);
        let cases = [
            (ChannelConfig::Serial(serial.clone()), TransportKind::Serial, false),
            (ChannelConfig::CurrentLoop(serial.clone()), TransportKind::CurrentLoop, true),
            (
                ChannelConfig::Modem(ModemSettings::new(serial, "5551234")),
                TransportKind::Modem,
                false,
            ),
            (ChannelConfig::Tcp(TcpSettings::new("127.0.0.1:1153")), TransportKind::Tcp, false),
            (ChannelConfig::Udp(UdpSettings::new("127.0.0.1:1153")), TransportKind::Udp, false),
        ];
        for (config, kind, echoes) in cases {
            let transport = config.into_transport();
            assert_eq!(transport.kind(), kind);
            assert_eq!(transport.echoes_written_bytes(), echoes);
            assert!(transport.is_closed());
        }
    }

    #[test]
    fn test_baud_rate() {
        let serial = SerialSettings::new("COM1", 1200);
        assert_eq!(ChannelConfig::Serial(serial).baud_rate(), Some(1200));
        assert_eq!(ChannelConfig::Tcp(TcpSettings::new("meter:1153")).baud_rate(), None);
    }
}
