//! C12.22 APDU stream framing
//!
//! An APDU is `60 <ISO 8825 length> <elements>`. On streams the reader
//! finds the start byte, decodes the length and reads the elements, all
//! within one response timeout.

use c12_core::{C12Error, C12Result, to_hex};
use c12_transport::Channel;
use std::time::Duration;
use tokio::time::Instant;

/// Start byte of every C12.22 APDU
pub const APDU_START: u8 = 0x60;

/// Time allowed for the rest of an APDU whose start arrived at the deadline
const LATE_REMAINDER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Longest ISO length this reader accepts, three length octets
const MAX_LENGTH_OCTETS: usize = 3;

fn remaining(deadline: Instant) -> Instant {
    let now = Instant::now();
    if deadline <= now {
        now + LATE_REMAINDER_TIMEOUT
    } else {
        deadline
    }
}

/// Read one complete APDU, start byte and length included
///
/// `response_timeout` covers the whole APDU.
pub async fn read_apdu(channel: &mut Channel, response_timeout: Duration) -> C12Result<Vec<u8>> {
    let deadline = Instant::now() + response_timeout;
    channel.read_start_char(&[APDU_START], response_timeout).await?;

    let first = channel.read_exact_until(1, remaining(deadline)).await?[0];
    let mut apdu = vec![APDU_START, first];
    let length = if first & 0x80 == 0 {
        first as usize
    } else {
        let octets = (first & 0x7F) as usize;
        if octets == 0 || octets > MAX_LENGTH_OCTETS {
            return Err(C12Error::FrameInvalid(format!(
                "Unsupported ISO length with {} octets",
                octets
            )));
        }
        let bytes = channel.read_exact_until(octets, remaining(deadline)).await?;
        apdu.extend_from_slice(&bytes);
        bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
    };
    if length > 0 {
        let elements = channel.read_exact_until(length, remaining(deadline)).await?;
        apdu.extend_from_slice(&elements);
    }
    log::trace!("APDU RX {}", to_hex(&apdu));
    Ok(apdu)
}

/// Write one complete APDU after the turnaround delay
pub async fn write_apdu(
    channel: &mut Channel,
    apdu: &[u8],
    turnaround: Duration,
    timeout: Duration,
) -> C12Result<()> {
    if !turnaround.is_zero() {
        channel.sleep(turnaround).await?;
    }
    log::trace!("APDU TX {}", to_hex(apdu));
    channel.write(apdu, timeout).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use c12_transport::MemoryTransport;

    async fn pair() -> (Channel, Channel) {
        let (a, b) = MemoryTransport::pair();
        let mut client = Channel::new(Box::new(a));
        let mut meter = Channel::new(Box::new(b));
        client.open().await.unwrap();
        meter.open().await.unwrap();
        (client, meter)
    }

    #[tokio::test]
    async fn test_read_short_form_apdu_after_garbage() {
        let (mut client, mut meter) = pair().await;
        meter
            .write(&[0x00, 0xFF, 0x60, 0x03, 0xA8, 0x01, 0x05], Duration::from_secs(1))
            .await
            .unwrap();
        let apdu = read_apdu(&mut client, Duration::from_secs(5)).await.unwrap();
        assert_eq!(apdu, vec![0x60, 0x03, 0xA8, 0x01, 0x05]);
    }

    #[tokio::test]
    async fn test_read_long_form_apdu() {
        let (mut client, mut meter) = pair().await;
        let mut bytes = vec![0x60, 0x81, 0x90];
        bytes.extend(std::iter::repeat_n(0x11, 0x90));
        meter.write(&bytes, Duration::from_secs(1)).await.unwrap();
        let apdu = read_apdu(&mut client, Duration::from_secs(5)).await.unwrap();
        assert_eq!(apdu, bytes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_apdu_times_out() {
        let (mut client, mut meter) = pair().await;
        meter.write(&[0x60, 0x05, 0xA8], Duration::from_secs(1)).await.unwrap();
        let result = read_apdu(&mut client, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout { .. })));
    }

    #[tokio::test]
    async fn test_four_length_octets_rejected() {
        let (mut client, mut meter) = pair().await;
        meter.write(&[0x60, 0x84, 0, 0, 0, 1], Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            read_apdu(&mut client, Duration::from_secs(5)).await,
            Err(C12Error::FrameInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_write_apdu() {
        let (mut client, mut meter) = pair().await;
        write_apdu(&mut client, &[0x60, 0x00], Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            meter.read_exact(2, Duration::from_secs(1)).await.unwrap(),
            vec![0x60, 0x00]
        );
    }
}
