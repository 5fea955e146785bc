//! Hayes modem transport
//!
//! A modem is a serial port that has to dial before the meter can be
//! reached. Opening the transport opens the port, sends the init string,
//! dials and waits for `CONNECT`. Commands and responses go through the
//! inner transport, so tests can drive the dial sequence over a
//! [`MemoryTransport`](crate::memory::MemoryTransport).

use crate::serial::{FlowControl, SerialSettings, SerialTransport};
use crate::stream::{StreamAccessor, TransportKind, TransportLayer};
use async_trait::async_trait;
use c12_core::{C12Error, C12Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

const LINE_COMPLETE: u8 = b'\r';
const CONNECT_SETTLE_TIME: Duration = Duration::from_millis(200);
const INPUT_DRAIN_TIME: Duration = Duration::from_millis(20);

/// Modem response codes, in the order they are recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemResponse {
    Connect,
    NoCarrier,
    Error,
    NoDialTone,
    Busy,
    NoAnswer,
    Ok,
    Ring,
}

impl ModemResponse {
    const KEYWORDS: [(&'static str, ModemResponse); 8] = [
        ("CONNECT", ModemResponse::Connect),
        ("NO CARRIER", ModemResponse::NoCarrier),
        ("ERROR", ModemResponse::Error),
        ("NO DIAL", ModemResponse::NoDialTone),
        ("BUSY", ModemResponse::Busy),
        ("NO ANSWER", ModemResponse::NoAnswer),
        ("OK", ModemResponse::Ok),
        ("RING", ModemResponse::Ring),
    ];

    /// Recognize a response in the text received so far
    ///
    /// A keyword counts only at the start of the text or after a blank.
    pub fn recognize(text: &str) -> Option<ModemResponse> {
        Self::KEYWORDS.iter().find_map(|(keyword, response)| {
            text.match_indices(keyword)
                .any(|(pos, _)| pos == 0 || text.as_bytes()[pos - 1].is_ascii_whitespace())
                .then_some(*response)
        })
    }
}

/// Modem settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemSettings {
    pub serial: SerialSettings,
    pub init_string: String,
    pub dial_prefix: String,
    pub phone_number: String,
    pub dial_timeout: Duration,
    pub command_timeout: Duration,
    /// How many times a BUSY line is redialed
    pub busy_retries: u32,
    pub busy_retry_delay: Duration,
    /// Switch the port to the speed reported in `CONNECT <baud>`
    pub match_connect_baud: bool,
}

impl ModemSettings {
    pub fn new(serial: SerialSettings, phone_number: impl Into<String>) -> Self {
        Self {
            serial: SerialSettings {
                flow_control: FlowControl::Hardware,
                ..serial
            },
            init_string: "ATZE0Q0V1&C1&D2".to_string(),
            dial_prefix: "ATD".to_string(),
            phone_number: phone_number.into(),
            dial_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(10),
            busy_retries: 0,
            busy_retry_delay: Duration::from_secs(5),
            match_connect_baud: false,
        }
    }

    pub fn with_busy_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.busy_retries = retries;
        self.busy_retry_delay = delay;
        self
    }
}

/// Modem transport layer implementation
#[derive(Debug)]
pub struct ModemTransport<T: TransportLayer = SerialTransport> {
    inner: T,
    settings: ModemSettings,
    last_response: String,
}

impl ModemTransport<SerialTransport> {
    pub fn new(settings: ModemSettings) -> Self {
        let port = SerialTransport::new(settings.serial.clone());
        Self::with_transport(port, settings)
    }
}

impl<T: TransportLayer> ModemTransport<T> {
    /// Dial through an already constructed port
    pub fn with_transport(inner: T, settings: ModemSettings) -> Self {
        Self {
            inner,
            settings,
            last_response: String::new(),
        }
    }

    pub fn settings(&self) -> &ModemSettings {
        &self.settings
    }

    /// Text of the last modem response
    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    async fn drain_input(&mut self) -> C12Result<()> {
        let mut buf = [0u8; 128];
        while let Ok(result) = tokio::time::timeout(INPUT_DRAIN_TIME, self.inner.read(&mut buf)).await {
            if result? == 0 {
                return Err(C12Error::ChannelDisconnectedUnexpectedly);
            }
        }
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> C12Result<()> {
        self.drain_input().await?;
        let mut line = command.as_bytes().to_vec();
        line.push(LINE_COMPLETE);
        log::debug!("Modem command {}", command);
        self.inner.write_all(&line).await?;
        self.inner.flush().await
    }

    async fn receive_response(&mut self, timeout: Duration) -> C12Result<ModemResponse> {
        let deadline = Instant::now() + timeout;
        let mut response = String::new();
        let mut buf = [0u8; 128];
        loop {
            let n = match tokio::time::timeout_at(deadline, self.inner.read(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => break,
            };
            if n == 0 {
                return Err(C12Error::ChannelDisconnectedUnexpectedly);
            }
            response.extend(
                buf[..n]
                    .iter()
                    .map(|&c| if (b' '..=b'~').contains(&c) || c == b'\r' || c == b'\n' { c as char } else { ' ' }),
            );
            let trimmed = response.trim();
            if let Some(code) = ModemResponse::recognize(trimmed) {
                self.last_response = trimmed.replace(['\r', '\n'], " ");
                log::debug!("Modem response {:?}: {}", code, self.last_response);
                return Ok(code);
            }
            // keep only the last incomplete line
            if let Some(pos) = response.rfind(['\r', '\n']) {
                response.drain(..pos);
            }
        }
        Err(C12Error::ModemResponse(if response.trim().is_empty() {
            "Modem did not respond".to_string()
        } else {
            format!("Unknown modem response '{}'", response.trim())
        }))
    }

    async fn send_command_check_ok(&mut self, command: &str) -> C12Result<()> {
        self.send_command(command).await?;
        match self.receive_response(self.settings.command_timeout).await? {
            ModemResponse::Ok => Ok(()),
            other => Err(response_error(other, &self.last_response)),
        }
    }

    async fn adjust_after_connect(&mut self) -> C12Result<()> {
        if self.settings.match_connect_baud {
            let digits: String = self
                .last_response
                .split("CONNECT")
                .nth(1)
                .unwrap_or_default()
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(baud) = digits.parse::<u32>() {
                if let Err(e) = self.inner.set_baud_rate(baud).await {
                    log::warn!("Could not match connect speed {}: {}", baud, e);
                }
            }
        }
        tokio::time::sleep(CONNECT_SETTLE_TIME).await;
        self.drain_input().await
    }

    async fn dial(&mut self) -> C12Result<()> {
        if self.settings.phone_number.is_empty() {
            return Err(C12Error::InvalidData("No phone number specified".to_string()));
        }
        let init = self.settings.init_string.clone();
        let dial = format!("{}{}", self.settings.dial_prefix, self.settings.phone_number);
        let mut busy_count = 0;
        loop {
            self.send_command_check_ok(&init).await?;
            self.send_command(&dial).await?;
            match self.receive_response(self.settings.dial_timeout).await? {
                ModemResponse::Connect => return self.adjust_after_connect().await,
                ModemResponse::Busy if busy_count < self.settings.busy_retries => {
                    busy_count += 1;
                    log::debug!(
                        "Line busy, redial {} of {}",
                        busy_count,
                        self.settings.busy_retries
                    );
                    tokio::time::sleep(self.settings.busy_retry_delay).await;
                }
                other => return Err(response_error(other, &self.last_response)),
            }
        }
    }
}

fn response_error(response: ModemResponse, text: &str) -> C12Error {
    match response {
        ModemResponse::Ring => C12Error::CollisionDetected,
        ModemResponse::Busy => C12Error::ModemResponse("Line is busy".to_string()),
        ModemResponse::NoDialTone => C12Error::ModemResponse("No dial tone".to_string()),
        ModemResponse::NoAnswer => C12Error::ModemResponse("No answer".to_string()),
        ModemResponse::NoCarrier => C12Error::ModemResponse("No carrier".to_string()),
        ModemResponse::Error => C12Error::ModemResponse(format!("Modem responded with error: {}", text)),
        ModemResponse::Connect | ModemResponse::Ok => {
            C12Error::ModemResponse(format!("Unexpected modem response: {}", text))
        }
    }
}

#[async_trait]
impl<T: TransportLayer> TransportLayer for ModemTransport<T> {
    async fn open(&mut self) -> C12Result<()> {
        self.last_response.clear();
        self.inner.open().await?;
        if let Err(e) = self.dial().await {
            // dropping the port lowers DTR, which hangs the modem up
            let _ = self.inner.close().await;
            return Err(e);
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Modem
    }

    fn echoes_written_bytes(&self) -> bool {
        self.inner.echoes_written_bytes()
    }

    async fn set_baud_rate(&mut self, baud: u32) -> C12Result<()> {
        self.inner.set_baud_rate(baud).await
    }

    fn baud_rate(&self) -> Option<u32> {
        self.inner.baud_rate()
    }
}

#[async_trait]
impl<T: TransportLayer> StreamAccessor for ModemTransport<T> {
    async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize> {
        self.inner.read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> C12Result<usize> {
        self.inner.write(buf).await
    }

    async fn flush(&mut self) -> C12Result<()> {
        self.inner.flush().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn close(&mut self) -> C12Result<()> {
        self.inner.close().await
    }
}
