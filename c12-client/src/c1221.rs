//! C12.21 session start: feature identify, timing setup and authenticate

use crate::engine::Protocol;
use c12_application::iso8825::Reader;
use c12_application::service::{AuthenticateResponse, Request, TimingSetup};
use c12_core::{C12Error, C12Result, NokCode};
use c12_security::{AES_BLOCK_SIZE, AesBlock, DES_BLOCK_SIZE, LegacyDes, SecretKey};
use c12_session::SessionState;
use std::time::Duration;

/// Keep the configured value where the meter returned zero
fn adopted(returned: Duration, configured: Duration) -> Duration {
    if returned.is_zero() { configured } else { returned }
}

impl Protocol {
    pub(crate) async fn start_c1221(&mut self) -> C12Result<()> {
        self.identify(true).await?;
        if self.config.c1221.issue_timing_setup {
            self.timing_setup().await?;
        }
        if self.config.issue_negotiate {
            self.negotiate(false).await?;
        }
        self.logon().await?;
        if self.config.c1221.enable_authentication {
            self.authenticate().await?;
        } else if self.config.issue_security {
            self.security().await?;
        }
        self.set_state(SessionState::SessionActive)
    }

    /// Propose the configured link timing and adopt what the meter returns
    ///
    /// Meters answer zero for values they do not change, and some return
    /// zero retries; both keep the configured values.
    async fn timing_setup(&mut self) -> C12Result<()> {
        let params = self.packet_link()?.parameters().clone();
        let proposed = TimingSetup::from_durations(
            params.channel_traffic_timeout,
            params.intercharacter_timeout,
            params.acknowledgement_timeout,
            params.retries,
        );
        let parameters = match self.transact(&Request::timing_setup(&proposed)).await {
            Ok(parameters) => parameters,
            Err(e) => {
                self.packet_link()?.forget_receive_toggle();
                return Err(e);
            }
        };
        let agreed = TimingSetup::parse(&mut Reader::new(&parameters))?;
        let retries = if agreed.retries == 0 { params.retries } else { agreed.retries };
        log::debug!(
            "Timing setup: traffic {}s, intercharacter {}s, acknowledgement {}s, {} retries",
            agreed.channel_traffic_timeout,
            agreed.intercharacter_timeout,
            agreed.acknowledgement_timeout,
            retries
        );
        self.packet_link()?.apply_timing(
            adopted(agreed.channel_traffic(), params.channel_traffic_timeout),
            adopted(agreed.intercharacter(), params.intercharacter_timeout),
            adopted(agreed.acknowledgement(), params.acknowledgement_timeout),
            retries,
        );
        self.channel
            .set_intercharacter_timeout(adopted(agreed.intercharacter(), params.intercharacter_timeout));
        Ok(())
    }

    /// Encrypt the identify ticket with the configured key and check the
    /// meter's answer
    ///
    /// An 8 byte key selects DES, a 16 byte key AES.
    async fn authenticate(&mut self) -> C12Result<()> {
        let feature = self
            .identification
            .as_ref()
            .and_then(|identification| identification.authentication.clone())
            .filter(|feature| feature.can_authenticate)
            .ok_or_else(|| C12Error::AuthenticationFailed("Meter does not support authentication".to_string()))?;
        let key = self
            .authentication_key
            .as_ref()
            .filter(|key| !key.is_cleared())
            .ok_or_else(|| C12Error::Security("Authentication key is not available".to_string()))?;
        let key_id = self.config.c1221.authentication_key_id;

        let block_size = match key.len() {
            DES_BLOCK_SIZE => DES_BLOCK_SIZE,
            AES_BLOCK_SIZE => AES_BLOCK_SIZE,
            other => {
                return Err(C12Error::Security(format!(
                    "Authentication key of {} bytes, 8 or 16 expected",
                    other
                )));
            }
        };
        if feature.ticket.len() != block_size {
            return Err(C12Error::AuthenticationFailed(format!(
                "Ticket of {} bytes does not fit a {} byte key",
                feature.ticket.len(),
                block_size
            )));
        }
        let cipher = TicketCipher::new(key)?;
        let encrypted = cipher.encrypt(&feature.ticket)?;

        let result = self.transact(&Request::authenticate(key_id, &encrypted)).await;
        let parameters = match result {
            Ok(parameters) => parameters,
            Err(C12Error::NokResponse { code, extra }) => {
                if matches!(cipher, TicketCipher::Des(_)) {
                    self.packet_link()?.forget_receive_toggle();
                }
                return Err(if code == NokCode::Err {
                    C12Error::AuthenticationFailed("Meter rejected the authentication ticket".to_string())
                } else {
                    C12Error::NokResponse { code, extra }
                });
            }
            Err(e) => return Err(e),
        };
        let response = AuthenticateResponse::parse(&mut Reader::new(&parameters))?;
        if response.length as usize != block_size + 1 || response.key_id != key_id {
            return Err(C12Error::AuthenticationFailed(format!(
                "Authenticate response length {} key id {} does not match",
                response.length, response.key_id
            )));
        }
        if cipher.decrypt(&response.data)? != encrypted {
            return Err(C12Error::AuthenticationFailed(
                "Meter did not prove knowledge of the key".to_string(),
            ));
        }
        log::debug!("Authenticated with key {}", key_id);
        Ok(())
    }
}

/// Block cipher selected by the authentication key length
enum TicketCipher {
    Des(LegacyDes),
    Aes(AesBlock),
}

impl TicketCipher {
    fn new(key: &SecretKey) -> C12Result<Self> {
        if key.len() == DES_BLOCK_SIZE {
            Ok(Self::Des(LegacyDes::new(key)?))
        } else {
            Ok(Self::Aes(AesBlock::new(key)?))
        }
    }

    fn encrypt(&self, block: &[u8]) -> C12Result<Vec<u8>> {
        match self {
            Self::Des(des) => Ok(des.encrypt(&des_block(block)?).to_vec()),
            Self::Aes(aes) => {
                let mut data = block.to_vec();
                aes.encrypt(&mut data)?;
                Ok(data)
            }
        }
    }

    fn decrypt(&self, block: &[u8]) -> C12Result<Vec<u8>> {
        match self {
            Self::Des(des) => Ok(des.decrypt(&des_block(block)?).to_vec()),
            Self::Aes(aes) => {
                let mut data = block.to_vec();
                aes.decrypt(&mut data)?;
                Ok(data)
            }
        }
    }
}

fn des_block(bytes: &[u8]) -> C12Result<[u8; DES_BLOCK_SIZE]> {
    bytes
        .try_into()
        .map_err(|_| C12Error::AuthenticationFailed(format!("DES block of {} bytes", bytes.len())))
}
