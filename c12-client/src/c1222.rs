//! C12.22 APDU link
//!
//! Wraps PSEM services into ACSE APDUs, secures them when configured, and
//! checks that every response answers the request that was sent.

use c12_application::acse::{AcseParameters, CallingAuthentication, IncomingApdu, OutgoingApdu, Seal};
use c12_application::service::{Request, Response};
use c12_application::split_responses;
use c12_core::{C1222Options, C12Error, C12Result, ProtocolConfig, ResponseControl};
use c12_security::{Clock, SecretKey, SecurityContext};
use c12_session::{read_apdu, write_apdu};
use c12_transport::{Channel, TransportKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use zeroize::Zeroize;

/// Room for the ACSE envelope around the EPSEM of a full APDU
pub const APDU_ENVELOPE_OVERHEAD: usize = 128;

/// Synthesized response when the meter is not expected to answer
const IMPLIED_OK: u8 = 0x00;

fn is_resendable(error: &C12Error) -> bool {
    matches!(
        error,
        C12Error::ChannelReadTimeout { .. } | C12Error::ChannelWriteTimeout { .. } | C12Error::FrameInvalid(_)
    )
}

/// APDU exchange state of one C12.22 session
pub struct ApduLink {
    params: AcseParameters,
    options: C1222Options,
    security: Option<SecurityContext>,
    calling_ap_invocation_id: u32,
    /// Key id and IV announced in this session, none before the first secured APDU
    authentication: Option<CallingAuthentication>,
    /// Key id and IV last received from the meter
    incoming_authentication: CallingAuthentication,
    /// Security service prepended to every sessionless request
    sessionless_security: Option<Vec<u8>>,
    link_retries: u8,
    turnaround_delay: Duration,
    write_timeout: Duration,
    rng: StdRng,
}

impl std::fmt::Debug for ApduLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApduLink")
            .field("params", &self.params)
            .field("calling_ap_invocation_id", &self.calling_ap_invocation_id)
            .field("security", &self.security)
            .finish()
    }
}

impl ApduLink {
    pub fn new(config: &ProtocolConfig, clock: Arc<dyn Clock>) -> C12Result<Self> {
        let mut options = config.c1222.clone();
        let security = if options.security_mode.is_secure() {
            let key = SecretKey::aes128(&options.security_key)?;
            let mut context = SecurityContext::new(key, options.security_key_id, clock)?;
            if let Some(iv) = options.initialization_vector {
                context.set_initialization_vector(iv);
            }
            Some(context)
        } else {
            None
        };
        // the security context holds the only live copy
        options.security_key.zeroize();
        let sessionless_security = (options.sessionless && config.issue_security)
            .then(|| Request::security_with_user_id(&config.padded_password(), config.user_id).encode());
        let mut rng = StdRng::from_entropy();
        let calling_ap_invocation_id = rng.gen_range(1..=u32::MAX);
        Ok(Self {
            params: AcseParameters::from_options(&options),
            options,
            security,
            calling_ap_invocation_id,
            authentication: None,
            incoming_authentication: CallingAuthentication::default(),
            sessionless_security,
            link_retries: config.link_layer_retries,
            turnaround_delay: config.turnaround_delay,
            write_timeout: config.channel_traffic_timeout,
            rng,
        })
    }

    pub fn parameters(&self) -> &AcseParameters {
        &self.params
    }

    pub fn options(&self) -> &C1222Options {
        &self.options
    }

    pub fn calling_ap_invocation_id(&self) -> u32 {
        self.calling_ap_invocation_id
    }

    pub fn security(&self) -> Option<&SecurityContext> {
        self.security.as_ref()
    }

    /// Largest EPSEM payload a response may carry
    pub fn max_response_size(&self) -> usize {
        (self.params.max_apdu_size_incoming as usize)
            .saturating_sub(APDU_ENVELOPE_OVERHEAD)
            .min(u16::MAX as usize)
    }

    pub fn max_request_size(&self) -> usize {
        (self.params.max_apdu_size_outgoing as usize)
            .saturating_sub(APDU_ENVELOPE_OVERHEAD)
            .min(u16::MAX as usize)
    }

    fn renew_invocation_id(&mut self) {
        loop {
            let candidate = self.rng.gen_range(1..=u32::MAX);
            if candidate != self.calling_ap_invocation_id {
                self.calling_ap_invocation_id = candidate;
                return;
            }
        }
    }

    fn advance_invocation_id(&mut self) {
        if self.options.sessionless {
            self.renew_invocation_id();
        } else {
            self.calling_ap_invocation_id = self.calling_ap_invocation_id.wrapping_add(1);
        }
    }

    /// Forget everything exchanged in a previous session
    pub fn begin_session(&mut self) {
        self.renew_invocation_id();
        self.authentication = None;
        self.incoming_authentication = CallingAuthentication::default();
    }

    /// Invocation ids restart at zero once logon succeeded
    pub fn after_logon(&mut self) {
        if !self.options.sessionless {
            self.calling_ap_invocation_id = 0;
        }
    }

    /// Wipe the key, the link cannot secure APDUs afterwards
    pub fn end_session(&mut self) {
        if let Some(security) = self.security.as_mut() {
            security.clear();
        }
        self.authentication = None;
    }

    fn build(&mut self, apdu: &OutgoingApdu) -> C12Result<Vec<u8>> {
        let security = match self.security.as_mut() {
            Some(security) if self.params.security_mode.is_secure() => security,
            _ => return apdu.build(&self.params, None),
        };
        if security.is_cleared() {
            return Err(C12Error::Security("Security context was cleared".to_string()));
        }
        let send_authentication_value = self.authentication.is_none();
        let authentication = match self.authentication {
            Some(authentication) => authentication,
            None => {
                let iv = security.next_initialization_vector()?;
                let authentication = CallingAuthentication::new(security.key_id(), iv);
                self.authentication = Some(authentication);
                authentication
            }
        };
        let seal = Seal {
            eax: security.eax(),
            authentication,
            send_authentication_value,
        };
        apdu.build(&self.params, Some(seal))
    }

    /// Receive the response to the current request
    ///
    /// Responses to earlier requests are dropped and the wait goes on
    /// until the response timeout.
    async fn receive(&self, channel: &mut Channel) -> C12Result<IncomingApdu> {
        let deadline = Instant::now() + self.options.response_timeout;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return Err(C12Error::ChannelReadTimeout { bytes_read: 0 });
            }
            let bytes = read_apdu(channel, timeout).await?;
            let incoming = IncomingApdu::parse(&bytes, self.params.max_apdu_size_incoming)?;
            if incoming.is_stale(self.calling_ap_invocation_id) {
                log::debug!(
                    "Skipping a late response to invocation {:?}, waiting for {}",
                    incoming.called_ap_invocation_id,
                    self.calling_ap_invocation_id
                );
                continue;
            }
            incoming.verify_response(&self.params, self.calling_ap_invocation_id)?;
            return Ok(incoming);
        }
    }

    fn open(&mut self, mut incoming: IncomingApdu) -> C12Result<Vec<u8>> {
        if let Some(authentication) = incoming.authentication {
            if let Some(security) = &self.security {
                if authentication.key_id != security.key_id() {
                    return Err(C12Error::Protocol(
                        "Key ID returned by device is different from current key ID".to_string(),
                    ));
                }
            }
            self.incoming_authentication = authentication;
        }
        if self.params.security_mode.is_secure() && incoming.has_epsem() && !incoming.security_mode().is_secure() {
            return Err(C12Error::AuthenticationFailed(
                "Secured request was answered in cleartext".to_string(),
            ));
        }
        let eax = self.security.as_ref().map(|security| security.eax());
        incoming.open(eax, self.incoming_authentication)
    }

    /// Send services in one APDU and return their responses
    ///
    /// On UDP a lost or damaged response makes the same APDU go out again,
    /// up to the link layer retry count.
    pub async fn exchange(&mut self, channel: &mut Channel, services: Vec<Vec<u8>>) -> C12Result<Vec<Vec<u8>>> {
        let sessionless = self.options.sessionless;
        if sessionless {
            self.authentication = None;
            if self.params.response_control != ResponseControl::Always {
                self.renew_invocation_id();
            }
        }
        let mut apdu = OutgoingApdu::new(self.calling_ap_invocation_id);
        let with_security = sessionless && self.sessionless_security.is_some();
        if let Some(security) = self.sessionless_security.as_ref().filter(|_| sessionless) {
            apdu.push_service(security.clone());
        }
        let count = services.len();
        for service in services {
            apdu.push_service(service);
        }
        let bytes = self.build(&apdu)?;

        let response_control = self.params.response_control;
        let turnaround = if response_control == ResponseControl::Never {
            Duration::ZERO
        } else {
            self.turnaround_delay
        };
        write_apdu(channel, &bytes, turnaround, self.write_timeout).await?;
        if response_control == ResponseControl::Never {
            self.advance_invocation_id();
            return Ok(vec![vec![IMPLIED_OK]; count]);
        }

        let mut retries = if channel.kind() == TransportKind::Udp {
            self.link_retries
        } else {
            0
        };
        let incoming = loop {
            match self.receive(channel).await {
                Ok(incoming) => break incoming,
                Err(C12Error::ChannelReadTimeout { bytes_read: 0 })
                    if response_control == ResponseControl::OnException && !channel.operation_deadline_expired() =>
                {
                    self.advance_invocation_id();
                    return Ok(vec![vec![IMPLIED_OK]; count]);
                }
                Err(e) if retries > 0 && is_resendable(&e) && !channel.operation_deadline_expired() => {
                    retries -= 1;
                    log::debug!("Retrying APDU after ignoring error {}", e);
                    write_apdu(channel, &bytes, turnaround, self.write_timeout).await?;
                }
                Err(e) => return Err(e),
            }
        };
        self.advance_invocation_id();

        let epsem = self.open(incoming)?;
        let mut responses = split_responses(&epsem)?;
        if with_security {
            if responses.is_empty() {
                return Err(C12Error::Protocol("Security service got no response".to_string()));
            }
            let security = responses.remove(0);
            Response::new(&security).check_code()?;
        }
        Ok(responses)
    }

    /// One service, one response
    pub async fn request(&mut self, channel: &mut Channel, request: &[u8]) -> C12Result<Vec<u8>> {
        self.exchange(channel, vec![request.to_vec()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| C12Error::Protocol("Meter returned no service response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use c12_application::epsem::encode_services;
    use c12_core::{NokCode, SecurityMode};
    use c12_security::{AesEax, FixedClock, MAC_SIZE};
    use c12_transport::MemoryTransport;

    const KEY: [u8; 16] = [0x11; 16];

    async fn pair() -> (Channel, Channel) {
        let (a, b) = MemoryTransport::pair();
        let mut client = Channel::new(Box::new(a));
        let mut meter = Channel::new(Box::new(b));
        client.open().await.unwrap();
        meter.open().await.unwrap();
        (client, meter)
    }

    fn config(mode: SecurityMode) -> ProtocolConfig {
        let mut config = ProtocolConfig {
            turnaround_delay: Duration::ZERO,
            ..ProtocolConfig::default()
        };
        config.c1222.called_ap_title = ".2.5".to_string();
        config.c1222.calling_ap_title = ".9.1".to_string();
        config.c1222.security_mode = mode;
        config.c1222.security_key = KEY.to_vec();
        config.c1222.security_key_id = 1;
        config.c1222.response_timeout = Duration::from_secs(5);
        config
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::new(1_700_000_000))
    }

    /// Far end answering requests with fixed service responses
    struct Meter {
        channel: Channel,
        params: AcseParameters,
        eax: AesEax,
        authentication: CallingAuthentication,
        /// Flip a byte before the MAC of the next answer
        tamper: bool,
    }

    impl Meter {
        fn new(channel: Channel, config: &ProtocolConfig) -> Self {
            Self {
                channel,
                params: AcseParameters::from_options(&config.c1222).swapped(),
                eax: AesEax::new(&SecretKey::aes128(&KEY).unwrap()).unwrap(),
                authentication: CallingAuthentication::default(),
                tamper: false,
            }
        }

        /// Returns the received EPSEM and whether it carried the AC element
        async fn answer(&mut self, responses: &[&[u8]]) -> (Vec<u8>, bool) {
            let bytes = read_apdu(&mut self.channel, Duration::from_secs(5)).await.unwrap();
            let mut request = IncomingApdu::parse(&bytes, 0x7FFF).unwrap();
            let with_authentication = request.authentication.is_some();
            if let Some(authentication) = request.authentication {
                self.authentication = authentication;
            }
            let services = request.open(Some(&self.eax), self.authentication).unwrap();

            let mut response = OutgoingApdu::new(500);
            response.called_ap_invocation_id = request.calling_ap_invocation_id;
            for r in responses {
                response.push_service(r.to_vec());
            }
            let seal = Seal {
                eax: &self.eax,
                authentication: self.authentication,
                send_authentication_value: true,
            };
            let mut reply = response.build(&self.params, Some(seal)).unwrap();
            if self.tamper {
                let last = reply.len() - MAC_SIZE - 1;
                reply[last] ^= 0xFF;
            }
            self.channel.write(&reply, Duration::from_secs(1)).await.unwrap();
            (services, with_authentication)
        }
    }

    #[tokio::test]
    async fn test_clear_exchange_and_invocation_ids() {
        let (mut client, meter) = pair().await;
        let config = config(SecurityMode::ClearText);
        let mut link = ApduLink::new(&config, clock()).unwrap();
        link.after_logon();
        assert_eq!(link.calling_ap_invocation_id(), 0);

        let mut meter = Meter::new(meter, &config);
        let meter_task = tokio::spawn(async move {
            let (first, _) = meter.answer(&[&[0x00, 0x00, 0x01, 0x07, 0xF9]]).await;
            let (second, _) = meter.answer(&[&[0x00]]).await;
            (first, second)
        });
        let response = link.request(&mut client, &[0x30, 0x00, 0x01]).await.unwrap();
        assert_eq!(response, vec![0x00, 0x00, 0x01, 0x07, 0xF9]);
        assert_eq!(link.calling_ap_invocation_id(), 1);
        link.request(&mut client, &[0x52]).await.unwrap();
        assert_eq!(link.calling_ap_invocation_id(), 2);

        let (first, second) = meter_task.await.unwrap();
        assert_eq!(first, encode_services(None, [&[0x30u8, 0x00, 0x01][..]]).unwrap().to_vec());
        assert_eq!(second, vec![0x01, 0x52]);
    }

    #[tokio::test]
    async fn test_ciphered_exchange_sends_iv_once() {
        let (mut client, meter) = pair().await;
        let config = config(SecurityMode::CipherTextWithAuthentication);
        let mut link = ApduLink::new(&config, clock()).unwrap();

        let mut meter = Meter::new(meter, &config);
        let meter_task = tokio::spawn(async move {
            let (_, first) = meter.answer(&[&[0x00, 0x01]]).await;
            let (_, second) = meter.answer(&[&[0x00, 0x02]]).await;
            (first, second)
        });
        assert_eq!(link.request(&mut client, &[0x30, 0x00, 0x00]).await.unwrap(), vec![0x00, 0x01]);
        assert_eq!(link.request(&mut client, &[0x30, 0x00, 0x01]).await.unwrap(), vec![0x00, 0x02]);
        assert_eq!(meter_task.await.unwrap(), (true, false));
        assert_eq!(
            link.security().unwrap().last_initialization_vector(),
            Some(1_700_000_000)
        );
    }

    #[tokio::test]
    async fn test_tampered_response_rejected() {
        let (mut client, meter) = pair().await;
        let config = config(SecurityMode::ClearTextWithAuthentication);
        let mut link = ApduLink::new(&config, clock()).unwrap();

        let mut meter = Meter::new(meter, &config);
        meter.tamper = true;
        tokio::spawn(async move {
            meter.answer(&[&[0x00, 0x42]]).await;
        });
        assert!(matches!(
            link.request(&mut client, &[0x30, 0x00, 0x00]).await,
            Err(C12Error::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_late_response_to_earlier_request_skipped() {
        let (mut client, mut meter) = pair().await;
        let config = config(SecurityMode::ClearText);
        let mut link = ApduLink::new(&config, clock()).unwrap();

        tokio::spawn(async move {
            let bytes = read_apdu(&mut meter, Duration::from_secs(5)).await.unwrap();
            let request = IncomingApdu::parse(&bytes, 0x7FFF).unwrap();
            let params = AcseParameters::from_options(&config.c1222).swapped();
            let mut late = OutgoingApdu::new(499);
            late.called_ap_invocation_id = Some(0xDEAD);
            late.push_service(vec![0x00, 0x99]);
            meter.write(&late.build(&params, None).unwrap(), Duration::from_secs(1)).await.unwrap();
            let mut response = OutgoingApdu::new(500);
            response.called_ap_invocation_id = request.calling_ap_invocation_id;
            response.push_service(vec![0x00, 0x42]);
            meter.write(&response.build(&params, None).unwrap(), Duration::from_secs(1)).await.unwrap();
        });
        assert_eq!(link.request(&mut client, &[0x20]).await.unwrap(), vec![0x00, 0x42]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_late_responses_time_out() {
        let (mut client, mut meter) = pair().await;
        let config = config(SecurityMode::ClearText);
        let mut link = ApduLink::new(&config, clock()).unwrap();

        let far_end = tokio::spawn(async move {
            read_apdu(&mut meter, Duration::from_secs(5)).await.unwrap();
            let params = AcseParameters::from_options(&config.c1222).swapped();
            let mut late = OutgoingApdu::new(499);
            late.called_ap_invocation_id = Some(0xDEAD);
            late.push_service(vec![0x00]);
            meter.write(&late.build(&params, None).unwrap(), Duration::from_secs(1)).await.unwrap();
            meter
        });
        assert!(matches!(
            link.request(&mut client, &[0x20]).await,
            Err(C12Error::ChannelReadTimeout { .. })
        ));
        drop(far_end.await.unwrap());
    }

    #[tokio::test]
    async fn test_response_without_invocation_id_rejected() {
        let (mut client, mut meter) = pair().await;
        let config = config(SecurityMode::ClearText);
        let mut link = ApduLink::new(&config, clock()).unwrap();

        tokio::spawn(async move {
            read_apdu(&mut meter, Duration::from_secs(5)).await.unwrap();
            let params = AcseParameters::from_options(&config.c1222).swapped();
            let mut response = OutgoingApdu::new(500);
            response.called_ap_invocation_id = None;
            response.push_service(vec![0x00]);
            meter.write(&response.build(&params, None).unwrap(), Duration::from_secs(1)).await.unwrap();
        });
        assert!(matches!(
            link.request(&mut client, &[0x20]).await,
            Err(C12Error::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_cleartext_answer_to_secured_request_rejected() {
        let (mut client, mut meter) = pair().await;
        let config = config(SecurityMode::CipherTextWithAuthentication);
        let mut link = ApduLink::new(&config, clock()).unwrap();

        tokio::spawn(async move {
            let bytes = read_apdu(&mut meter, Duration::from_secs(5)).await.unwrap();
            let request = IncomingApdu::parse(&bytes, 0x7FFF).unwrap();
            let mut params = AcseParameters::from_options(&config.c1222).swapped();
            params.security_mode = SecurityMode::ClearText;
            let mut response = OutgoingApdu::new(500);
            response.called_ap_invocation_id = request.calling_ap_invocation_id;
            response.push_service(vec![0x00]);
            let reply = response.build(&params, None).unwrap();
            meter.write(&reply, Duration::from_secs(1)).await.unwrap();
        });
        assert!(matches!(
            link.request(&mut client, &[0x20]).await,
            Err(C12Error::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_never_respond_needs_no_answer() {
        let (mut client, mut meter) = pair().await;
        let mut config = config(SecurityMode::ClearText);
        config.c1222.response_control = ResponseControl::Never;
        let mut link = ApduLink::new(&config, clock()).unwrap();
        assert_eq!(link.request(&mut client, &[0x52]).await.unwrap(), vec![0x00]);
        assert!(read_apdu(&mut meter, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_only_timeout_is_success() {
        let (mut client, _meter) = pair().await;
        let mut config = config(SecurityMode::ClearText);
        config.c1222.response_control = ResponseControl::OnException;
        let mut link = ApduLink::new(&config, clock()).unwrap();
        assert_eq!(link.request(&mut client, &[0x40]).await.unwrap(), vec![0x00]);
    }

    #[tokio::test]
    async fn test_sessionless_security_response_checked() {
        let (mut client, meter) = pair().await;
        let mut config = config(SecurityMode::ClearText);
        config.c1222.sessionless = true;
        let mut link = ApduLink::new(&config, clock()).unwrap();

        let mut meter = Meter::new(meter, &config);
        let meter_task = tokio::spawn(async move { meter.answer(&[&[0x0C], &[0x00]]).await.0 });
        let result = link.request(&mut client, &[0x30, 0x00, 0x00]).await;
        assert!(matches!(
            result,
            Err(C12Error::NokResponse { code: NokCode::Uat, .. })
        ));
        let services = meter_task.await.unwrap();
        // security with user id first, then the read
        assert_eq!(services[0], 23);
        assert_eq!(services[1], 0x51);
    }
}
