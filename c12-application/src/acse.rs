//! C12.22 ACSE APDU codec
//!
//! An APDU is `60 <length>` followed by tagged elements:
//!
//! | Tag | Element |
//! |-----|---------|
//! | A1 | application context |
//! | A2 | called AP title |
//! | A4 | called AP invocation id |
//! | A6 | calling AP title |
//! | A7 | calling AE qualifier |
//! | A8 | calling AP invocation id |
//! | AC | calling authentication value (key id and IV) |
//! | BE | user information, the EPSEM |
//!
//! When the EPSEM is secured, EAX' runs over a canonified cleartext made of
//! the addressing elements and the user information header, with relative
//! AP titles made absolute.

use crate::epsem::{self, ED_CLASS_SIZE, EpsemControl};
use crate::iso8825::{Reader, encode_tagged_uid, encode_tagged_unsigned, is_uid_relative};
use bytes::{BufMut, BytesMut};
use c12_core::config::STANDARD_NETWORK_CONTEXT;
use c12_core::{C1222Options, C12Error, C12Result, NokCode, ResponseControl, SecurityMode};
use c12_security::{AesEax, MAC_SIZE, verify_tag};
use c12_transport::BidirectionalBuffer;

/// APDU start tag
pub const APDU_TAG: u8 = 0x60;

pub const TAG_APPLICATION_CONTEXT: u8 = 0xA1;
pub const TAG_CALLED_AP_TITLE: u8 = 0xA2;
pub const TAG_CALLED_AP_INVOCATION_ID: u8 = 0xA4;
pub const TAG_CALLING_AP_TITLE: u8 = 0xA6;
pub const TAG_CALLING_AE_QUALIFIER: u8 = 0xA7;
pub const TAG_CALLING_AP_INVOCATION_ID: u8 = 0xA8;
pub const TAG_CALLING_AUTHENTICATION_VALUE: u8 = 0xAC;
pub const TAG_USER_INFORMATION: u8 = 0xBE;

const USER_INFORMATION_EXTERNAL: u8 = 0x28;
const USER_INFORMATION_INDIRECT_REFERENCE: u8 = 0x02;
const USER_INFORMATION_OCTET_STRING: u8 = 0x81;

/// Size of the whole calling authentication value element
pub const AUTHENTICATION_VALUE_SIZE: usize = 17;

/// Element bytes before the key id
const AUTHENTICATION_VALUE_PREFIX: [u8; 10] = [0xAC, 0x0F, 0xA2, 0x0D, 0xA0, 0x0B, 0xA1, 0x09, 0x80, 0x01];
const AUTHENTICATION_VALUE_IV_PREFIX: [u8; 2] = [0x81, 0x04];

/// Front space reserved for the ACSE header
const HEADER_RESERVE: usize = 128;

/// Key id and initialization vector carried by the AC element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallingAuthentication {
    pub key_id: u8,
    pub initialization_vector: u32,
}

impl CallingAuthentication {
    pub fn new(key_id: u8, initialization_vector: u32) -> Self {
        Self {
            key_id,
            initialization_vector,
        }
    }

    /// `AC 0F A2 0D A0 0B A1 09 80 01 <key id> 81 04 <iv>`
    pub fn encode(&self) -> [u8; AUTHENTICATION_VALUE_SIZE] {
        let mut element = [0u8; AUTHENTICATION_VALUE_SIZE];
        element[..10].copy_from_slice(&AUTHENTICATION_VALUE_PREFIX);
        element[10] = self.key_id;
        element[11..13].copy_from_slice(&AUTHENTICATION_VALUE_IV_PREFIX);
        element[13..].copy_from_slice(&self.initialization_vector.to_be_bytes());
        element
    }

    /// Parse the element value, the 15 bytes after tag and length
    fn decode_value(value: &[u8]) -> C12Result<Self> {
        if value.len() != AUTHENTICATION_VALUE_SIZE - 2
            || value[..8] != AUTHENTICATION_VALUE_PREFIX[2..]
            || value[9..11] != AUTHENTICATION_VALUE_IV_PREFIX
        {
            return Err(bad_element(TAG_CALLING_AUTHENTICATION_VALUE));
        }
        Ok(Self {
            key_id: value[8],
            initialization_vector: u32::from_be_bytes([value[11], value[12], value[13], value[14]]),
        })
    }
}

fn bad_element(tag: u8) -> C12Error {
    C12Error::Protocol(format!("Bad ACSE response, element 0x{:02X}", tag))
}

/// Addressing and EPSEM settings of one C12.22 association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcseParameters {
    pub application_context: String,
    pub called_ap_title: String,
    pub calling_ap_title: String,
    pub calling_ae_qualifier: Option<u32>,
    pub security_mode: SecurityMode,
    pub response_control: ResponseControl,
    pub ed_class: Vec<u8>,
    pub max_apdu_size_outgoing: u32,
    pub max_apdu_size_incoming: u32,
}

impl AcseParameters {
    pub fn from_options(options: &C1222Options) -> Self {
        Self {
            application_context: options.application_context.clone(),
            called_ap_title: options.called_ap_title.clone(),
            calling_ap_title: options.calling_ap_title.clone(),
            calling_ae_qualifier: options.calling_ae_qualifier,
            security_mode: options.security_mode,
            response_control: options.response_control,
            ed_class: options.ed_class.clone(),
            max_apdu_size_outgoing: options.max_apdu_size_outgoing,
            max_apdu_size_incoming: options.effective_max_apdu_incoming(),
        }
    }

    /// Parameters of the peer answering us, titles swapped
    pub fn swapped(&self) -> Self {
        let mut peer = self.clone();
        std::mem::swap(&mut peer.called_ap_title, &mut peer.calling_ap_title);
        peer
    }
}

/// Relative titles hang off the application context
fn absolute_title(context: &str, title: &str) -> String {
    if !is_uid_relative(title) {
        title.to_string()
    } else if context.is_empty() {
        format!("{}{}", STANDARD_NETWORK_CONTEXT, title)
    } else {
        format!("{}{}", context, title)
    }
}

fn put_uid_if_present(tag: u8, uid: &str, out: &mut BytesMut) -> C12Result<()> {
    if uid.is_empty() {
        return Ok(());
    }
    encode_tagged_uid(tag, uid, out)
}

fn put_absolute_uid_if_present(tag: u8, context: &str, title: &str, out: &mut BytesMut) -> C12Result<()> {
    if title.is_empty() {
        return Ok(());
    }
    encode_tagged_uid(tag, &absolute_title(context, title), out)
}

/// What secures an outgoing APDU
#[derive(Debug, Clone, Copy)]
pub struct Seal<'a> {
    pub eax: &'a AesEax,
    pub authentication: CallingAuthentication,
    /// Send the AC element with this APDU
    pub send_authentication_value: bool,
}

/// Request APDU under construction
#[derive(Debug, Clone, Default)]
pub struct OutgoingApdu {
    pub calling_ap_invocation_id: u32,
    /// Echo of the peer's calling invocation id, only when answering
    pub called_ap_invocation_id: Option<u32>,
    services: Vec<Vec<u8>>,
}

impl OutgoingApdu {
    pub fn new(calling_ap_invocation_id: u32) -> Self {
        Self {
            calling_ap_invocation_id,
            called_ap_invocation_id: None,
            services: Vec::new(),
        }
    }

    pub fn push_service(&mut self, service: Vec<u8>) {
        self.services.push(service);
    }

    pub fn services(&self) -> &[Vec<u8>] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Encode the APDU, securing the EPSEM when the mode asks for it
    ///
    /// # Errors
    ///
    /// `NokResponse` with RQTL and the size limit as extra data when the
    /// result exceeds the outgoing APDU size.
    pub fn build(&self, params: &AcseParameters, seal: Option<Seal<'_>>) -> C12Result<Vec<u8>> {
        let security_mode = params.security_mode;
        let seal = match (security_mode.is_secure(), seal) {
            (false, _) => None,
            (true, Some(seal)) => Some(seal),
            (true, None) => {
                return Err(C12Error::Security(
                    "Security mode requires a key, but none is defined".to_string(),
                ));
            }
        };
        let tail = if seal.is_some() { MAC_SIZE } else { 0 };

        let ed_class = (!params.ed_class.is_empty()).then_some(params.ed_class.as_slice());
        let body = epsem::encode_services(ed_class, self.services.iter().map(Vec::as_slice))?;
        let control = EpsemControl::new(security_mode, params.response_control, ed_class.is_some());

        let mut apdu = BidirectionalBuffer::new(HEADER_RESERVE);
        apdu.append(&body);
        apdu.prepend_byte(control.to_byte());
        apdu.prepend_iso_length(apdu.len() + tail);
        apdu.prepend_byte(USER_INFORMATION_OCTET_STRING);
        apdu.prepend_iso_length(apdu.len() + tail);
        apdu.prepend_byte(USER_INFORMATION_EXTERNAL);
        apdu.prepend_iso_length(apdu.len() + tail);
        apdu.prepend_byte(TAG_USER_INFORMATION);

        if let Some(seal) = seal {
            let context = params.application_context.as_str();
            let mut cleartext = BytesMut::with_capacity(128 + body.len());
            put_uid_if_present(TAG_APPLICATION_CONTEXT, context, &mut cleartext)?;
            put_absolute_uid_if_present(TAG_CALLED_AP_TITLE, context, &params.called_ap_title, &mut cleartext)?;
            if let Some(id) = self.called_ap_invocation_id {
                encode_tagged_unsigned(TAG_CALLED_AP_INVOCATION_ID, id, &mut cleartext);
            }
            if let Some(qualifier) = params.calling_ae_qualifier {
                encode_tagged_unsigned(TAG_CALLING_AE_QUALIFIER, qualifier, &mut cleartext);
            }
            encode_tagged_unsigned(TAG_CALLING_AP_INVOCATION_ID, self.calling_ap_invocation_id, &mut cleartext);
            let authentication_value = seal.authentication.encode();
            if seal.send_authentication_value {
                cleartext.put_slice(&authentication_value);
            }
            cleartext.put_slice(apdu.header());
            put_absolute_uid_if_present(TAG_CALLING_AP_TITLE, context, &params.calling_ap_title, &mut cleartext)?;
            cleartext.put_u8(seal.authentication.key_id);
            cleartext.put_slice(&seal.authentication.initialization_vector.to_be_bytes());

            let mac = if security_mode == SecurityMode::ClearTextWithAuthentication {
                cleartext.put_slice(apdu.body());
                seal.eax.authenticate(&cleartext)
            } else {
                seal.eax.encrypt_buffer(&cleartext, apdu.body_mut())
            };
            apdu.append(&mac);
            if seal.send_authentication_value {
                apdu.prepend(&authentication_value);
            }
        }

        let mut addressing = BytesMut::with_capacity(HEADER_RESERVE);
        put_uid_if_present(TAG_APPLICATION_CONTEXT, &params.application_context, &mut addressing)?;
        put_uid_if_present(TAG_CALLED_AP_TITLE, &params.called_ap_title, &mut addressing)?;
        if let Some(id) = self.called_ap_invocation_id {
            encode_tagged_unsigned(TAG_CALLED_AP_INVOCATION_ID, id, &mut addressing);
        }
        put_uid_if_present(TAG_CALLING_AP_TITLE, &params.calling_ap_title, &mut addressing)?;
        if let Some(qualifier) = params.calling_ae_qualifier {
            encode_tagged_unsigned(TAG_CALLING_AE_QUALIFIER, qualifier, &mut addressing);
        }
        encode_tagged_unsigned(TAG_CALLING_AP_INVOCATION_ID, self.calling_ap_invocation_id, &mut addressing);
        apdu.prepend(&addressing);
        apdu.prepend_iso_length(apdu.len());
        apdu.prepend_byte(APDU_TAG);

        if apdu.len() > params.max_apdu_size_outgoing as usize {
            return Err(C12Error::NokResponse {
                code: NokCode::Rqtl,
                extra: params.max_apdu_size_outgoing.to_be_bytes().to_vec(),
            });
        }
        Ok(apdu.into_vec())
    }
}

/// Parsed response APDU
#[derive(Debug, Clone, Default)]
pub struct IncomingApdu {
    pub application_context: String,
    pub called_ap_title: String,
    pub called_ap_invocation_id: Option<u32>,
    pub calling_ap_title: String,
    pub calling_ae_qualifier: Option<u32>,
    pub calling_ap_invocation_id: Option<u32>,
    /// Present when the AC element was received
    pub authentication: Option<CallingAuthentication>,
    /// None when the APDU had no user information
    pub control: Option<EpsemControl>,
    /// Device class, known after [`IncomingApdu::open`]
    pub ed_class: Option<[u8; ED_CLASS_SIZE]>,
    user_information_header: Vec<u8>,
    epsem: Vec<u8>,
}

impl IncomingApdu {
    /// Parse a complete APDU, start tag included
    ///
    /// # Errors
    ///
    /// `NokResponse` with RSTL when the APDU exceeds `max_apdu_size`.
    pub fn parse(apdu: &[u8], max_apdu_size: u32) -> C12Result<Self> {
        let mut reader = Reader::new(apdu);
        if reader.read_u8()? != APDU_TAG {
            return Err(C12Error::FrameInvalid("Did not see C12.22 APDU start".to_string()));
        }
        let length = reader.read_length()?;
        if length != reader.remaining() {
            return Err(C12Error::FrameInvalid(
                "The APDU length is inconsistent with APDU size".to_string(),
            ));
        }

        let mut incoming = IncomingApdu::default();
        while reader.remaining() > 0 {
            let tag_start = reader.position();
            let tag = reader.read_u8()?;
            let element_length = reader.read_length()?;
            match tag {
                TAG_APPLICATION_CONTEXT => incoming.application_context = reader.read_uid()?,
                TAG_CALLED_AP_TITLE => incoming.called_ap_title = reader.read_uid()?,
                TAG_CALLED_AP_INVOCATION_ID => incoming.called_ap_invocation_id = Some(reader.read_integer()?),
                TAG_CALLING_AP_TITLE => incoming.calling_ap_title = reader.read_uid()?,
                TAG_CALLING_AE_QUALIFIER => incoming.calling_ae_qualifier = Some(reader.read_integer()?),
                TAG_CALLING_AP_INVOCATION_ID => incoming.calling_ap_invocation_id = Some(reader.read_integer()?),
                TAG_CALLING_AUTHENTICATION_VALUE => {
                    let value = reader.read_bytes(AUTHENTICATION_VALUE_SIZE - 2)?;
                    incoming.authentication = Some(CallingAuthentication::decode_value(value)?);
                }
                TAG_USER_INFORMATION => {
                    if length > max_apdu_size as usize {
                        return Err(C12Error::NokResponse {
                            code: NokCode::Rstl,
                            extra: max_apdu_size.to_be_bytes().to_vec(),
                        });
                    }
                    if reader.read_u8()? != USER_INFORMATION_EXTERNAL {
                        return Err(bad_element(TAG_USER_INFORMATION));
                    }
                    reader.read_length()?;
                    let mut next = reader.read_u8()?;
                    if next == USER_INFORMATION_INDIRECT_REFERENCE {
                        let skipped = reader.read_length()?;
                        reader.skip(skipped)?;
                        next = reader.read_u8()?;
                    }
                    if next != USER_INFORMATION_OCTET_STRING {
                        return Err(bad_element(TAG_USER_INFORMATION));
                    }
                    let octets = reader.read_length()?;
                    if octets == 0 || octets != reader.remaining() {
                        return Err(bad_element(TAG_USER_INFORMATION));
                    }
                    let control = EpsemControl::from_byte(reader.read_u8()?)?;
                    if control.security_mode.is_secure() && reader.remaining() < MAC_SIZE {
                        return Err(C12Error::AuthenticationFailed(
                            "Secured EPSEM is shorter than its MAC".to_string(),
                        ));
                    }
                    incoming.user_information_header = apdu[tag_start..reader.position()].to_vec();
                    incoming.control = Some(control);
                    incoming.epsem = reader.remaining_bytes().to_vec();
                    break;
                }
                _ => reader.skip(element_length)?,
            }
        }
        Ok(incoming)
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.control.map_or(SecurityMode::ClearText, |c| c.security_mode)
    }

    /// Whether a user information element was received
    pub fn has_epsem(&self) -> bool {
        self.control.is_some()
    }

    /// Whether this APDU carries another request's invocation id
    ///
    /// Such a response is late, not tampered with, and is skipped by the
    /// caller. A missing id is not stale, [`verify_response`](Self::verify_response)
    /// rejects it.
    pub fn is_stale(&self, calling_ap_invocation_id: u32) -> bool {
        self.called_ap_invocation_id
            .is_some_and(|id| id != calling_ap_invocation_id)
    }

    /// Check that this APDU answers our request
    ///
    /// Both invocation ids must be present, the called one echoing ours,
    /// and the AP titles must be ours swapped.
    pub fn verify_response(&self, params: &AcseParameters, calling_ap_invocation_id: u32) -> C12Result<()> {
        let problem = if self.called_ap_invocation_id.is_none() {
            Some("Incoming called invocation ID is not present, tampering is suspected")
        } else if self.calling_ap_invocation_id.is_none() {
            Some("Incoming calling invocation ID is not present, tampering is suspected")
        } else if self.called_ap_invocation_id != Some(calling_ap_invocation_id) {
            Some("Invocation ID mismatch, tampering is suspected")
        } else if params.calling_ap_title != self.called_ap_title || params.called_ap_title != self.calling_ap_title {
            Some("Ap title mismatch, tampering is suspected")
        } else {
            None
        };
        match problem {
            Some(message) => Err(C12Error::AuthenticationFailed(message.to_string())),
            None => Ok(()),
        }
    }

    fn canonified_cleartext(&self, authentication: CallingAuthentication) -> C12Result<BytesMut> {
        let context = self.application_context.as_str();
        let mut cleartext = BytesMut::with_capacity(128 + self.epsem.len());
        put_uid_if_present(TAG_APPLICATION_CONTEXT, context, &mut cleartext)?;
        put_absolute_uid_if_present(TAG_CALLED_AP_TITLE, context, &self.called_ap_title, &mut cleartext)?;
        if let Some(id) = self.called_ap_invocation_id {
            encode_tagged_unsigned(TAG_CALLED_AP_INVOCATION_ID, id, &mut cleartext);
        }
        if let Some(qualifier) = self.calling_ae_qualifier {
            encode_tagged_unsigned(TAG_CALLING_AE_QUALIFIER, qualifier, &mut cleartext);
        }
        if let Some(id) = self.calling_ap_invocation_id {
            encode_tagged_unsigned(TAG_CALLING_AP_INVOCATION_ID, id, &mut cleartext);
        }
        if self.authentication.is_some() {
            cleartext.put_slice(&authentication.encode());
        }
        cleartext.put_slice(&self.user_information_header);
        put_absolute_uid_if_present(TAG_CALLING_AP_TITLE, context, &self.calling_ap_title, &mut cleartext)?;
        cleartext.put_u8(authentication.key_id);
        cleartext.put_slice(&authentication.initialization_vector.to_be_bytes());
        Ok(cleartext)
    }

    /// Plain EPSEM services, device class removed
    ///
    /// `authentication` is the key id and IV in force for this APDU: the
    /// ones it carried, or the last ones received in the session.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` when the MAC does not verify or a key is
    /// missing for a secured EPSEM.
    pub fn open(&mut self, eax: Option<&AesEax>, authentication: CallingAuthentication) -> C12Result<Vec<u8>> {
        let Some(control) = self.control else {
            return Ok(Vec::new());
        };
        let mut epsem = match control.security_mode {
            SecurityMode::ClearText => self.epsem.clone(),
            mode => {
                let eax = eax.ok_or_else(|| {
                    C12Error::AuthenticationFailed("Secured response, but no key is defined".to_string())
                })?;
                let mut cleartext = self.canonified_cleartext(authentication)?;
                let (body, received) = self.epsem.split_at(self.epsem.len() - MAC_SIZE);
                let (mac, plain) = if mode == SecurityMode::CipherTextWithAuthentication {
                    let mut plain = body.to_vec();
                    let mac = eax.decrypt_buffer(&cleartext, &mut plain);
                    (mac, plain)
                } else {
                    cleartext.put_slice(body);
                    (eax.authenticate(&cleartext), body.to_vec())
                };
                if !verify_tag(&mac, received) {
                    return Err(C12Error::AuthenticationFailed(
                        "Data not validated, tampering or wrong key".to_string(),
                    ));
                }
                plain
            }
        };
        if control.ed_class_included {
            if epsem.len() < ED_CLASS_SIZE {
                return Err(bad_element(TAG_USER_INFORMATION));
            }
            let mut ed_class = [0u8; ED_CLASS_SIZE];
            ed_class.copy_from_slice(&epsem[..ED_CLASS_SIZE]);
            self.ed_class = Some(ed_class);
            epsem.drain(..ED_CLASS_SIZE);
        }
        Ok(epsem)
    }
}
