//! SMPP v3.4 protocol data units.
//!
//! Every PDU is a 16-byte big-endian header followed by a command specific
//! body:
//!
//! ```text
//! +----------------+------------+----------------+-----------------+------+
//! | command_length | command_id | command_status | sequence_number | body |
//! |    4 bytes     |  4 bytes   |    4 bytes     |     4 bytes     | ...  |
//! +----------------+------------+----------------+-----------------+------+
//! ```
//!
//! Only the commands a transceiver submitting messages needs are decoded.
//! Anything else is kept as [`PduBody::Raw`] so the session can still answer
//! it.

use crate::error::{Result, SmppError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 16;

/// SMPP interface version 3.4
pub const INTERFACE_VERSION: u8 = 0x34;

pub mod command_id {
    pub const GENERIC_NACK: u32 = 0x8000_0000;
    pub const BIND_TRANSCEIVER: u32 = 0x0000_0009;
    pub const BIND_TRANSCEIVER_RESP: u32 = 0x8000_0009;
    pub const SUBMIT_SM: u32 = 0x0000_0004;
    pub const SUBMIT_SM_RESP: u32 = 0x8000_0004;
    pub const DELIVER_SM: u32 = 0x0000_0005;
    pub const DELIVER_SM_RESP: u32 = 0x8000_0005;
    pub const UNBIND: u32 = 0x0000_0006;
    pub const UNBIND_RESP: u32 = 0x8000_0006;
    pub const ENQUIRE_LINK: u32 = 0x0000_0015;
    pub const ENQUIRE_LINK_RESP: u32 = 0x8000_0015;

    /// Responses carry the high bit.
    pub fn is_response(id: u32) -> bool {
        id & 0x8000_0000 != 0
    }
}

pub mod command_status {
    pub const ESME_ROK: u32 = 0x0000_0000;
    pub const ESME_RINVCMDID: u32 = 0x0000_0003;
    pub const ESME_RSYSERR: u32 = 0x0000_0008;
    pub const ESME_RBINDFAIL: u32 = 0x0000_000D;
    pub const ESME_RTHROTTLED: u32 = 0x0000_0058;
}

pub mod tag {
    pub const MESSAGE_PAYLOAD: u16 = 0x0424;
}

/// Data coding for UCS-2 (UTF-16BE) text
pub const DATA_CODING_UCS2: u8 = 0x08;
/// SMSC default alphabet
pub const DATA_CODING_DEFAULT: u8 = 0x00;

// Maximum C-octet string sizes including the terminating NUL.
pub const MAX_SYSTEM_ID: usize = 16;
pub const MAX_PASSWORD: usize = 9;
pub const MAX_ADDRESS: usize = 21;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: u16,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tag: u16, value: impl Into<Bytes>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindTransceiver {
    pub system_id: String,
    pub password: String,
    pub system_type: String,
    pub interface_version: u8,
    pub addr_ton: u8,
    pub addr_npi: u8,
    pub address_range: String,
}

impl BindTransceiver {
    pub fn new(system_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
            password: password.into(),
            system_type: String::new(),
            interface_version: INTERFACE_VERSION,
            addr_ton: 0,
            addr_npi: 0,
            address_range: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitSm {
    pub service_type: String,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub source_addr: String,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub destination_addr: String,
    pub esm_class: u8,
    pub protocol_id: u8,
    pub priority_flag: u8,
    pub schedule_delivery_time: String,
    pub validity_period: String,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub data_coding: u8,
    pub sm_default_msg_id: u8,
    pub short_message: Bytes,
    pub tlvs: Vec<Tlv>,
}

impl SubmitSm {
    pub fn tlv(&self, tag: u16) -> Option<&Tlv> {
        self.tlvs.iter().find(|t| t.tag == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody {
    GenericNack,
    BindTransceiver(BindTransceiver),
    BindTransceiverResp { system_id: String },
    SubmitSm(Box<SubmitSm>),
    SubmitSmResp { message_id: String },
    DeliverSmResp { message_id: String },
    Unbind,
    UnbindResp,
    EnquireLink,
    EnquireLinkResp,
    /// Any command this crate does not model; the body is kept verbatim
    Raw { command_id: u32, body: Bytes },
}

impl PduBody {
    pub fn command_id(&self) -> u32 {
        match self {
            PduBody::GenericNack => command_id::GENERIC_NACK,
            PduBody::BindTransceiver(_) => command_id::BIND_TRANSCEIVER,
            PduBody::BindTransceiverResp { .. } => command_id::BIND_TRANSCEIVER_RESP,
            PduBody::SubmitSm(_) => command_id::SUBMIT_SM,
            PduBody::SubmitSmResp { .. } => command_id::SUBMIT_SM_RESP,
            PduBody::DeliverSmResp { .. } => command_id::DELIVER_SM_RESP,
            PduBody::Unbind => command_id::UNBIND,
            PduBody::UnbindResp => command_id::UNBIND_RESP,
            PduBody::EnquireLink => command_id::ENQUIRE_LINK,
            PduBody::EnquireLinkResp => command_id::ENQUIRE_LINK_RESP,
            PduBody::Raw { command_id, .. } => *command_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PduBody::GenericNack => "generic_nack",
            PduBody::BindTransceiver(_) => "bind_transceiver",
            PduBody::BindTransceiverResp { .. } => "bind_transceiver_resp",
            PduBody::SubmitSm(_) => "submit_sm",
            PduBody::SubmitSmResp { .. } => "submit_sm_resp",
            PduBody::DeliverSmResp { .. } => "deliver_sm_resp",
            PduBody::Unbind => "unbind",
            PduBody::UnbindResp => "unbind_resp",
            PduBody::EnquireLink => "enquire_link",
            PduBody::EnquireLinkResp => "enquire_link_resp",
            PduBody::Raw { .. } => "raw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub command_status: u32,
    pub sequence_number: u32,
    pub body: PduBody,
}

impl Pdu {
    pub fn new(sequence_number: u32, body: PduBody) -> Self {
        Self {
            command_status: command_status::ESME_ROK,
            sequence_number,
            body,
        }
    }

    pub fn with_status(mut self, command_status: u32) -> Self {
        self.command_status = command_status;
        self
    }

    pub fn command_id(&self) -> u32 {
        self.body.command_id()
    }

    pub fn is_response(&self) -> bool {
        command_id::is_response(self.command_id())
    }

    /// Append the encoded PDU (header included) to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.put_u32(0); // patched below
        dst.put_u32(self.command_id());
        dst.put_u32(self.command_status);
        dst.put_u32(self.sequence_number);

        match &self.body {
            PduBody::GenericNack
            | PduBody::Unbind
            | PduBody::UnbindResp
            | PduBody::EnquireLink
            | PduBody::EnquireLinkResp => {}
            PduBody::BindTransceiver(bind) => {
                put_c_octet(dst, &bind.system_id);
                put_c_octet(dst, &bind.password);
                put_c_octet(dst, &bind.system_type);
                dst.put_u8(bind.interface_version);
                dst.put_u8(bind.addr_ton);
                dst.put_u8(bind.addr_npi);
                put_c_octet(dst, &bind.address_range);
            }
            PduBody::BindTransceiverResp { system_id } => put_c_octet(dst, system_id),
            PduBody::SubmitSmResp { message_id } | PduBody::DeliverSmResp { message_id } => {
                put_c_octet(dst, message_id)
            }
            PduBody::SubmitSm(sm) => {
                put_c_octet(dst, &sm.service_type);
                dst.put_u8(sm.source_addr_ton);
                dst.put_u8(sm.source_addr_npi);
                put_c_octet(dst, &sm.source_addr);
                dst.put_u8(sm.dest_addr_ton);
                dst.put_u8(sm.dest_addr_npi);
                put_c_octet(dst, &sm.destination_addr);
                dst.put_u8(sm.esm_class);
                dst.put_u8(sm.protocol_id);
                dst.put_u8(sm.priority_flag);
                put_c_octet(dst, &sm.schedule_delivery_time);
                put_c_octet(dst, &sm.validity_period);
                dst.put_u8(sm.registered_delivery);
                dst.put_u8(sm.replace_if_present_flag);
                dst.put_u8(sm.data_coding);
                dst.put_u8(sm.sm_default_msg_id);
                // sm_length is one octet; longer text must travel in message_payload
                let len = sm.short_message.len().min(u8::MAX as usize);
                dst.put_u8(len as u8);
                dst.put_slice(&sm.short_message[..len]);
                for tlv in &sm.tlvs {
                    dst.put_u16(tlv.tag);
                    dst.put_u16(tlv.value.len() as u16);
                    dst.put_slice(&tlv.value);
                }
            }
            PduBody::Raw { body, .. } => dst.put_slice(body),
        }

        let length = (dst.len() - start) as u32;
        dst[start..start + 4].copy_from_slice(&length.to_be_bytes());
    }

    /// Decode one complete frame (header included).
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(SmppError::Framing(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let command_length = frame.get_u32() as usize;
        if command_length != frame.len() + 4 {
            return Err(SmppError::Framing(format!(
                "command_length {} does not match frame size {}",
                command_length,
                frame.len() + 4
            )));
        }
        let id = frame.get_u32();
        let command_status = frame.get_u32();
        let sequence_number = frame.get_u32();
        let mut body = frame;

        let body = match id {
            command_id::GENERIC_NACK => PduBody::GenericNack,
            command_id::UNBIND => PduBody::Unbind,
            command_id::UNBIND_RESP => PduBody::UnbindResp,
            command_id::ENQUIRE_LINK => PduBody::EnquireLink,
            command_id::ENQUIRE_LINK_RESP => PduBody::EnquireLinkResp,
            command_id::BIND_TRANSCEIVER => PduBody::BindTransceiver(BindTransceiver {
                system_id: get_c_octet(&mut body, "system_id")?,
                password: get_c_octet(&mut body, "password")?,
                system_type: get_c_octet(&mut body, "system_type")?,
                interface_version: get_u8(&mut body, "interface_version")?,
                addr_ton: get_u8(&mut body, "addr_ton")?,
                addr_npi: get_u8(&mut body, "addr_npi")?,
                address_range: get_c_octet(&mut body, "address_range")?,
            }),
            // Error responses may omit the body entirely.
            command_id::BIND_TRANSCEIVER_RESP => PduBody::BindTransceiverResp {
                system_id: get_optional_c_octet(&mut body, "system_id")?,
            },
            command_id::SUBMIT_SM_RESP => PduBody::SubmitSmResp {
                message_id: get_optional_c_octet(&mut body, "message_id")?,
            },
            command_id::DELIVER_SM_RESP => PduBody::DeliverSmResp {
                message_id: get_optional_c_octet(&mut body, "message_id")?,
            },
            command_id::SUBMIT_SM => PduBody::SubmitSm(Box::new(decode_submit_sm(&mut body)?)),
            other => PduBody::Raw {
                command_id: other,
                body,
            },
        };

        Ok(Pdu {
            command_status,
            sequence_number,
            body,
        })
    }
}

fn decode_submit_sm(body: &mut Bytes) -> Result<SubmitSm> {
    let mut sm = SubmitSm {
        service_type: get_c_octet(body, "service_type")?,
        source_addr_ton: get_u8(body, "source_addr_ton")?,
        source_addr_npi: get_u8(body, "source_addr_npi")?,
        source_addr: get_c_octet(body, "source_addr")?,
        dest_addr_ton: get_u8(body, "dest_addr_ton")?,
        dest_addr_npi: get_u8(body, "dest_addr_npi")?,
        destination_addr: get_c_octet(body, "destination_addr")?,
        esm_class: get_u8(body, "esm_class")?,
        protocol_id: get_u8(body, "protocol_id")?,
        priority_flag: get_u8(body, "priority_flag")?,
        schedule_delivery_time: get_c_octet(body, "schedule_delivery_time")?,
        validity_period: get_c_octet(body, "validity_period")?,
        registered_delivery: get_u8(body, "registered_delivery")?,
        replace_if_present_flag: get_u8(body, "replace_if_present_flag")?,
        data_coding: get_u8(body, "data_coding")?,
        sm_default_msg_id: get_u8(body, "sm_default_msg_id")?,
        ..Default::default()
    };
    let sm_length = get_u8(body, "sm_length")? as usize;
    if body.remaining() < sm_length {
        return Err(truncated("short_message"));
    }
    sm.short_message = body.split_to(sm_length);

    while body.has_remaining() {
        if body.remaining() < 4 {
            return Err(truncated("tlv header"));
        }
        let tag = body.get_u16();
        let len = body.get_u16() as usize;
        if body.remaining() < len {
            return Err(truncated("tlv value"));
        }
        sm.tlvs.push(Tlv {
            tag,
            value: body.split_to(len),
        });
    }
    Ok(sm)
}

fn truncated(field: &str) -> SmppError {
    SmppError::Framing(format!("truncated {}", field))
}

fn put_c_octet(dst: &mut BytesMut, value: &str) {
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
}

fn get_u8(src: &mut Bytes, field: &str) -> Result<u8> {
    if !src.has_remaining() {
        return Err(truncated(field));
    }
    Ok(src.get_u8())
}

fn get_c_octet(src: &mut Bytes, field: &str) -> Result<String> {
    let nul = src
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| SmppError::Framing(format!("unterminated {}", field)))?;
    let raw = src.split_to(nul);
    src.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn get_optional_c_octet(src: &mut Bytes, field: &str) -> Result<String> {
    if src.has_remaining() {
        get_c_octet(src, field)
    } else {
        Ok(String::new())
    }
}

/// Check a C-octet string fits its field (`max` includes the NUL).
pub fn check_c_octet(field: &'static str, value: &str, max: usize) -> Result<()> {
    if value.len() + 1 > max {
        return Err(SmppError::InvalidField {
            field,
            reason: format!("{} bytes exceeds maximum of {}", value.len(), max - 1),
        });
    }
    if value.as_bytes().contains(&0) {
        return Err(SmppError::InvalidField {
            field,
            reason: "contains NUL".to_string(),
        });
    }
    Ok(())
}

/// Encode message text for the given data coding.
///
/// UCS-2 is sent as UTF-16BE; the default alphabet is sent as ASCII with
/// anything outside it replaced by `?`.
pub fn encode_text(text: &str, data_coding: u8) -> Bytes {
    match data_coding {
        DATA_CODING_UCS2 => {
            let mut out = BytesMut::with_capacity(text.len() * 2);
            for unit in text.encode_utf16() {
                out.put_u16(unit);
            }
            out.freeze()
        }
        _ => text
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect::<Vec<u8>>()
            .into(),
    }
}

/// Inverse of [`encode_text`] for UCS-2 payloads.
pub fn decode_ucs2(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(pdu: &Pdu) -> Bytes {
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        buf.freeze()
    }

    #[test]
    fn test_enquire_link_is_header_only() {
        let bytes = encoded(&Pdu::new(7, PduBody::EnquireLink));
        assert_eq!(
            &bytes[..],
            &[0, 0, 0, 16, 0, 0, 0, 0x15, 0, 0, 0, 0, 0, 0, 0, 7]
        );
    }

    #[test]
    fn test_bind_transceiver_layout() {
        let bytes = encoded(&Pdu::new(
            1,
            PduBody::BindTransceiver(BindTransceiver::new("lbtest", "123456")),
        ));
        let body = &bytes[HEADER_LEN..];
        assert_eq!(&body[..7], b"lbtest\0");
        assert_eq!(&body[7..14], b"123456\0");
        // empty system_type, version, ton, npi, empty address_range
        assert_eq!(&body[14..], &[0, 0x34, 0, 0, 0]);
        assert_eq!(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize, bytes.len());
    }

    #[test]
    fn test_submit_sm_decodes_what_it_encodes() {
        let sm = SubmitSm {
            source_addr_ton: 5,
            source_addr: "BANK".to_string(),
            dest_addr_ton: 5,
            destination_addr: "96170000001".to_string(),
            data_coding: DATA_CODING_UCS2,
            tlvs: vec![Tlv::new(tag::MESSAGE_PAYLOAD, encode_text("مرحبا", DATA_CODING_UCS2))],
            ..Default::default()
        };
        let pdu = Pdu::new(42, PduBody::SubmitSm(Box::new(sm.clone())));

        let decoded = Pdu::decode(encoded(&pdu)).unwrap();
        assert_eq!(decoded, pdu);

        let PduBody::SubmitSm(got) = decoded.body else {
            panic!("expected submit_sm");
        };
        let payload = got.tlv(tag::MESSAGE_PAYLOAD).unwrap();
        assert_eq!(decode_ucs2(&payload.value), "مرحبا");
    }

    #[test]
    fn test_error_response_without_body() {
        // submit_sm_resp, status throttled, seq 3, no body
        let frame = Bytes::from_static(&[0, 0, 0, 16, 0x80, 0, 0, 4, 0, 0, 0, 0x58, 0, 0, 0, 3]);
        let pdu = Pdu::decode(frame).unwrap();
        assert_eq!(pdu.command_status, command_status::ESME_RTHROTTLED);
        assert_eq!(pdu.sequence_number, 3);
        assert_eq!(pdu.body, PduBody::SubmitSmResp { message_id: String::new() });
        assert!(pdu.is_response());
    }

    #[test]
    fn test_unknown_command_kept_raw() {
        let frame = Bytes::from_static(&[0, 0, 0, 18, 0, 0, 0, 0x03, 0, 0, 0, 0, 0, 0, 0, 9, 0xAB, 0xCD]);
        let pdu = Pdu::decode(frame).unwrap();
        assert_eq!(
            pdu.body,
            PduBody::Raw {
                command_id: 0x03,
                body: Bytes::from_static(&[0xAB, 0xCD])
            }
        );
    }

    #[test]
    fn test_unterminated_string_is_framing_error() {
        let frame = Bytes::from_static(&[0, 0, 0, 19, 0x80, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 1, b'1', b'2', b'3']);
        assert!(matches!(Pdu::decode(frame), Err(SmppError::Framing(_))));
    }

    #[test]
    fn test_length_mismatch_is_framing_error() {
        let frame = Bytes::from_static(&[0, 0, 0, 20, 0, 0, 0, 0x15, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(matches!(Pdu::decode(frame), Err(SmppError::Framing(_))));
    }

    #[test]
    fn test_encode_text_default_alphabet() {
        assert_eq!(&encode_text("Hi é", DATA_CODING_DEFAULT)[..], b"Hi ?");
        assert_eq!(&encode_text("Hi", DATA_CODING_UCS2)[..], &[0, b'H', 0, b'i']);
    }

    #[test]
    fn test_check_c_octet() {
        assert!(check_c_octet("system_id", "lbtest", MAX_SYSTEM_ID).is_ok());
        assert!(check_c_octet("password", "123456789", MAX_PASSWORD).is_err());
        assert!(check_c_octet("source_addr", "a\0b", MAX_ADDRESS).is_err());
    }
}
