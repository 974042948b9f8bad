use crate::error::SmppError;
use crate::pdu::{Pdu, HEADER_LEN};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Length-prefixed SMPP framing for `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_frame_len: usize,
}

impl PduCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for PduCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = SmppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Pdu>, SmppError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < HEADER_LEN {
            return Err(SmppError::Framing(format!(
                "command_length {} is shorter than the header",
                len
            )));
        }
        if len > self.max_frame_len {
            return Err(SmppError::Framing(format!(
                "command_length {} exceeds limit of {}",
                len, self.max_frame_len
            )));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len).freeze();
        Pdu::decode(frame).map(Some)
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = SmppError;

    fn encode(&mut self, pdu: Pdu, dst: &mut BytesMut) -> Result<(), SmppError> {
        pdu.encode(dst);
        Ok(())
    }
}
