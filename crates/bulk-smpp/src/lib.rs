//! SMPP v3.4 for bulk submission
//!
//! - [`pdu`]: the PDUs a transceiver needs, with a raw fallback for the rest
//! - [`codec`]: length-prefixed framing for `tokio_util::codec::Framed`
//! - [`client`]: a bound transceiver session with keep-alive

pub mod client;
pub mod codec;
pub mod error;
pub mod pdu;

pub use client::{SessionOptions, SmppClient, SubmitAck};
pub use codec::PduCodec;
pub use error::{Result, SmppError};
pub use pdu::{Pdu, PduBody};
