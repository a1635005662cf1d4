//! Protocol module containing the PDU model, the binary codec, and request
//! correlation.

pub mod codec;
pub mod pdu;
pub mod request;

pub use codec::{decode_pdu, encode_pdu, FrameDecoder, ProtocolError};
pub use pdu::*;
pub use request::{RegistryError, RequestIdCounter, RequestRegistry, Resolved};
