//! Binary codec for encoding and decoding PDUs.
//!
//! Wire format:
//! ```text
//! [version:1][action:1][flags:1][reserved:1][payload_len:4][request_id:8][payload:N]
//! ```
//! Total header size: 16 bytes. All multi-byte integers are big-endian.
//! Flag bit 0 marks the request id as present; when clear the id field is zero
//! and ignored.
//!
//! Because every frame states its own length, a unit whose payload is
//! malformed is skipped whole and the next frame decodes normally.

use crate::protocol::pdu::{
    Action, AuthenticateBody, ErrorBody, HandshakeBody, HandshakeOkBody, Messages, Nonce, Pdu,
    PduBody, PublishBody, PublishOkBody, SubscribeBody, SubscribeOkBody, SubscriptionDataBody,
    UnsubscribeBody, UnsubscribeOkBody, HEADER_SIZE, PROTOCOL_VERSION,
};
use thiserror::Error;

/// Largest payload a frame may declare.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Header flag: the request id field is meaningful.
pub const FLAG_HAS_REQUEST_ID: u8 = 0x01;

/// Errors that can occur during PDU encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The action byte in the header is not a recognized value.
    #[error("unknown action: 0x{0:02X}")]
    UnknownAction(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed (field out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The frame declares more payload than [`MAX_PAYLOAD_LEN`].
    #[error("payload of {declared} bytes exceeds limit of {max}")]
    PayloadTooLarge { declared: usize, max: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Pdu`] into a byte vector including the 16-byte header.
///
/// # Errors
///
/// Returns [`ProtocolError`] if a field does not fit its length prefix or the
/// payload exceeds [`MAX_PAYLOAD_LEN`].  Nothing is truncated.
///
/// # Examples
///
/// ```rust
/// use rtm_core::protocol::{decode_pdu, encode_pdu, Pdu, PduBody, SubscribeBody};
///
/// let pdu = Pdu::with_request_id(7, PduBody::Subscribe(SubscribeBody {
///     channel: "animals".into(),
/// }));
/// let bytes = encode_pdu(&pdu).unwrap();
/// let (decoded, consumed) = decode_pdu(&bytes).unwrap();
/// assert_eq!(decoded, pdu);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_pdu(pdu: &Pdu) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(&pdu.body)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            declared: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    let (flags, request_id) = match pdu.request_id {
        Some(id) => (FLAG_HAS_REQUEST_ID, id),
        None => (0x00, 0),
    };

    buf.push(PROTOCOL_VERSION);
    buf.push(pdu.action() as u8);
    buf.push(flags);
    buf.push(0x00); // reserved
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&request_id.to_be_bytes());

    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes one [`Pdu`] from the beginning of `bytes`.
///
/// Returns the PDU and the total number of bytes consumed (header + payload).
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are incomplete or malformed.
pub fn decode_pdu(bytes: &[u8]) -> Result<(Pdu, usize), ProtocolError> {
    let payload_len = frame_payload_len(bytes)?;

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let action_byte = bytes[1];
    let action =
        Action::try_from(action_byte).map_err(|_| ProtocolError::UnknownAction(action_byte))?;

    let flags = bytes[2];
    // bytes[3] is reserved – ignored on decode
    let request_id = if flags & FLAG_HAS_REQUEST_ID != 0 {
        Some(read_u64(bytes, 8)?)
    } else {
        None
    };

    let total_needed = HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(ProtocolError::InsufficientData {
            needed: total_needed,
            available: bytes.len(),
        });
    }

    let payload = &bytes[HEADER_SIZE..total_needed];
    let body = decode_payload(action, payload)?;
    Ok((Pdu { request_id, body }, total_needed))
}

/// Reads the declared payload length out of a frame header.
fn frame_payload_len(bytes: &[u8]) -> Result<usize, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let declared = read_u32(bytes, 4)? as usize;
    if declared > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            declared,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(declared)
}

// ── Stream framing ────────────────────────────────────────────────────────────

/// Incremental decoder that splits a byte stream into PDUs.
///
/// Feed received bytes with [`extend`](Self::extend) and drain complete
/// frames with [`next_pdu`](Self::next_pdu).  A frame whose payload fails to
/// decode is consumed and reported as an error; the frames after it are
/// unaffected.  A header declaring more than [`MAX_PAYLOAD_LEN`] cannot be
/// skipped safely and leaves the stream unusable.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes to the internal buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, decoded, or `None` if more bytes are
    /// needed.
    pub fn next_pdu(&mut self) -> Option<Result<Pdu, ProtocolError>> {
        if self.buf.len() < HEADER_SIZE {
            return None;
        }
        let payload_len = match frame_payload_len(&self.buf) {
            Ok(len) => len,
            Err(e) => return Some(Err(e)),
        };
        let total = HEADER_SIZE + payload_len;
        if self.buf.len() < total {
            return None;
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Some(decode_pdu(&frame).map(|(pdu, _)| pdu))
    }
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(body: &PduBody) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    match body {
        PduBody::Handshake(b) => write_str16(&mut buf, &b.role, "Handshake.role")?,
        PduBody::Authenticate(b) => {
            write_str16(&mut buf, b.nonce.as_str(), "Authenticate.nonce")?;
            write_str16(&mut buf, &b.proof, "Authenticate.proof")?;
        }
        PduBody::Subscribe(b) => write_str16(&mut buf, &b.channel, "Subscribe.channel")?,
        PduBody::Unsubscribe(b) => {
            write_str16(&mut buf, &b.subscription_id, "Unsubscribe.subscription_id")?
        }
        PduBody::Publish(b) => {
            write_str16(&mut buf, &b.channel, "Publish.channel")?;
            write_str32(&mut buf, &b.message, "Publish.message")?;
        }
        PduBody::HandshakeOk(b) => write_str16(&mut buf, b.nonce.as_str(), "HandshakeOk.nonce")?,
        PduBody::AuthenticateOk => {} // empty payload
        PduBody::SubscribeOk(b) => {
            write_str16(&mut buf, &b.subscription_id, "SubscribeOk.subscription_id")?;
            write_str16(&mut buf, &b.position, "SubscribeOk.position")?;
        }
        PduBody::UnsubscribeOk(b) => {
            write_str16(&mut buf, &b.subscription_id, "UnsubscribeOk.subscription_id")?
        }
        PduBody::PublishOk(b) => write_str16(&mut buf, &b.position, "PublishOk.position")?,
        PduBody::SubscriptionData(b) => encode_subscription_data(&mut buf, b)?,
        PduBody::HandshakeError(e)
        | PduBody::AuthenticateError(e)
        | PduBody::SubscribeError(e)
        | PduBody::UnsubscribeError(e)
        | PduBody::PublishError(e)
        | PduBody::SubscriptionError(e)
        | PduBody::SubscriptionInfo(e)
        | PduBody::GeneralError(e) => encode_error(&mut buf, e)?,
    }
    Ok(buf)
}

fn encode_subscription_data(
    buf: &mut Vec<u8>,
    b: &SubscriptionDataBody,
) -> Result<(), ProtocolError> {
    write_str16(buf, &b.subscription_id, "SubscriptionData.subscription_id")?;
    write_str16(buf, &b.position, "SubscriptionData.position")?;
    let (raw, count) = b.messages.unconsumed();
    buf.extend_from_slice(&(count as u32).to_be_bytes());
    buf.extend_from_slice(raw);
    Ok(())
}

fn encode_error(buf: &mut Vec<u8>, e: &ErrorBody) -> Result<(), ProtocolError> {
    match &e.subscription_id {
        Some(id) => {
            buf.push(0x01);
            write_str16(buf, id, "Error.subscription_id")?;
        }
        None => buf.push(0x00),
    }
    write_str16(buf, &e.error, "Error.error")?;
    write_str32(buf, &e.reason, "Error.reason")
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(action: Action, p: &[u8]) -> Result<PduBody, ProtocolError> {
    match action {
        Action::Handshake => {
            let (role, _) = read_str16(p, 0)?;
            Ok(PduBody::Handshake(HandshakeBody { role }))
        }
        Action::Authenticate => {
            let (nonce, off) = read_nonce(p, 0)?;
            let (proof, _) = read_str16(p, off)?;
            Ok(PduBody::Authenticate(AuthenticateBody { nonce, proof }))
        }
        Action::Subscribe => {
            let (channel, _) = read_str16(p, 0)?;
            Ok(PduBody::Subscribe(SubscribeBody { channel }))
        }
        Action::Unsubscribe => {
            let (subscription_id, _) = read_str16(p, 0)?;
            Ok(PduBody::Unsubscribe(UnsubscribeBody { subscription_id }))
        }
        Action::Publish => {
            let (channel, off) = read_str16(p, 0)?;
            let (message, _) = read_str32(p, off)?;
            Ok(PduBody::Publish(PublishBody { channel, message }))
        }
        Action::HandshakeOk => {
            let (nonce, _) = read_nonce(p, 0)?;
            Ok(PduBody::HandshakeOk(HandshakeOkBody { nonce }))
        }
        Action::AuthenticateOk => Ok(PduBody::AuthenticateOk),
        Action::SubscribeOk => {
            let (subscription_id, off) = read_str16(p, 0)?;
            let (position, _) = read_str16(p, off)?;
            Ok(PduBody::SubscribeOk(SubscribeOkBody {
                subscription_id,
                position,
            }))
        }
        Action::UnsubscribeOk => {
            let (subscription_id, _) = read_str16(p, 0)?;
            Ok(PduBody::UnsubscribeOk(UnsubscribeOkBody { subscription_id }))
        }
        Action::PublishOk => {
            let (position, _) = read_str16(p, 0)?;
            Ok(PduBody::PublishOk(PublishOkBody { position }))
        }
        Action::SubscriptionData => decode_subscription_data(p).map(PduBody::SubscriptionData),
        Action::HandshakeError => decode_error(p).map(PduBody::HandshakeError),
        Action::AuthenticateError => decode_error(p).map(PduBody::AuthenticateError),
        Action::SubscribeError => decode_error(p).map(PduBody::SubscribeError),
        Action::UnsubscribeError => decode_error(p).map(PduBody::UnsubscribeError),
        Action::PublishError => decode_error(p).map(PduBody::PublishError),
        Action::SubscriptionError => decode_error(p).map(PduBody::SubscriptionError),
        Action::SubscriptionInfo => decode_error(p).map(PduBody::SubscriptionInfo),
        Action::GeneralError => decode_error(p).map(PduBody::GeneralError),
    }
}

fn decode_subscription_data(p: &[u8]) -> Result<SubscriptionDataBody, ProtocolError> {
    let (subscription_id, off) = read_str16(p, 0)?;
    let (position, off) = read_str16(p, off)?;
    let count = read_u32(p, off)? as usize;
    let start = off + 4;

    // Walk every entry now so iteration later cannot fail.
    let mut cursor = start;
    for index in 0..count {
        let (_, end) = read_str32(p, cursor).map_err(|e| {
            ProtocolError::MalformedPayload(format!("SubscriptionData message {index}: {e}"))
        })?;
        cursor = end;
    }

    Ok(SubscriptionDataBody {
        subscription_id,
        position,
        messages: Messages::from_validated(p[start..cursor].to_vec(), count),
    })
}

fn decode_error(p: &[u8]) -> Result<ErrorBody, ProtocolError> {
    require_len(p, 1, "Error")?;
    let (subscription_id, off) = match p[0] {
        0x00 => (None, 1),
        0x01 => {
            let (id, off) = read_str16(p, 1)?;
            (Some(id), off)
        }
        other => {
            return Err(ProtocolError::MalformedPayload(format!(
                "unknown error scope marker: {other}"
            )))
        }
    };
    let (error, off) = read_str16(p, off)?;
    let (reason, _) = read_str32(p, off)?;
    Ok(ErrorBody {
        subscription_id,
        error,
        reason,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    let bytes: [u8; 4] = buf
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::InsufficientData {
            needed: offset + 4,
            available: buf.len(),
        })?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, ProtocolError> {
    let bytes: [u8; 8] = buf
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::InsufficientData {
            needed: offset + 8,
            available: buf.len(),
        })?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_nonce(buf: &[u8], offset: usize) -> Result<(Nonce, usize), ProtocolError> {
    let (raw, end) = read_str16(buf, offset)?;
    let nonce =
        Nonce::new(raw).map_err(|e| ProtocolError::MalformedPayload(format!("nonce: {e}")))?;
    Ok((nonce, end))
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
fn write_str16(buf: &mut Vec<u8>, s: &str, field: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| {
        ProtocolError::MalformedPayload(format!(
            "{field}: {} bytes does not fit a 16-bit length",
            s.len()
        ))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Writes a 4-byte length prefix followed by the UTF-8 string bytes.
fn write_str32(buf: &mut Vec<u8>, s: &str, field: &str) -> Result<(), ProtocolError> {
    if s.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "{field}: {} bytes exceeds payload limit of {MAX_PAYLOAD_LEN}",
            s.len()
        )));
    }
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
fn read_str16(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    read_utf8(buf, offset + 2, len)
}

/// Reads a 4-byte length prefix and then that many UTF-8 bytes.
fn read_str32(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    let len = read_u32(buf, offset).map_err(|_| {
        ProtocolError::MalformedPayload(format!(
            "need 4 bytes for string length at offset {offset}"
        ))
    })? as usize;
    read_utf8(buf, offset + 4, len)
}

fn read_utf8(buf: &[u8], start: usize, len: usize) -> Result<(String, usize), ProtocolError> {
    let bytes = buf.get(start..start + len).ok_or_else(|| {
        ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        ))
    })?;
    let s = std::str::from_utf8(bytes)
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
