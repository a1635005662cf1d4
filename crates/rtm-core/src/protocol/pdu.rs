//! All protocol data unit (PDU) types.
//!
//! A PDU is one discrete message exchanged over the connection.  Every PDU
//! carries exactly one [`Action`]; the fields that action defines live in the
//! matching [`PduBody`] variant, so a PDU cannot hold fields its action does
//! not own.
//!
//! Request PDUs (handshake, authenticate, subscribe, unsubscribe, publish) are
//! sent by the client with a request id.  Reply PDUs echo that id back.
//! Subscription PDUs and general errors are unsolicited and carry no id.

use std::fmt;
use std::iter::FusedIterator;

use thiserror::Error;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the frame header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Upper bound on the length of a server-issued nonce, in bytes.
pub const MAX_NONCE_LEN: usize = 1024;

// ── Action codes ──────────────────────────────────────────────────────────────

/// The closed set of PDU kinds, with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    // Requests (0x01–0x0F)
    Handshake = 0x01,
    Authenticate = 0x02,
    Subscribe = 0x03,
    Unsubscribe = 0x04,
    Publish = 0x05,
    // Replies (0x10–0x1F)
    HandshakeOk = 0x11,
    HandshakeError = 0x12,
    AuthenticateOk = 0x13,
    AuthenticateError = 0x14,
    SubscribeOk = 0x15,
    SubscribeError = 0x16,
    UnsubscribeOk = 0x17,
    UnsubscribeError = 0x18,
    PublishOk = 0x19,
    PublishError = 0x1A,
    // Unsolicited (0x20–0x2F)
    SubscriptionData = 0x20,
    SubscriptionError = 0x21,
    SubscriptionInfo = 0x22,
    GeneralError = 0x2F,
}

impl TryFrom<u8> for Action {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(Action::Handshake),
            0x02 => Ok(Action::Authenticate),
            0x03 => Ok(Action::Subscribe),
            0x04 => Ok(Action::Unsubscribe),
            0x05 => Ok(Action::Publish),
            0x11 => Ok(Action::HandshakeOk),
            0x12 => Ok(Action::HandshakeError),
            0x13 => Ok(Action::AuthenticateOk),
            0x14 => Ok(Action::AuthenticateError),
            0x15 => Ok(Action::SubscribeOk),
            0x16 => Ok(Action::SubscribeError),
            0x17 => Ok(Action::UnsubscribeOk),
            0x18 => Ok(Action::UnsubscribeError),
            0x19 => Ok(Action::PublishOk),
            0x1A => Ok(Action::PublishError),
            0x20 => Ok(Action::SubscriptionData),
            0x21 => Ok(Action::SubscriptionError),
            0x22 => Ok(Action::SubscriptionInfo),
            0x2F => Ok(Action::GeneralError),
            _ => Err(()),
        }
    }
}

impl Action {
    /// Protocol name of the action, e.g. `"rtm/subscribe/ok"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Handshake => "auth/handshake",
            Action::Authenticate => "auth/authenticate",
            Action::Subscribe => "rtm/subscribe",
            Action::Unsubscribe => "rtm/unsubscribe",
            Action::Publish => "rtm/publish",
            Action::HandshakeOk => "auth/handshake/ok",
            Action::HandshakeError => "auth/handshake/error",
            Action::AuthenticateOk => "auth/authenticate/ok",
            Action::AuthenticateError => "auth/authenticate/error",
            Action::SubscribeOk => "rtm/subscribe/ok",
            Action::SubscribeError => "rtm/subscribe/error",
            Action::UnsubscribeOk => "rtm/unsubscribe/ok",
            Action::UnsubscribeError => "rtm/unsubscribe/error",
            Action::PublishOk => "rtm/publish/ok",
            Action::PublishError => "rtm/publish/error",
            Action::SubscriptionData => "rtm/subscription/data",
            Action::SubscriptionError => "rtm/subscription/error",
            Action::SubscriptionInfo => "rtm/subscription/info",
            Action::GeneralError => "/error",
        }
    }

    /// Returns `true` for the error and informational kinds that are surfaced
    /// for logging rather than acted upon.
    pub fn is_error_or_info(self) -> bool {
        matches!(
            self,
            Action::HandshakeError
                | Action::AuthenticateError
                | Action::SubscribeError
                | Action::UnsubscribeError
                | Action::PublishError
                | Action::SubscriptionError
                | Action::SubscriptionInfo
                | Action::GeneralError
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Nonce ─────────────────────────────────────────────────────────────────────

/// Reasons a nonce value is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NonceError {
    #[error("nonce is empty")]
    Empty,
    #[error("nonce is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
}

/// Server-issued single-use value consumed by the authenticate step.
///
/// Stored at its full length; values over [`MAX_NONCE_LEN`] are refused
/// instead of being cut short.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nonce(String);

impl Nonce {
    /// Wraps `value` after checking it is non-empty and within [`MAX_NONCE_LEN`].
    ///
    /// # Errors
    ///
    /// Returns [`NonceError`] when the value is empty or too long.
    pub fn new(value: impl Into<String>) -> Result<Self, NonceError> {
        let value = value.into();
        if value.is_empty() {
            return Err(NonceError::Empty);
        }
        if value.len() > MAX_NONCE_LEN {
            return Err(NonceError::TooLong {
                len: value.len(),
                max: MAX_NONCE_LEN,
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Subscription messages ─────────────────────────────────────────────────────

/// Lazy, single-pass sequence of message payloads carried by a
/// subscription-data PDU.
///
/// Payloads are kept in their wire form (each one a 4-byte big-endian length
/// followed by UTF-8 bytes) and turned into `String`s one at a time as the
/// iterator advances.  Once exhausted it stays exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Messages {
    raw: Vec<u8>,
    offset: usize,
    remaining: usize,
}

impl Messages {
    /// Builds a message sequence from owned payload strings.
    pub fn from_strings<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw = Vec::new();
        let mut remaining = 0;
        for message in messages {
            let bytes = message.as_ref().as_bytes();
            raw.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            raw.extend_from_slice(bytes);
            remaining += 1;
        }
        Self {
            raw,
            offset: 0,
            remaining,
        }
    }

    /// Wraps wire bytes the codec has already checked: `count` entries, each
    /// length-prefixed and valid UTF-8, filling `raw` exactly.
    pub(crate) fn from_validated(raw: Vec<u8>, count: usize) -> Self {
        Self {
            raw,
            offset: 0,
            remaining: count,
        }
    }

    /// Wire bytes and count of the messages not yet consumed.
    pub(crate) fn unconsumed(&self) -> (&[u8], usize) {
        (&self.raw[self.offset..], self.remaining)
    }

    /// Number of messages not yet consumed.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

impl Iterator for Messages {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.remaining == 0 {
            return None;
        }
        let start = self.offset + 4;
        let len_bytes: [u8; 4] = self.raw.get(self.offset..start)?.try_into().ok()?;
        let end = start + u32::from_be_bytes(len_bytes) as usize;
        let payload = self.raw.get(start..end)?;
        self.offset = end;
        self.remaining -= 1;
        Some(String::from_utf8_lossy(payload).into_owned())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Messages {}

impl FusedIterator for Messages {}

// ── Per-action bodies ─────────────────────────────────────────────────────────

/// HANDSHAKE (0x01): opens authentication for `role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeBody {
    pub role: String,
}

/// AUTHENTICATE (0x02): answers the handshake challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateBody {
    /// Nonce captured from the handshake reply.
    pub nonce: Nonce,
    /// Response credential computed from the role secret and the nonce.
    pub proof: String,
}

/// SUBSCRIBE (0x03).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeBody {
    pub channel: String,
}

/// UNSUBSCRIBE (0x04).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeBody {
    pub subscription_id: String,
}

/// PUBLISH (0x05): `message` is passed through verbatim (JSON text or plain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishBody {
    pub channel: String,
    pub message: String,
}

/// HANDSHAKE_OK (0x11).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOkBody {
    pub nonce: Nonce,
}

/// SUBSCRIBE_OK (0x15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOkBody {
    pub subscription_id: String,
    /// Stream position the subscription starts from.
    pub position: String,
}

/// UNSUBSCRIBE_OK (0x17).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeOkBody {
    pub subscription_id: String,
}

/// PUBLISH_OK (0x19).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOkBody {
    /// Stream position assigned to the published message.
    pub position: String,
}

/// SUBSCRIPTION_DATA (0x20): zero or more messages published to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDataBody {
    pub subscription_id: String,
    pub position: String,
    pub messages: Messages,
}

/// Shared body of every error kind, and of SUBSCRIPTION_INFO (where `error`
/// holds the info code).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorBody {
    /// Set for subscription-scoped errors.
    pub subscription_id: Option<String>,
    pub error: String,
    pub reason: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subscription_id: None,
            error: error.into(),
            reason: reason.into(),
        }
    }

    pub fn for_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }
}

// ── Top-level PDU ─────────────────────────────────────────────────────────────

/// Action-specific content of a PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody {
    Handshake(HandshakeBody),
    Authenticate(AuthenticateBody),
    Subscribe(SubscribeBody),
    Unsubscribe(UnsubscribeBody),
    Publish(PublishBody),
    HandshakeOk(HandshakeOkBody),
    HandshakeError(ErrorBody),
    AuthenticateOk,
    AuthenticateError(ErrorBody),
    SubscribeOk(SubscribeOkBody),
    SubscribeError(ErrorBody),
    UnsubscribeOk(UnsubscribeOkBody),
    UnsubscribeError(ErrorBody),
    PublishOk(PublishOkBody),
    PublishError(ErrorBody),
    SubscriptionData(SubscriptionDataBody),
    SubscriptionError(ErrorBody),
    SubscriptionInfo(ErrorBody),
    GeneralError(ErrorBody),
}

impl PduBody {
    /// Returns the [`Action`] discriminant for this body.
    pub fn action(&self) -> Action {
        match self {
            PduBody::Handshake(_) => Action::Handshake,
            PduBody::Authenticate(_) => Action::Authenticate,
            PduBody::Subscribe(_) => Action::Subscribe,
            PduBody::Unsubscribe(_) => Action::Unsubscribe,
            PduBody::Publish(_) => Action::Publish,
            PduBody::HandshakeOk(_) => Action::HandshakeOk,
            PduBody::HandshakeError(_) => Action::HandshakeError,
            PduBody::AuthenticateOk => Action::AuthenticateOk,
            PduBody::AuthenticateError(_) => Action::AuthenticateError,
            PduBody::SubscribeOk(_) => Action::SubscribeOk,
            PduBody::SubscribeError(_) => Action::SubscribeError,
            PduBody::UnsubscribeOk(_) => Action::UnsubscribeOk,
            PduBody::UnsubscribeError(_) => Action::UnsubscribeError,
            PduBody::PublishOk(_) => Action::PublishOk,
            PduBody::PublishError(_) => Action::PublishError,
            PduBody::SubscriptionData(_) => Action::SubscriptionData,
            PduBody::SubscriptionError(_) => Action::SubscriptionError,
            PduBody::SubscriptionInfo(_) => Action::SubscriptionInfo,
            PduBody::GeneralError(_) => Action::GeneralError,
        }
    }
}

/// One protocol data unit: an optional request id plus an action body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    /// Present on requests and on the replies that answer them.
    pub request_id: Option<u64>,
    pub body: PduBody,
}

impl Pdu {
    /// An unsolicited PDU (no request id).
    pub fn new(body: PduBody) -> Self {
        Self {
            request_id: None,
            body,
        }
    }

    /// A request, or a reply to one, tagged with `request_id`.
    pub fn with_request_id(request_id: u64, body: PduBody) -> Self {
        Self {
            request_id: Some(request_id),
            body,
        }
    }

    pub fn action(&self) -> Action {
        self.body.action()
    }

    /// The error/info body, for the kinds that carry one.
    pub fn error(&self) -> Option<&ErrorBody> {
        match &self.body {
            PduBody::HandshakeError(e)
            | PduBody::AuthenticateError(e)
            | PduBody::SubscribeError(e)
            | PduBody::UnsubscribeError(e)
            | PduBody::PublishError(e)
            | PduBody::SubscriptionError(e)
            | PduBody::SubscriptionInfo(e)
            | PduBody::GeneralError(e) => Some(e),
            _ => None,
        }
    }

    /// The subscription id, for the kinds scoped to a subscription.
    pub fn subscription_id(&self) -> Option<&str> {
        match &self.body {
            PduBody::Unsubscribe(b) => Some(&b.subscription_id),
            PduBody::SubscribeOk(b) => Some(&b.subscription_id),
            PduBody::UnsubscribeOk(b) => Some(&b.subscription_id),
            PduBody::SubscriptionData(b) => Some(&b.subscription_id),
            _ => self.error().and_then(|e| e.subscription_id.as_deref()),
        }
    }
}
