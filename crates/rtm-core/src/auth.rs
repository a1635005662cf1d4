//! Challenge-response authentication.
//!
//! # Flow
//!
//! ```text
//! Unauthenticated ──handshake(role)──► HandshakeSent
//! HandshakeSent   ──HandshakeOk(nonce)──► NonceReceived
//! NonceReceived   ──authenticate(proof)──► AuthenticateSent
//! AuthenticateSent ──AuthenticateOk──► Authenticated
//! ```
//!
//! Anything else arriving while a reply is awaited moves the session to
//! `Failed`.  [`AuthSession`] only tracks state and builds request PDUs; the
//! client drives it by sending those requests and feeding every dispatched PDU
//! to [`AuthSession::observe`].

use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{Action, AuthenticateBody, HandshakeBody, Nonce, Pdu, PduBody};
use crate::transport::{SendError, TransportError};

/// Role name and its secret.  Both are required; a connection without a role
/// simply passes no credentials.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub role: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(role: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("role", &self.role)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Computes the proof sent in the authenticate request.
pub trait CredentialSigner {
    fn sign(&self, secret: &str, nonce: &Nonce) -> String;
}

/// HMAC-SHA256 of the nonce keyed by the role secret, as lowercase hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha256Signer;

impl CredentialSigner for HmacSha256Signer {
    fn sign(&self, secret: &str, nonce: &Nonce) -> String {
        let tag = hmac_sha256::HMAC::mac(nonce.as_str().as_bytes(), secret.as_bytes());
        let mut hex = String::with_capacity(tag.len() * 2);
        for byte in tag {
            // Writing into a String cannot fail.
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

/// Which request an authentication failure relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    Handshake,
    Authenticate,
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStage::Handshake => f.write_str("handshake"),
            AuthStage::Authenticate => f.write_str("authenticate"),
        }
    }
}

/// Why an authentication attempt failed.  Every variant is final for the
/// attempt; nothing is retried.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to send handshake: {0}")]
    HandshakeSend(#[source] SendError),
    #[error("no handshake reply within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("failed to send authenticate: {0}")]
    AuthenticateSend(#[source] SendError),
    #[error("no authenticate reply within {0:?}")]
    AuthenticateTimeout(Duration),
    #[error("{stage} rejected: {error}: {reason}")]
    Rejected {
        stage: AuthStage,
        error: String,
        reason: String,
    },
    #[error("unexpected {action} while waiting for {stage} reply")]
    UnexpectedReply { stage: AuthStage, action: Action },
    #[error("authentication step out of order (state: {0})")]
    InvalidState(&'static str),
    #[error("connection failed during authentication: {0}")]
    Transport(#[source] TransportError),
}

/// Successful result of [`crate::client::Client::handshake_and_authenticate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No credentials were supplied; nothing was sent.
    NotRequired,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    HandshakeSent { request_id: u64 },
    NonceReceived { nonce: Nonce },
    AuthenticateSent { request_id: u64 },
    Authenticated,
    Failed,
}

impl AuthState {
    fn name(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::HandshakeSent { .. } => "handshake sent",
            AuthState::NonceReceived { .. } => "nonce received",
            AuthState::AuthenticateSent { .. } => "authenticate sent",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        }
    }
}

/// One authentication attempt.
#[derive(Debug)]
pub struct AuthSession<'a> {
    credentials: &'a Credentials,
    state: AuthState,
    failure: Option<AuthError>,
}

impl<'a> AuthSession<'a> {
    pub fn new(credentials: &'a Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::Unauthenticated,
            failure: None,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// True while a handshake or authenticate reply is outstanding.
    pub fn is_waiting(&self) -> bool {
        self.pending_request_id().is_some()
    }

    /// Request id of the outstanding reply, if any.
    pub fn pending_request_id(&self) -> Option<u64> {
        match self.state {
            AuthState::HandshakeSent { request_id } | AuthState::AuthenticateSent { request_id } => {
                Some(request_id)
            }
            _ => None,
        }
    }

    /// Builds the handshake request and moves to `HandshakeSent`.
    pub fn handshake(&mut self, request_id: u64) -> Result<Pdu, AuthError> {
        if self.state != AuthState::Unauthenticated {
            return Err(AuthError::InvalidState(self.state.name()));
        }
        self.state = AuthState::HandshakeSent { request_id };
        Ok(Pdu::with_request_id(
            request_id,
            PduBody::Handshake(HandshakeBody {
                role: self.credentials.role.clone(),
            }),
        ))
    }

    /// Signs the captured nonce, builds the authenticate request and moves to
    /// `AuthenticateSent`.
    pub fn authenticate(
        &mut self,
        request_id: u64,
        signer: &dyn CredentialSigner,
    ) -> Result<Pdu, AuthError> {
        let AuthState::NonceReceived { nonce } = &self.state else {
            return Err(AuthError::InvalidState(self.state.name()));
        };
        let nonce = nonce.clone();
        let proof = signer.sign(&self.credentials.secret, &nonce);
        self.state = AuthState::AuthenticateSent { request_id };
        Ok(Pdu::with_request_id(
            request_id,
            PduBody::Authenticate(AuthenticateBody { nonce, proof }),
        ))
    }

    /// Feeds one dispatched PDU to the machine.  Ignored unless a reply is
    /// outstanding.
    pub fn observe(&mut self, pdu: &Pdu) {
        match self.state {
            AuthState::HandshakeSent { request_id } => {
                let stage = AuthStage::Handshake;
                match &pdu.body {
                    PduBody::HandshakeOk(ok) if pdu.request_id == Some(request_id) => {
                        debug!("handshake accepted, nonce received");
                        self.state = AuthState::NonceReceived {
                            nonce: ok.nonce.clone(),
                        };
                    }
                    PduBody::HandshakeError(e) if pdu.request_id == Some(request_id) => {
                        self.fail(AuthError::Rejected {
                            stage,
                            error: e.error.clone(),
                            reason: e.reason.clone(),
                        });
                    }
                    _ => self.fail(AuthError::UnexpectedReply {
                        stage,
                        action: pdu.action(),
                    }),
                }
            }
            AuthState::AuthenticateSent { request_id } => {
                let stage = AuthStage::Authenticate;
                match &pdu.body {
                    PduBody::AuthenticateOk if pdu.request_id == Some(request_id) => {
                        self.state = AuthState::Authenticated;
                    }
                    PduBody::AuthenticateError(e) if pdu.request_id == Some(request_id) => {
                        self.fail(AuthError::Rejected {
                            stage,
                            error: e.error.clone(),
                            reason: e.reason.clone(),
                        });
                    }
                    _ => self.fail(AuthError::UnexpectedReply {
                        stage,
                        action: pdu.action(),
                    }),
                }
            }
            _ => {}
        }
    }

    /// Marks the outstanding step as timed out and returns the matching error.
    pub fn time_out(&mut self, timeout: Duration) -> AuthError {
        let error = match self.state {
            AuthState::AuthenticateSent { .. } => AuthError::AuthenticateTimeout(timeout),
            _ => AuthError::HandshakeTimeout(timeout),
        };
        warn!("{error}");
        self.state = AuthState::Failed;
        error
    }

    /// Takes the recorded failure, if the session has failed.
    pub fn take_failure(&mut self) -> Option<AuthError> {
        self.failure.take()
    }

    fn fail(&mut self, error: AuthError) {
        warn!("authentication failed: {error}");
        self.state = AuthState::Failed;
        self.failure = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorBody, HandshakeOkBody, PublishOkBody};

    fn creds() -> Credentials {
        Credentials::new("publisher", "s3cret")
    }

    fn handshake_ok(request_id: u64, nonce: &str) -> Pdu {
        Pdu::with_request_id(
            request_id,
            PduBody::HandshakeOk(HandshakeOkBody {
                nonce: Nonce::new(nonce).unwrap(),
            }),
        )
    }

    /// Signer that echoes its inputs so tests can see what it was given.
    struct EchoSigner;

    impl CredentialSigner for EchoSigner {
        fn sign(&self, secret: &str, nonce: &Nonce) -> String {
            format!("{secret}/{nonce}")
        }
    }

    #[test]
    fn test_full_exchange_reaches_authenticated_with_captured_nonce() {
        // Arrange
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);

        // Act
        let handshake = session.handshake(1).unwrap();
        session.observe(&handshake_ok(1, "abc123"));
        let authenticate = session.authenticate(2, &EchoSigner).unwrap();
        session.observe(&Pdu::with_request_id(2, PduBody::AuthenticateOk));

        // Assert
        assert_eq!(
            handshake.body,
            PduBody::Handshake(HandshakeBody {
                role: "publisher".into()
            })
        );
        let PduBody::Authenticate(body) = authenticate.body else {
            panic!("expected authenticate body");
        };
        assert_eq!(body.nonce.as_str(), "abc123");
        assert_eq!(body.proof, "s3cret/abc123");
        assert!(session.is_authenticated());
        assert!(session.take_failure().is_none());
    }

    #[test]
    fn test_authenticate_before_nonce_is_invalid_state() {
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);
        session.handshake(1).unwrap();

        let result = session.authenticate(2, &HmacSha256Signer);

        assert!(matches!(result, Err(AuthError::InvalidState("handshake sent"))));
    }

    #[test]
    fn test_second_handshake_is_invalid_state() {
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);
        session.handshake(1).unwrap();

        assert!(matches!(session.handshake(2), Err(AuthError::InvalidState(_))));
    }

    #[test]
    fn test_handshake_error_fails_with_reason() {
        // Arrange
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);
        session.handshake(1).unwrap();

        // Act
        session.observe(&Pdu::with_request_id(
            1,
            PduBody::HandshakeError(ErrorBody::new("auth_failed", "unknown role")),
        ));

        // Assert
        assert_eq!(session.state(), &AuthState::Failed);
        match session.take_failure() {
            Some(AuthError::Rejected { stage, reason, .. }) => {
                assert_eq!(stage, AuthStage::Handshake);
                assert_eq!(reason, "unknown role");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_pdu_while_waiting_for_handshake_fails() {
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);
        session.handshake(1).unwrap();

        session.observe(&Pdu::with_request_id(
            1,
            PduBody::PublishOk(PublishOkBody {
                position: "0".into(),
            }),
        ));

        assert!(matches!(
            session.take_failure(),
            Some(AuthError::UnexpectedReply {
                stage: AuthStage::Handshake,
                action: Action::PublishOk
            })
        ));
    }

    #[test]
    fn test_handshake_ok_for_other_request_fails() {
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);
        session.handshake(1).unwrap();

        session.observe(&handshake_ok(9, "abc123"));

        assert_eq!(session.state(), &AuthState::Failed);
    }

    #[test]
    fn test_nonce_is_not_replaced_by_a_late_handshake_reply() {
        // Arrange
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);
        session.handshake(1).unwrap();
        session.observe(&handshake_ok(1, "first"));

        // Act
        session.observe(&handshake_ok(1, "second"));

        // Assert
        assert_eq!(
            session.state(),
            &AuthState::NonceReceived {
                nonce: Nonce::new("first").unwrap()
            }
        );
    }

    #[test]
    fn test_authenticate_error_fails() {
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);
        session.handshake(1).unwrap();
        session.observe(&handshake_ok(1, "n"));
        session.authenticate(2, &HmacSha256Signer).unwrap();

        session.observe(&Pdu::with_request_id(
            2,
            PduBody::AuthenticateError(ErrorBody::new("auth_failed", "bad proof")),
        ));

        assert!(!session.is_authenticated());
        assert!(matches!(
            session.take_failure(),
            Some(AuthError::Rejected {
                stage: AuthStage::Authenticate,
                ..
            })
        ));
    }

    #[test]
    fn test_time_out_picks_variant_from_state() {
        let credentials = creds();
        let mut session = AuthSession::new(&credentials);
        session.handshake(1).unwrap();
        session.observe(&handshake_ok(1, "n"));
        session.authenticate(2, &HmacSha256Signer).unwrap();

        let error = session.time_out(Duration::from_secs(10));

        assert!(matches!(error, AuthError::AuthenticateTimeout(_)));
        assert!(!session.is_waiting());
    }

    #[test]
    fn test_hmac_signer_is_deterministic_hex() {
        let nonce = Nonce::new("abc123").unwrap();

        let a = HmacSha256Signer.sign("secret", &nonce);
        let b = HmacSha256Signer.sign("secret", &nonce);
        let other = HmacSha256Signer.sign("other", &nonce);

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let rendered = format!("{:?}", creds());

        assert!(rendered.contains("publisher"));
        assert!(!rendered.contains("s3cret"));
    }
}
