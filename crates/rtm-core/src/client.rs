//! Client facade: one connection, one handler, blocking request/reply.
//!
//! Every operation that needs a reply sends its request, then runs the
//! dispatch loop until the reply has been correlated or the request timeout
//! elapses.  PDUs that arrive meanwhile still reach the handler, in order.
//! `publish` is the exception: it returns the request id at once and the
//! caller collects the outcome with [`Client::publish_outcome`] after waiting.
//! Uncollected outcomes are kept for the most recent
//! [`ClientOptions::max_retained_replies`] resolved requests only.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthOutcome, AuthSession, CredentialSigner, Credentials, HmacSha256Signer};
use crate::dispatch::{self, PduHandler, WaitStatus};
use crate::protocol::{
    encode_pdu, Action, ErrorBody, Pdu, PduBody, PublishBody, RequestRegistry, SubscribeBody,
    UnsubscribeBody,
};
use crate::transport::{SendError, TcpTransport, Transport, TransportError};

/// How long blocking operations wait for their reply unless configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved replies kept for collection unless configured.
pub const DEFAULT_MAX_RETAINED_REPLIES: usize = 1024;

/// Per-client settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Deadline for each blocking request (handshake, authenticate,
    /// subscribe, unsubscribe).
    pub request_timeout: Duration,
    /// Upper bound on resolved replies held for [`Client::publish_outcome`].
    /// When exceeded, the oldest reply is dropped.
    pub max_retained_replies: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retained_replies: DEFAULT_MAX_RETAINED_REPLIES,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("failed to send request: {0}")]
    Send(#[source] SendError),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("rejected by server: {error}: {reason}")]
    Rejected { error: String, reason: String },
    #[error("connection failed while waiting for reply: {0}")]
    Transport(#[source] TransportError),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to send publish: {0}")]
    Send(#[source] SendError),
    #[error("publish rejected: {error}: {reason}")]
    Rejected { error: String, reason: String },
}

/// Summary of a reply that settled a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub request_id: u64,
    pub action: Action,
    pub subscription_id: Option<String>,
    pub position: Option<String>,
    pub error: Option<ErrorBody>,
}

impl Reply {
    fn from_pdu(request_id: u64, pdu: &Pdu) -> Self {
        let position = match &pdu.body {
            PduBody::SubscribeOk(b) => Some(b.position.clone()),
            PduBody::PublishOk(b) => Some(b.position.clone()),
            _ => None,
        };
        Self {
            request_id,
            action: pdu.action(),
            subscription_id: pdu.subscription_id().map(str::to_string),
            position,
            error: pdu.error().cloned(),
        }
    }

    /// Error code and reason, empty when the reply carried none.
    fn into_rejection(self) -> (String, String) {
        let body = self.error.unwrap_or_default();
        (body.error, body.reason)
    }
}

/// Resolved replies waiting to be collected, oldest first.
#[derive(Debug, Default)]
struct ReplyStore {
    replies: HashMap<u64, Reply>,
    order: VecDeque<u64>,
}

impl ReplyStore {
    /// Stores `reply`, dropping the oldest entries beyond `capacity`.
    fn insert(&mut self, reply: Reply, capacity: usize) {
        let request_id = reply.request_id;
        if self.replies.insert(request_id, reply).is_none() {
            self.order.push_back(request_id);
        }
        while self.order.len() > capacity.max(1) {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.replies.remove(&oldest).is_some() {
                debug!(request_id = oldest, "dropped uncollected reply");
            }
        }
    }

    fn take(&mut self, request_id: u64) -> Option<Reply> {
        let reply = self.replies.remove(&request_id)?;
        self.order.retain(|&id| id != request_id);
        Some(reply)
    }

    fn len(&self) -> usize {
        self.replies.len()
    }

    fn clear(&mut self) {
        self.replies.clear();
        self.order.clear();
    }
}

/// A connection to the pub/sub service.
///
/// `H` is the application's handler and doubles as its context: read it back
/// with [`Client::handler`] / [`Client::handler_mut`].
pub struct Client<H, T = TcpTransport> {
    transport: Option<T>,
    handler: H,
    options: ClientOptions,
    signer: Box<dyn CredentialSigner>,
    requests: RequestRegistry,
    replies: ReplyStore,
}

impl<H: PduHandler> Client<H, TcpTransport> {
    /// Opens a TCP connection to `endpoint` and presents `app_key`.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] that prevented the connection.
    pub fn connect(endpoint: &str, app_key: &str, handler: H) -> Result<Self, TransportError> {
        let transport = TcpTransport::connect(endpoint, app_key)?;
        Ok(Self::with_transport(transport, handler))
    }
}

impl<H: PduHandler, T: Transport> Client<H, T> {
    /// Wraps an already-open transport.
    pub fn with_transport(transport: T, handler: H) -> Self {
        Self {
            transport: Some(transport),
            handler,
            options: ClientOptions::default(),
            signer: Box::new(HmacSha256Signer),
            requests: RequestRegistry::new(),
            replies: ReplyStore::default(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the proof algorithm used by
    /// [`Client::handshake_and_authenticate`].
    pub fn with_signer(mut self, signer: impl CredentialSigner + 'static) -> Self {
        self.signer = Box::new(signer);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Consumes the client, closing the connection, and returns the handler.
    pub fn into_handler(mut self) -> H {
        self.close();
        self.handler
    }

    /// Authenticates with `credentials`.  With `None` nothing is sent and the
    /// result is [`AuthOutcome::NotRequired`].
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] describing which step failed and how.
    pub fn handshake_and_authenticate(
        &mut self,
        credentials: Option<&Credentials>,
    ) -> Result<AuthOutcome, AuthError> {
        let Some(credentials) = credentials else {
            debug!("no credentials supplied; skipping authentication");
            return Ok(AuthOutcome::NotRequired);
        };
        let mut session = AuthSession::new(credentials);

        let request_id = self.requests.next_request_id();
        let handshake = session.handshake(request_id)?;
        self.send(handshake, &[Action::HandshakeOk, Action::HandshakeError])
            .map_err(AuthError::HandshakeSend)?;
        self.drive_auth(&mut session)?;

        let request_id = self.requests.next_request_id();
        let authenticate = session.authenticate(request_id, &*self.signer)?;
        self.send(authenticate, &[Action::AuthenticateOk, Action::AuthenticateError])
            .map_err(AuthError::AuthenticateSend)?;
        self.drive_auth(&mut session)?;

        info!(role = %credentials.role, "authenticated");
        Ok(AuthOutcome::Authenticated)
    }

    /// Subscribes to `channel` and returns the subscription id.
    ///
    /// # Errors
    ///
    /// Distinguishes send failure, rejection, timeout and connection loss.
    pub fn subscribe(&mut self, channel: &str) -> Result<String, SubscribeError> {
        let request_id = self.requests.next_request_id();
        let request = Pdu::with_request_id(
            request_id,
            PduBody::Subscribe(SubscribeBody {
                channel: channel.to_string(),
            }),
        );
        let reply = self.request(request, &[Action::SubscribeOk, Action::SubscribeError])?;
        if reply.action != Action::SubscribeOk {
            let (error, reason) = reply.into_rejection();
            warn!("subscribe to {channel:?} rejected: {error}: {reason}");
            return Err(SubscribeError::Rejected { error, reason });
        }
        let subscription_id = reply.subscription_id.unwrap_or_else(|| channel.to_string());
        info!(%subscription_id, position = ?reply.position, "subscribed to {channel:?}");
        Ok(subscription_id)
    }

    /// Ends the subscription `subscription_id`.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Client::subscribe`].
    pub fn unsubscribe(&mut self, subscription_id: &str) -> Result<(), SubscribeError> {
        let request_id = self.requests.next_request_id();
        let request = Pdu::with_request_id(
            request_id,
            PduBody::Unsubscribe(UnsubscribeBody {
                subscription_id: subscription_id.to_string(),
            }),
        );
        let reply = self.request(request, &[Action::UnsubscribeOk, Action::UnsubscribeError])?;
        if reply.action != Action::UnsubscribeOk {
            let (error, reason) = reply.into_rejection();
            warn!("unsubscribe from {subscription_id:?} rejected: {error}: {reason}");
            return Err(SubscribeError::Rejected { error, reason });
        }
        info!(%subscription_id, "unsubscribed");
        Ok(())
    }

    /// Sends a publish request and returns its request id without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Send`] when the request could not be written.
    pub fn publish(&mut self, channel: &str, message: &str) -> Result<u64, PublishError> {
        let request_id = self.requests.next_request_id();
        let request = Pdu::with_request_id(
            request_id,
            PduBody::Publish(PublishBody {
                channel: channel.to_string(),
                message: message.to_string(),
            }),
        );
        self.send(request, &[Action::PublishOk, Action::PublishError])
            .map_err(PublishError::Send)?;
        Ok(request_id)
    }

    /// Outcome of the publish `request_id`: `None` until its reply has been
    /// dispatched, then the assigned position or the rejection.  Each outcome
    /// is handed out once.
    ///
    /// Outcomes nobody collects are held until [`Client::forget`], until
    /// [`ClientOptions::max_retained_replies`] newer replies push them out, or
    /// until [`Client::close`].
    pub fn publish_outcome(&mut self, request_id: u64) -> Option<Result<String, PublishError>> {
        let reply = self.replies.take(request_id)?;
        Some(match reply.action {
            Action::PublishOk => Ok(reply.position.unwrap_or_default()),
            _ => {
                let (error, reason) = reply.into_rejection();
                Err(PublishError::Rejected { error, reason })
            }
        })
    }

    /// Stops tracking `request_id`: a pending request is no longer awaited and
    /// a reply already received is dropped.  Returns whether anything was
    /// tracked.
    pub fn forget(&mut self, request_id: u64) -> bool {
        let was_pending = self.requests.cancel(request_id).is_some();
        let had_reply = self.replies.take(request_id).is_some();
        was_pending || had_reply
    }

    /// True while a request is still waiting for its reply.
    pub fn is_pending(&self, request_id: u64) -> bool {
        self.requests.is_pending(request_id)
    }

    /// Number of resolved replies not yet collected.
    pub fn retained_replies(&self) -> usize {
        self.replies.len()
    }

    /// Runs the dispatch loop once, for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] that made the connection unusable.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<WaitStatus, TransportError> {
        self.dispatch(timeout, &mut |_| {})
    }

    /// Releases the transport and forgets every pending request and unread
    /// reply.  Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            info!("client closed");
        }
        self.requests.clear();
        self.replies.clear();
    }

    /// Encodes `pdu`, registers its request id and writes it.
    fn send(&mut self, pdu: Pdu, expected: &[Action]) -> Result<(), SendError> {
        let transport = self.transport.as_mut().ok_or(TransportError::NotConnected)?;
        let bytes = encode_pdu(&pdu)?;
        if let Some(request_id) = pdu.request_id {
            self.requests.register(request_id, expected)?;
        }
        if let Err(e) = transport.write(&bytes) {
            if let Some(request_id) = pdu.request_id {
                self.requests.cancel(request_id);
            }
            return Err(e.into());
        }
        debug!(action = %pdu.action(), request_id = ?pdu.request_id, "sent pdu");
        Ok(())
    }

    /// Sends `request` and blocks until its reply or the request timeout.
    fn request(&mut self, request: Pdu, expected: &[Action]) -> Result<Reply, SubscribeError> {
        let request_id = request.request_id.unwrap_or_default();
        self.send(request, expected).map_err(SubscribeError::Send)?;
        let timeout = self.options.request_timeout;
        match self.await_reply(request_id, timeout) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => {
                warn!(request_id, "no reply within {timeout:?}");
                Err(SubscribeError::Timeout(timeout))
            }
            Err(e) => Err(SubscribeError::Transport(e)),
        }
    }

    /// Dispatches until `request_id` has a reply.  `None` on timeout, in which
    /// case the pending entry is dropped.
    fn await_reply(
        &mut self,
        request_id: u64,
        timeout: Duration,
    ) -> Result<Option<Reply>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = self.replies.take(request_id) {
                return Ok(Some(reply));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.requests.cancel(request_id);
                return Ok(None);
            }
            self.dispatch(remaining, &mut |_| {})?;
        }
    }

    /// Drives `session` until its outstanding reply arrives, it fails, or the
    /// request timeout elapses.  However it ends, the request is no longer
    /// pending afterwards and no reply is kept for it.
    fn drive_auth(&mut self, session: &mut AuthSession<'_>) -> Result<(), AuthError> {
        let Some(request_id) = session.pending_request_id() else {
            return session.take_failure().map_or(Ok(()), Err);
        };
        let result = self.drive_auth_reply(session);
        self.requests.cancel(request_id);
        self.replies.take(request_id);
        result
    }

    fn drive_auth_reply(&mut self, session: &mut AuthSession<'_>) -> Result<(), AuthError> {
        let timeout = self.options.request_timeout;
        let deadline = Instant::now() + timeout;
        while session.is_waiting() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(session.time_out(timeout));
            }
            self.dispatch(remaining, &mut |pdu| session.observe(pdu))
                .map_err(AuthError::Transport)?;
        }
        session.take_failure().map_or(Ok(()), Err)
    }

    /// One dispatch pass: correlation first, then `observe`, then the handler.
    fn dispatch(
        &mut self,
        timeout: Duration,
        observe: &mut dyn FnMut(&Pdu),
    ) -> Result<WaitStatus, TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::NotConnected)?;
        let requests = &mut self.requests;
        let replies = &mut self.replies;
        let handler = &mut self.handler;
        let capacity = self.options.max_retained_replies;
        dispatch::wait_timeout(transport, timeout, |pdu| {
            if let Some(resolved) = requests.resolve(&pdu) {
                replies.insert(Reply::from_pdu(resolved.request_id, &pdu), capacity);
            }
            observe(&pdu);
            handler.on_pdu(pdu);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::protocol::{decode_pdu, PublishOkBody, SubscribeOkBody};
    use crate::transport::MockTransport;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn noop(_: Pdu) {}

    #[test]
    fn test_default_options_use_ten_second_timeout() {
        assert_eq!(ClientOptions::default().request_timeout, Duration::from_secs(10));
    }

    fn publish_ok_reply(request_id: u64) -> Reply {
        Reply::from_pdu(
            request_id,
            &Pdu::with_request_id(
                request_id,
                PduBody::PublishOk(PublishOkBody {
                    position: "1:0".into(),
                }),
            ),
        )
    }

    #[test]
    fn test_reply_store_evicts_oldest_beyond_capacity() {
        // Arrange
        let mut store = ReplyStore::default();

        // Act
        for request_id in 1..=3 {
            store.insert(publish_ok_reply(request_id), 2);
        }

        // Assert
        assert_eq!(store.len(), 2);
        assert!(store.take(1).is_none());
        assert!(store.take(2).is_some());
        assert_eq!(store.order, VecDeque::from([3]));
    }

    #[test]
    fn test_reply_store_keeps_latest_reply_at_zero_capacity() {
        let mut store = ReplyStore::default();

        store.insert(publish_ok_reply(1), 0);
        store.insert(publish_ok_reply(2), 0);

        assert_eq!(store.len(), 1);
        assert!(store.take(2).is_some());
    }

    #[test]
    fn test_publish_writes_request_and_returns_id() {
        // Arrange
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&written);
        let mut transport = MockTransport::new();
        transport.expect_write().times(1).returning(move |bytes| {
            sink.lock().unwrap().push(decode_pdu(bytes).unwrap().0);
            Ok(())
        });
        let mut client = Client::with_transport(transport, noop);

        // Act
        let request_id = client.publish("animals", r#"{"who":"zebra"}"#).unwrap();

        // Assert
        assert_eq!(request_id, 1);
        assert!(client.is_pending(request_id));
        let written = written.lock().unwrap();
        assert_eq!(
            written[0].body,
            PduBody::Publish(PublishBody {
                channel: "animals".into(),
                message: r#"{"who":"zebra"}"#.into(),
            })
        );
    }

    #[test]
    fn test_failed_write_surfaces_send_error_and_drops_entry() {
        let mut transport = MockTransport::new();
        transport.expect_write().returning(|_| {
            Err(TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        });
        let mut client = Client::with_transport(transport, noop);

        let result = client.publish("animals", "x");

        assert!(matches!(
            result,
            Err(PublishError::Send(SendError::Transport(TransportError::Io(_))))
        ));
        assert!(!client.is_pending(1));
    }

    #[test]
    fn test_handshake_write_failure_is_handshake_send() {
        let mut transport = MockTransport::new();
        transport
            .expect_write()
            .returning(|_| Err(TransportError::Closed));
        let mut client = Client::with_transport(transport, noop);
        let credentials = Credentials::new("role", "secret");

        let result = client.handshake_and_authenticate(Some(&credentials));

        assert!(matches!(result, Err(AuthError::HandshakeSend(_))));
    }

    #[test]
    fn test_subscribe_returns_server_subscription_id() {
        // Arrange
        let mut transport = MockTransport::new();
        transport.expect_write().returning(|_| Ok(()));
        transport.expect_read_pdus().returning(|_| {
            Ok(vec![Pdu::with_request_id(
                1,
                PduBody::SubscribeOk(SubscribeOkBody {
                    subscription_id: "sub-animals".into(),
                    position: "10:0".into(),
                }),
            )])
        });
        let mut client = Client::with_transport(transport, noop);

        // Act
        let subscription_id = client.subscribe("animals").unwrap();

        // Assert
        assert_eq!(subscription_id, "sub-animals");
        assert!(!client.is_pending(1));
    }

    #[test]
    fn test_read_failure_while_subscribing_is_transport_error() {
        let mut transport = MockTransport::new();
        transport.expect_write().returning(|_| Ok(()));
        transport
            .expect_read_pdus()
            .returning(|_| Err(TransportError::Closed));
        let mut client = Client::with_transport(transport, noop);

        let result = client.subscribe("animals");

        assert!(matches!(
            result,
            Err(SubscribeError::Transport(TransportError::Closed))
        ));
    }

    #[test]
    fn test_reply_reaches_handler_after_correlation() {
        // Arrange
        let mut transport = MockTransport::new();
        transport.expect_write().returning(|_| Ok(()));
        transport.expect_read_pdus().times(1).returning(|_| {
            Ok(vec![Pdu::with_request_id(
                1,
                PduBody::PublishOk(PublishOkBody {
                    position: "3:1".into(),
                }),
            )])
        });
        let mut seen = Vec::new();
        let mut client = Client::with_transport(transport, |pdu: Pdu| seen.push(pdu.action()));

        // Act
        let request_id = client.publish("animals", "x").unwrap();
        let status = client.wait_timeout(Duration::from_millis(5)).unwrap();
        let outcome = client.publish_outcome(request_id);
        let second = client.publish_outcome(request_id);
        drop(client);

        // Assert
        assert_eq!(status, WaitStatus::Dispatched(1));
        assert!(matches!(outcome, Some(Ok(position)) if position == "3:1"));
        assert!(second.is_none(), "outcomes are handed out once");
        assert_eq!(seen, vec![Action::PublishOk]);
    }

    #[test]
    fn test_close_is_idempotent_and_disconnects() {
        // Arrange
        let mut transport = MockTransport::new();
        transport.expect_close().times(1).return_const(());
        let mut client = Client::with_transport(transport, noop);

        // Act
        client.close();
        client.close();

        // Assert
        assert!(!client.is_connected());
        assert!(matches!(
            client.wait_timeout(Duration::ZERO),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            client.publish("animals", "x"),
            Err(PublishError::Send(SendError::Transport(TransportError::NotConnected)))
        ));
    }
}
