//! # rtm-core
//!
//! Synchronous client core for a publish/subscribe messaging service: the
//! binary PDU codec, request/reply correlation, challenge-response
//! authentication, and a blocking dispatch loop.
//!
//! # Architecture overview (for beginners)
//!
//! An application opens one connection, optionally authenticates, subscribes
//! to named channels and publishes messages to them.  Everything happens on
//! the calling thread: each request is written, then the client blocks reading
//! replies until the matching one arrives or a deadline passes.
//!
//! - **`protocol`** – The messages ("PDUs") and how they are framed on the
//!   wire (16-byte header + payload), plus request ids and the registry that
//!   matches replies to the requests that caused them.
//!
//! - **`transport`** – The [`Transport`] trait the core reads from and writes
//!   to, and [`TcpTransport`], the stock implementation.
//!
//! - **`auth`** – The handshake → nonce → authenticate state machine.
//!
//! - **`dispatch`** – One blocking read with a timeout, routing every PDU to
//!   the application's [`PduHandler`].
//!
//! - **`client`** – [`Client`], which ties the pieces together.
//!
//! - **`testing`** – [`testing::ScriptedTransport`], an in-memory transport
//!   for tests.

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod protocol;
pub mod testing;
pub mod transport;

// Re-export the most-used types at the crate root so callers can write
// `rtm_core::Client` instead of `rtm_core::client::Client`.
pub use auth::{AuthError, AuthOutcome, CredentialSigner, Credentials, HmacSha256Signer};
pub use client::{Client, ClientOptions, PublishError, SubscribeError};
pub use dispatch::{default_pdu_handler, PduHandler, WaitStatus};
pub use protocol::{Action, Messages, Pdu, PduBody, ProtocolError};
pub use transport::{SendError, TcpTransport, Transport, TransportError};
