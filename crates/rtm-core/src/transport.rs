//! Transport boundary and the framed TCP transport.
//!
//! The client core talks to the network only through the [`Transport`]
//! trait: it writes encoded request bytes and reads back decoded PDUs with a
//! deadline.  [`TcpTransport`] is the stock implementation; tests use
//! [`crate::testing::ScriptedTransport`].
//!
//! # Connection opening
//!
//! After the TCP connect, [`TcpTransport::connect`] sends a preamble carrying
//! the application key:
//!
//! ```text
//! ["RTM1":4][key_len:2][app_key:N]
//! ```
//!
//! and waits for a single status byte.  `0x00` accepts the connection; any
//! other value is a rejection code.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{FrameDecoder, Pdu, ProtocolError, RegistryError};

/// Port used when the endpoint does not name one.
pub const DEFAULT_PORT: u16 = 6580;

/// How long opening a connection may take, including the key exchange.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const PREAMBLE_MAGIC: &[u8; 4] = b"RTM1";
const STATUS_ACCEPTED: u8 = 0x00;
const READ_CHUNK: usize = 8 * 1024;

/// Connection-level failures.  After any of these the connection is unusable.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint string could not be resolved to an address.
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    /// The application key is empty or too long to send.
    #[error("invalid application key")]
    InvalidAppKey,
    /// TCP connection to the endpoint failed.
    #[error("failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    /// The server refused the application key.
    #[error("connection rejected by server (status 0x{0:02X})")]
    Rejected(u8),
    /// An I/O error occurred on the established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
    /// The connection was closed by the remote side.
    #[error("connection closed by server")]
    Closed,
    /// The transport was never opened or has been closed locally.
    #[error("not connected")]
    NotConnected,
    /// The byte stream cannot be split into frames any more.
    #[error("unrecoverable framing error: {0}")]
    Framing(ProtocolError),
}

/// Failure to put a request on the wire.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to encode request: {0}")]
    Encode(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Ordered channel to the server.
///
/// `read_pdus` blocks for at most `timeout`.  An empty vector means the
/// deadline passed with nothing received; a zero timeout polls.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Writes one encoded frame.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Returns the PDUs that became available within `timeout`, in arrival order.
    fn read_pdus(&mut self, timeout: Duration) -> Result<Vec<Pdu>, TransportError>;

    /// Releases the connection.  Calling it more than once is harmless.
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes)
    }

    fn read_pdus(&mut self, timeout: Duration) -> Result<Vec<Pdu>, TransportError> {
        (**self).read_pdus(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

// ── TCP transport ─────────────────────────────────────────────────────────────

/// Framed transport over a blocking TCP stream.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    decoder: FrameDecoder,
    ready: VecDeque<Pdu>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connects to `endpoint` (`host:port`, `host`, or either with an `rtm://`
    /// or `tcp://` prefix) and presents `app_key`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidEndpoint`] / [`TransportError::InvalidAppKey`]
    /// for bad input, [`TransportError::ConnectFailed`] when the endpoint is
    /// unreachable, and [`TransportError::Rejected`] when the server refuses
    /// the key.
    pub fn connect(endpoint: &str, app_key: &str) -> Result<Self, TransportError> {
        let key_len = u16::try_from(app_key.len()).map_err(|_| TransportError::InvalidAppKey)?;
        if key_len == 0 {
            return Err(TransportError::InvalidAppKey);
        }
        let peer = resolve_endpoint(endpoint)?;

        let mut stream = TcpStream::connect_timeout(&peer, CONNECT_TIMEOUT).map_err(|source| {
            TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;
        stream.set_nodelay(true)?;

        let mut preamble = Vec::with_capacity(PREAMBLE_MAGIC.len() + 2 + app_key.len());
        preamble.extend_from_slice(PREAMBLE_MAGIC);
        preamble.extend_from_slice(&key_len.to_be_bytes());
        preamble.extend_from_slice(app_key.as_bytes());
        stream.write_all(&preamble)?;

        stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
        let mut status = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut status) {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => TransportError::Closed,
                _ => TransportError::Io(e),
            });
        }
        if status[0] != STATUS_ACCEPTED {
            warn!("server at {peer} rejected the application key (0x{:02X})", status[0]);
            return Err(TransportError::Rejected(status[0]));
        }

        info!("connected to {peer}");
        Ok(Self {
            stream: Some(stream),
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            peer,
        })
    }

    /// Address of the server this transport was opened to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Moves every complete frame from the decoder into `ready`, dropping
    /// malformed units.
    fn drain_decoder(&mut self) -> Result<(), TransportError> {
        while let Some(result) = self.decoder.next_pdu() {
            match result {
                Ok(pdu) => {
                    debug!(action = %pdu.action(), request_id = ?pdu.request_id, "received pdu");
                    self.ready.push_back(pdu);
                }
                Err(e @ ProtocolError::PayloadTooLarge { .. }) => {
                    return Err(TransportError::Framing(e));
                }
                Err(e) => warn!("dropping malformed pdu: {e}"),
            }
        }
        Ok(())
    }

    /// Performs one read of at most `wait`.  Returns the number of bytes
    /// received; 0 means the wait elapsed.
    fn fill(&mut self, wait: Duration) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut chunk = [0u8; READ_CHUNK];

        let result = loop {
            let attempt = if wait.is_zero() {
                stream.set_nonblocking(true)?;
                let r = stream.read(&mut chunk);
                stream.set_nonblocking(false)?;
                r
            } else {
                stream.set_read_timeout(Some(wait))?;
                stream.read(&mut chunk)
            };
            match attempt {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match result {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                self.decoder.extend(&chunk[..n]);
                Ok(n)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(0)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.write_all(bytes)?;
        Ok(())
    }

    fn read_pdus(&mut self, timeout: Duration) -> Result<Vec<Pdu>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_decoder()?;
            if !self.ready.is_empty() {
                return Ok(self.ready.drain(..).collect());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.fill(remaining)? == 0 {
                return Ok(Vec::new());
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("shutdown of {} failed: {e}", self.peer);
            }
            info!("connection to {} closed", self.peer);
        }
    }
}

/// Turns an endpoint string into a socket address.
fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, TransportError> {
    let invalid = || TransportError::InvalidEndpoint(endpoint.to_string());

    let trimmed = endpoint
        .strip_prefix("rtm://")
        .or_else(|| endpoint.strip_prefix("tcp://"))
        .unwrap_or(endpoint)
        .trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut addrs = match trimmed.to_socket_addrs() {
        Ok(addrs) => addrs,
        // No port in the string: fall back to the default one.
        Err(_) => (trimmed, DEFAULT_PORT).to_socket_addrs().map_err(|_| invalid())?,
    };
    addrs.next().ok_or_else(invalid)
}
