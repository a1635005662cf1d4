//! In-memory transport for exercising the client without a server.
//!
//! [`ScriptedTransport`] plays back a queue of read results and records every
//! request written to it.  A responder closure can append replies as requests
//! arrive, which is how tests answer requests whose ids are only known at
//! run time.
//!
//! ```rust
//! use std::time::Duration;
//! use rtm_core::client::Client;
//! use rtm_core::protocol::{Action, Pdu, PduBody, PublishOkBody};
//! use rtm_core::testing::{ScriptedTransport, Step};
//!
//! let transport = ScriptedTransport::new().respond_with(|request: &Pdu| match request.action() {
//!     Action::Publish => vec![Step::Deliver(vec![Pdu {
//!         request_id: request.request_id,
//!         body: PduBody::PublishOk(PublishOkBody { position: "1".into() }),
//!     }])],
//!     _ => Vec::new(),
//! });
//! let log = transport.log();
//!
//! let mut client = Client::with_transport(transport, |_pdu: Pdu| {});
//! let id = client.publish("animals", "{}").unwrap();
//! client.wait_timeout(Duration::from_millis(10)).unwrap();
//!
//! assert!(matches!(client.publish_outcome(id), Some(Ok(position)) if position == "1"));
//! assert_eq!(log.lock().unwrap().written.len(), 1);
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::protocol::{decode_pdu, Pdu};
use crate::transport::{Transport, TransportError};

/// One scripted result of a `read_pdus` call.
#[derive(Debug)]
pub enum Step {
    /// Return these PDUs immediately.
    Deliver(Vec<Pdu>),
    /// Nothing arrives: block for the full timeout, then return empty.
    Silence,
    /// Fail the read.
    Fail(TransportError),
}

/// What happened on a [`ScriptedTransport`].
#[derive(Debug, Default)]
pub struct TransportLog {
    /// Requests written, decoded back from their wire form.
    pub written: Vec<Pdu>,
    pub read_calls: usize,
    pub closed: bool,
}

type Responder = Box<dyn FnMut(&Pdu) -> Vec<Step> + Send>;

/// Transport backed by a script instead of a socket.  An exhausted script
/// behaves like a silent server.
#[derive(Default)]
pub struct ScriptedTransport {
    script: VecDeque<Step>,
    responder: Option<Responder>,
    log: Arc<Mutex<TransportLog>>,
    /// Writes left before every further write fails; `None` never fails.
    writes_allowed: Option<usize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step to the read script.
    pub fn then(mut self, step: Step) -> Self {
        self.script.push_back(step);
        self
    }

    pub fn deliver(self, pdus: Vec<Pdu>) -> Self {
        self.then(Step::Deliver(pdus))
    }

    pub fn silence(self) -> Self {
        self.then(Step::Silence)
    }

    /// Calls `responder` for every written request and appends the steps it
    /// returns to the script.
    pub fn respond_with<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&Pdu) -> Vec<Step> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Makes every write fail with a broken-pipe error.
    pub fn failing_writes(self) -> Self {
        self.failing_writes_after(0)
    }

    /// Lets the first `count` writes through, then fails every later one
    /// with a broken-pipe error.
    pub fn failing_writes_after(mut self, count: usize) -> Self {
        self.writes_allowed = Some(count);
        self
    }

    /// Shared handle to the log; stays readable after the client drops the
    /// transport.
    pub fn log(&self) -> Arc<Mutex<TransportLog>> {
        Arc::clone(&self.log)
    }

    fn lock_log(&self) -> MutexGuard<'_, TransportLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for ScriptedTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.lock_log().closed {
            return Err(TransportError::NotConnected);
        }
        if let Some(allowed) = self.writes_allowed.as_mut() {
            if *allowed == 0 {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "scripted write failure",
                )));
            }
            *allowed -= 1;
        }
        let (pdu, _) = decode_pdu(bytes).map_err(TransportError::Framing)?;
        if let Some(responder) = self.responder.as_mut() {
            self.script.extend(responder(&pdu));
        }
        self.lock_log().written.push(pdu);
        Ok(())
    }

    fn read_pdus(&mut self, timeout: Duration) -> Result<Vec<Pdu>, TransportError> {
        {
            let mut log = self.lock_log();
            if log.closed {
                return Err(TransportError::NotConnected);
            }
            log.read_calls += 1;
        }
        match self.script.pop_front() {
            Some(Step::Deliver(pdus)) => Ok(pdus),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Silence) | None => {
                thread::sleep(timeout);
                Ok(Vec::new())
            }
        }
    }

    fn close(&mut self) {
        self.lock_log().closed = true;
    }
}
