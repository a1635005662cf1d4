//! Request ids and reply correlation.
//!
//! # How correlation works
//!
//! Every request PDU the client sends carries a request id taken from a
//! [`RequestIdCounter`].  The server copies that id into its reply.  Before
//! sending, the client records in the [`RequestRegistry`] which reply actions
//! would settle the request (for a subscribe: `SubscribeOk` or
//! `SubscribeError`).  As replies are dispatched, [`RequestRegistry::resolve`]
//! removes the matching entry and tells the waiting operation it is done.
//!
//! Correlation is bookkeeping on top of dispatch, not a filter: every PDU is
//! still delivered to the handler whether or not it resolved anything.

use std::collections::HashMap;

use thiserror::Error;

use crate::protocol::pdu::{Action, Pdu};

/// Monotonically increasing source of request ids for one connection.
///
/// Ids start at 1 and increase by 1 per call.  After `u64::MAX` the counter
/// wraps to 1, skipping 0.
///
/// # Examples
///
/// ```rust
/// use rtm_core::protocol::RequestIdCounter;
///
/// let mut ids = RequestIdCounter::new();
/// assert_eq!(ids.next_request_id(), 1);
/// assert_eq!(ids.next_request_id(), 2);
/// ```
#[derive(Debug)]
pub struct RequestIdCounter {
    next: u64,
}

impl RequestIdCounter {
    /// Creates a new counter whose first id is 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Returns a fresh id and advances the counter.
    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// Returns the id the next call will hand out, without advancing.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for RequestIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised by the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// An entry for this id is already outstanding.
    #[error("request {0} is already pending")]
    Duplicate(u64),
}

/// One outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: u64,
    /// Reply actions that settle this request.
    pub expected: Vec<Action>,
}

/// Outcome of a successful [`RequestRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub request_id: u64,
    /// The reply action that settled the request.
    pub action: Action,
}

/// Outstanding requests keyed by request id.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    ids: RequestIdCounter,
    pending: HashMap<u64, PendingRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh request id, strictly greater than all earlier ones.
    pub fn next_request_id(&mut self) -> u64 {
        self.ids.next_request_id()
    }

    /// Records that a reply to `request_id` with one of `expected` will settle it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if `request_id` is already pending;
    /// the existing entry is left as it was.
    pub fn register(&mut self, request_id: u64, expected: &[Action]) -> Result<(), RegistryError> {
        if self.pending.contains_key(&request_id) {
            return Err(RegistryError::Duplicate(request_id));
        }
        self.pending.insert(
            request_id,
            PendingRequest {
                request_id,
                expected: expected.to_vec(),
            },
        );
        Ok(())
    }

    /// Settles the entry matching `pdu`, if there is one.
    ///
    /// The entry is removed only when both the request id and the action
    /// match; anything else leaves the registry untouched.
    pub fn resolve(&mut self, pdu: &Pdu) -> Option<Resolved> {
        let request_id = pdu.request_id?;
        let action = pdu.action();
        let entry = self.pending.get(&request_id)?;
        if !entry.expected.contains(&action) {
            return None;
        }
        self.pending.remove(&request_id);
        Some(Resolved { request_id, action })
    }

    /// Drops the entry for a request whose waiter gave up.  A late reply is
    /// then delivered as an ordinary, unmatched PDU.
    pub fn cancel(&mut self, request_id: u64) -> Option<PendingRequest> {
        self.pending.remove(&request_id)
    }

    /// Drops every outstanding entry.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, request_id: u64) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
