//! Blocking dispatch of incoming PDUs.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::protocol::{Action, Pdu};
use crate::transport::{Transport, TransportError};

/// Result of one [`wait_timeout`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// This many PDUs (at least one) were received and routed.
    Dispatched(usize),
    /// The deadline passed with nothing received.
    Timeout,
}

impl WaitStatus {
    pub fn is_timeout(self) -> bool {
        self == WaitStatus::Timeout
    }
}

/// Receives every PDU read from the connection.
///
/// Implementations that do not override [`PduHandler::on_pdu`] get
/// [`default_pdu_handler`]. Closures taking a `Pdu` are handlers too.
pub trait PduHandler {
    fn on_pdu(&mut self, pdu: Pdu) {
        default_pdu_handler(&pdu);
    }
}

impl<F: FnMut(Pdu)> PduHandler for F {
    fn on_pdu(&mut self, pdu: Pdu) {
        self(pdu)
    }
}

/// Handler that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl PduHandler for LoggingHandler {}

/// Logs a PDU nobody handled.  Error kinds go to `warn`, subscription info to
/// `info`, everything else to `debug`.  Never fatal.
pub fn default_pdu_handler(pdu: &Pdu) {
    let action = pdu.action();
    match pdu.error() {
        Some(info) if action == Action::SubscriptionInfo => info!(
            subscription_id = ?info.subscription_id,
            "{action}: {}: {}",
            info.error,
            info.reason
        ),
        Some(error) => warn!(
            request_id = ?pdu.request_id,
            subscription_id = ?error.subscription_id,
            "{action}: {}: {}",
            error.error,
            error.reason
        ),
        None => debug!(request_id = ?pdu.request_id, "unhandled {action}"),
    }
}

/// Blocks on one `read_pdus(timeout)` call and passes every PDU received to
/// `route`, in arrival order.
///
/// # Errors
///
/// Returns the transport error when the connection is unusable.
pub fn wait_timeout<T, F>(
    transport: &mut T,
    timeout: Duration,
    mut route: F,
) -> Result<WaitStatus, TransportError>
where
    T: Transport + ?Sized,
    F: FnMut(Pdu),
{
    let pdus = transport.read_pdus(timeout)?;
    if pdus.is_empty() {
        return Ok(WaitStatus::Timeout);
    }
    let count = pdus.len();
    for pdu in pdus {
        route(pdu);
    }
    Ok(WaitStatus::Dispatched(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorBody, PduBody, PublishOkBody};
    use crate::transport::MockTransport;

    fn publish_ok(request_id: u64) -> Pdu {
        Pdu::with_request_id(
            request_id,
            PduBody::PublishOk(PublishOkBody {
                position: format!("0:{request_id}"),
            }),
        )
    }

    #[test]
    fn test_routes_every_pdu_in_arrival_order() {
        // Arrange
        let mut transport = MockTransport::new();
        transport
            .expect_read_pdus()
            .times(1)
            .returning(|_| Ok(vec![publish_ok(1), publish_ok(2), publish_ok(3)]));
        let mut seen = Vec::new();

        // Act
        let status = wait_timeout(&mut transport, Duration::from_millis(10), |pdu| {
            seen.push(pdu.request_id)
        })
        .unwrap();

        // Assert
        assert_eq!(status, WaitStatus::Dispatched(3));
        assert_eq!(seen, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_empty_read_is_timeout() {
        let mut transport = MockTransport::new();
        transport
            .expect_read_pdus()
            .withf(|timeout| timeout.is_zero())
            .times(1)
            .returning(|_| Ok(Vec::new()));

        let status = wait_timeout(&mut transport, Duration::ZERO, |_| {
            panic!("nothing should be routed")
        })
        .unwrap();

        assert!(status.is_timeout());
    }

    #[test]
    fn test_transport_failure_is_returned() {
        let mut transport = MockTransport::new();
        transport
            .expect_read_pdus()
            .returning(|_| Err(TransportError::Closed));

        let result = wait_timeout(&mut transport, Duration::from_secs(1), |_| {});

        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[test]
    fn test_closure_handler_receives_pdu() {
        let mut received = Vec::new();
        {
            let mut handler = |pdu: Pdu| received.push(pdu.action());
            handler.on_pdu(publish_ok(1));
        }

        assert_eq!(received, vec![Action::PublishOk]);
    }

    #[test]
    fn test_default_handler_accepts_every_kind_without_panicking() {
        let mut handler = LoggingHandler;

        handler.on_pdu(publish_ok(1));
        handler.on_pdu(Pdu::new(PduBody::GeneralError(ErrorBody::new("e", "r"))));
        handler.on_pdu(Pdu::new(PduBody::SubscriptionInfo(
            ErrorBody::new("fast_forward", "slow consumer").for_subscription("animals"),
        )));
    }
}
