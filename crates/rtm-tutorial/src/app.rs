//! The tutorial flow: authenticate, subscribe, then publish and wait for the
//! message to come back on the subscription, over and over.

use std::time::Duration;

use rtm_core::auth::{AuthError, AuthOutcome};
use rtm_core::protocol::{Pdu, PduBody};
use rtm_core::{
    default_pdu_handler, Client, PduHandler, PublishError, SubscribeError, Transport,
    TransportError,
};
use thiserror::Error;
use tracing::{error, info};

use crate::config::TutorialConfig;

#[derive(Debug, Error)]
pub enum TutorialError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("subscription failed: {0}")]
    Subscribe(#[from] SubscribeError),
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no publish reply within {0:?}")]
    PublishTimeout(Duration),
    #[error("published message did not come back within {0:?}")]
    EchoTimeout(Duration),
}

/// Handler and application state in one.
#[derive(Debug, Default)]
pub struct TutorialHandler {
    /// Set when subscription data arrives; cleared before each publish.
    pub got_message: bool,
    /// Every message payload received so far.
    pub received: Vec<String>,
}

impl PduHandler for TutorialHandler {
    fn on_pdu(&mut self, pdu: Pdu) {
        if let Some(e) = pdu.error() {
            error!("{}: error: {}, reason: {}", pdu.action(), e.error, e.reason);
            return;
        }
        match pdu.body {
            PduBody::SubscribeOk(ok) => info!("subscribed to the channel: {}", ok.subscription_id),
            PduBody::PublishOk(_) => info!("animal is published"),
            PduBody::SubscriptionData(data) => {
                for message in data.messages {
                    info!("animal is received: {message}");
                    self.received.push(message);
                }
                self.got_message = true;
            }
            body => default_pdu_handler(&Pdu {
                request_id: pdu.request_id,
                body,
            }),
        }
    }
}

/// Runs the tutorial against an open client.  Returns the number of
/// publish/echo cycles completed.
///
/// # Errors
///
/// Stops at the first failed step; see [`TutorialError`].
pub fn run<T: Transport>(
    client: &mut Client<TutorialHandler, T>,
    config: &TutorialConfig,
) -> Result<u32, TutorialError> {
    let credentials = config.credentials();
    if let AuthOutcome::Authenticated = client.handshake_and_authenticate(credentials)? {
        if let Some(credentials) = credentials {
            info!("authenticated as {}", credentials.role);
        }
    }

    let channel = &config.demo.channel;
    let subscription_id = client.subscribe(channel)?;

    let timeout = config.request_timeout();
    let mut completed = 0;
    while config.demo.cycles == 0 || completed < config.demo.cycles {
        client.handler_mut().got_message = false;

        let request_id = client.publish(channel, &config.demo.message)?;
        let position = loop {
            if let Some(outcome) = client.publish_outcome(request_id) {
                break outcome?;
            }
            if client.wait_timeout(timeout)?.is_timeout() {
                return Err(TutorialError::PublishTimeout(timeout));
            }
        };
        info!(request_id, %position, "publish acknowledged");

        while !client.handler().got_message {
            if client.wait_timeout(timeout)?.is_timeout() {
                return Err(TutorialError::EchoTimeout(timeout));
            }
        }

        client.wait_timeout(config.cycle_pause())?;
        completed += 1;
    }

    client.unsubscribe(&subscription_id)?;
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtm_core::protocol::{ErrorBody, Messages, SubscriptionDataBody};

    #[test]
    fn test_handler_collects_subscription_messages() {
        // Arrange
        let mut handler = TutorialHandler::default();
        let data = Pdu::new(PduBody::SubscriptionData(SubscriptionDataBody {
            subscription_id: "animals".into(),
            position: "1:0".into(),
            messages: Messages::from_strings(["fox", "owl"]),
        }));

        // Act
        handler.on_pdu(data);

        // Assert
        assert!(handler.got_message);
        assert_eq!(handler.received, vec!["fox", "owl"]);
    }

    #[test]
    fn test_handler_error_pdu_does_not_count_as_message() {
        let mut handler = TutorialHandler::default();

        handler.on_pdu(Pdu::new(PduBody::SubscriptionError(
            ErrorBody::new("out_of_sync", "too slow").for_subscription("animals"),
        )));

        assert!(!handler.got_message);
        assert!(handler.received.is_empty());
    }
}
