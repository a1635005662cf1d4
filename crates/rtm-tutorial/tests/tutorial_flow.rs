//! Integration tests for the tutorial loop against a scripted server that
//! echoes every publish back on the subscription.

use std::time::Duration;

use rtm_core::protocol::{
    Action, ErrorBody, HandshakeOkBody, Messages, Nonce, Pdu, PduBody, PublishOkBody,
    SubscribeOkBody, SubscriptionDataBody, UnsubscribeOkBody,
};
use rtm_core::testing::{ScriptedTransport, Step};
use rtm_core::{Client, Credentials};
use rtm_tutorial::app::{run, TutorialError, TutorialHandler};
use rtm_tutorial::config::TutorialConfig;

fn reply(request: &Pdu, body: PduBody) -> Step {
    Step::Deliver(vec![Pdu {
        request_id: request.request_id,
        body,
    }])
}

/// Accepts everything and echoes each published message as subscription data.
fn echo_server() -> ScriptedTransport {
    ScriptedTransport::new().respond_with(|request: &Pdu| match &request.body {
        PduBody::Handshake(_) => vec![reply(
            request,
            PduBody::HandshakeOk(HandshakeOkBody {
                nonce: Nonce::new("abc123").unwrap(),
            }),
        )],
        PduBody::Authenticate(_) => vec![reply(request, PduBody::AuthenticateOk)],
        PduBody::Subscribe(body) => vec![reply(
            request,
            PduBody::SubscribeOk(SubscribeOkBody {
                subscription_id: body.channel.clone(),
                position: "0:0".into(),
            }),
        )],
        PduBody::Publish(body) => vec![
            reply(
                request,
                PduBody::PublishOk(PublishOkBody {
                    position: "1:0".into(),
                }),
            ),
            Step::Deliver(vec![Pdu::new(PduBody::SubscriptionData(SubscriptionDataBody {
                subscription_id: body.channel.clone(),
                position: "1:0".into(),
                messages: Messages::from_strings([body.message.as_str()]),
            }))]),
        ],
        PduBody::Unsubscribe(body) => vec![reply(
            request,
            PduBody::UnsubscribeOk(UnsubscribeOkBody {
                subscription_id: body.subscription_id.clone(),
            }),
        )],
        _ => Vec::new(),
    })
}

fn quick_config(cycles: u32) -> TutorialConfig {
    let mut config = TutorialConfig::default();
    config.connection.request_timeout_secs = 1;
    config.demo.cycle_pause_secs = 0;
    config.demo.cycles = cycles;
    config
}

#[test]
fn test_run_completes_requested_cycles_and_receives_echo() {
    // Arrange
    let transport = echo_server();
    let log = transport.log();
    let config = quick_config(2);
    let mut client = Client::with_transport(transport, TutorialHandler::default())
        .with_options(config.client_options());

    // Act
    let completed = run(&mut client, &config).expect("tutorial runs");

    // Assert
    assert_eq!(completed, 2);
    assert_eq!(
        client.handler().received,
        vec![config.demo.message.clone(), config.demo.message.clone()]
    );
    let actions: Vec<Action> = log.lock().unwrap().written.iter().map(Pdu::action).collect();
    assert_eq!(
        actions,
        vec![Action::Subscribe, Action::Publish, Action::Publish, Action::Unsubscribe],
        "no credentials means no handshake"
    );
}

#[test]
fn test_run_authenticates_before_subscribing() {
    let transport = echo_server();
    let log = transport.log();
    let mut config = quick_config(1);
    config.auth = Some(Credentials::new("publisher", "secret"));
    let mut client = Client::with_transport(transport, TutorialHandler::default())
        .with_options(config.client_options());

    run(&mut client, &config).expect("tutorial runs");

    let actions: Vec<Action> = log.lock().unwrap().written.iter().map(Pdu::action).collect();
    assert_eq!(&actions[..3], &[Action::Handshake, Action::Authenticate, Action::Subscribe]);
}

#[test]
fn test_run_stops_when_subscribe_is_rejected() {
    // Arrange
    let transport = ScriptedTransport::new().respond_with(|request: &Pdu| match request.action() {
        Action::Subscribe => vec![reply(
            request,
            PduBody::SubscribeError(ErrorBody::new("authorization_denied", "not authorized")),
        )],
        _ => Vec::new(),
    });
    let log = transport.log();
    let config = quick_config(1);
    let mut client = Client::with_transport(transport, TutorialHandler::default())
        .with_options(config.client_options());

    // Act
    let result = run(&mut client, &config);

    // Assert
    assert!(matches!(result, Err(TutorialError::Subscribe(_))));
    assert_eq!(log.lock().unwrap().written.len(), 1, "nothing is published");
}

#[test]
fn test_run_reports_missing_echo() {
    // Publish is acknowledged but nothing comes back on the subscription.
    let transport = ScriptedTransport::new().respond_with(|request: &Pdu| match &request.body {
        PduBody::Subscribe(body) => vec![reply(
            request,
            PduBody::SubscribeOk(SubscribeOkBody {
                subscription_id: body.channel.clone(),
                position: "0:0".into(),
            }),
        )],
        PduBody::Publish(_) => vec![reply(
            request,
            PduBody::PublishOk(PublishOkBody {
                position: "1:0".into(),
            }),
        )],
        _ => Vec::new(),
    });
    let config = quick_config(1);
    let mut client = Client::with_transport(transport, TutorialHandler::default())
        .with_options(config.client_options());

    let result = run(&mut client, &config);

    assert!(matches!(result, Err(TutorialError::EchoTimeout(t)) if t == Duration::from_secs(1)));
}

#[test]
fn test_run_with_placeholder_role_skips_handshake() {
    let transport = echo_server();
    let log = transport.log();
    let mut config = quick_config(1);
    config.auth = Some(Credentials::new("YOUR_ROLE", "YOUR_SECRET"));
    let mut client = Client::with_transport(transport, TutorialHandler::default())
        .with_options(config.client_options());

    run(&mut client, &config).expect("tutorial runs");

    let first = log.lock().unwrap().written[0].action();
    assert_eq!(first, Action::Subscribe);
}
