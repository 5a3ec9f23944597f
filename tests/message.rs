mod common;

use std::time::Duration;

use serde_json::{json, Value};

use socket_hub::domains::envelope::{Envelope, MessageType};
use socket_hub::domains::message::{Direction, Message, MessageState, Rejection};
use socket_hub::error::HubError;
use socket_hub::services::connection::SendOptions;

use common::{linked, next_message, settings, settings_with_timeout, wait_closed, within, PEER};

#[tokio::test]
async fn async_request_resolves_with_peer_response() {
    let (client, server) = linked(settings(), settings());
    let mut inbound = server.subscribe_channel();

    let reply = client
        .send(SendOptions::request(json!({"question": 6})))
        .unwrap();
    assert_eq!(client.outstanding_len(), 1);

    let request = next_message(&mut inbound).await;
    assert_eq!(request.uuid(), reply.uuid());
    assert_eq!(request.kind(), MessageType::Async);
    assert_eq!(request.direction(), Direction::Inbound);
    assert_eq!(request.from(), PEER);
    assert_eq!(request.state(), MessageState::Pending);
    assert!(server.find_outstanding(request.uuid()).is_some());

    request.respond(json!({"answer": 42})).unwrap();
    assert_eq!(request.state(), MessageState::Destroyed);
    assert_eq!(server.outstanding_len(), 0);

    let value = within(reply).await.unwrap();
    assert_eq!(value, json!({"answer": 42}));
    assert_eq!(client.outstanding_len(), 0);
}

#[tokio::test]
async fn peer_rejection_reaches_requester() {
    let (client, server) = linked(settings(), settings());
    let mut inbound = server.subscribe_channel();

    let reply = client.send(SendOptions::request(json!("work"))).unwrap();
    let request = next_message(&mut inbound).await;
    request.respond_rejected(json!({"reason": "busy"})).unwrap();

    let err = within(reply).await.unwrap_err();
    assert_eq!(
        err,
        Rejection::Rejected {
            content: json!({"reason": "busy"})
        }
    );
}

#[tokio::test]
async fn fire_and_forget_resolves_with_its_snapshot() {
    let (client, server) = linked(settings(), settings());
    let mut inbound = server.subscribe_channel();

    let reply = client
        .send(SendOptions::new(MessageType::Default).content(json!(7)))
        .unwrap();
    let uuid = reply.uuid().to_string();
    let value = within(reply).await.unwrap();
    assert_eq!(value["uuid"], json!(uuid));
    assert_eq!(value["type"], "default");
    assert_eq!(value["state"], "resolved");
    assert_eq!(client.outstanding_len(), 0);

    let delivered = next_message(&mut inbound).await;
    assert_eq!(delivered.content(), &json!(7));
    assert_eq!(delivered.state(), MessageState::Destroyed);
    assert!(delivered.respond(json!(1)).is_err());
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_locally() {
    let (client, server) = linked(settings(), settings_with_timeout(Duration::from_secs(60)));
    let mut inbound = server.subscribe_channel();

    let reply = client
        .send(SendOptions::request(json!(1)).timeout(Duration::from_secs(2)))
        .unwrap();
    let uuid = reply.uuid().to_string();
    let _request = next_message(&mut inbound).await;

    match reply.await {
        Err(Rejection::Timeout(snapshot)) => {
            assert_eq!(snapshot.envelope.uuid, uuid);
            assert_eq!(snapshot.state, MessageState::TimedOut);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(client.outstanding_len(), 0);

    // The peer's own deadline later answers with response.timedout, which is stale by now.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!client.is_destroyed());
    assert_eq!(server.outstanding_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn peer_deadline_answers_with_timedout() {
    let (client, server) = linked(
        settings_with_timeout(Duration::from_secs(60)),
        settings_with_timeout(Duration::from_secs(1)),
    );
    let mut inbound = server.subscribe_channel();

    let reply = client.send(SendOptions::request(json!("slow"))).unwrap();
    let uuid = reply.uuid().to_string();
    let request = next_message(&mut inbound).await;

    match reply.await {
        Err(Rejection::TimedOut { content }) => {
            assert_eq!(content["uuid"], json!(uuid));
            assert_eq!(content["state"], "timedout");
        }
        other => panic!("expected peer timeout, got {other:?}"),
    }
    assert_eq!(request.state(), MessageState::Destroyed);
    assert!(request.respond(json!("late")).is_ok());
}

#[tokio::test]
async fn destroying_the_connection_rejects_outstanding() {
    let (client, server) = linked(settings(), settings());
    let mut inbound = server.subscribe_channel();

    let first = client.send(SendOptions::request(json!(1))).unwrap();
    let second = client.send(SendOptions::request(json!(2))).unwrap();
    let _ = next_message(&mut inbound).await;
    assert_eq!(client.outstanding_len(), 2);

    client.destroy();
    assert!(client.is_destroyed());
    assert_eq!(client.outstanding_len(), 0);

    let destroyed = Rejection::Destroyed {
        content: Value::Bool(false),
    };
    assert_eq!(within(first).await.unwrap_err(), destroyed);
    assert_eq!(within(second).await.unwrap_err(), destroyed);
    assert!(matches!(
        client.send(SendOptions::request(json!(3))),
        Err(HubError::Closed)
    ));

    wait_closed(&mut inbound).await;
    assert!(server.is_destroyed());
    assert_eq!(server.outstanding_len(), 0);
}

#[tokio::test]
async fn resolution_is_single_shot() {
    let (client, _server) = linked(settings(), settings());
    let envelope = Envelope::new(MessageType::Async, "", "server", json!(null));
    let message = Message::outbound(&client, envelope, Duration::from_secs(5));
    assert_eq!(message.state(), MessageState::Created);

    let reply = message.handle().unwrap().unwrap();
    assert_eq!(message.state(), MessageState::Pending);
    assert!(message.handle().is_err());

    assert!(message.resolve(json!("first")));
    assert!(!message.resolve(json!("second")));
    assert!(!message.reject(Rejection::Rejected {
        content: json!("late")
    }));
    message.destroy();
    message.destroy();

    assert_eq!(message.state(), MessageState::Destroyed);
    assert_eq!(within(reply).await.unwrap(), json!("first"));
    assert!(client.find_outstanding(message.uuid()).is_none());
}

#[tokio::test]
async fn respond_requires_an_inbound_async_message() {
    let (client, _server) = linked(settings(), settings());
    let envelope = Envelope::new(MessageType::Async, "", "server", json!(null));
    let outbound = Message::outbound(&client, envelope, Duration::from_secs(5));
    assert!(matches!(
        outbound.respond(json!(1)),
        Err(HubError::Protocol(_))
    ));
    assert!(matches!(
        outbound.respond_rejected(json!(1)),
        Err(HubError::Protocol(_))
    ));
    outbound.destroy();
    assert_eq!(outbound.state(), MessageState::Destroyed);
}

#[tokio::test]
async fn snapshot_serializes_with_wire_names() {
    let (client, _server) = linked(settings(), settings());
    let envelope = Envelope::new(MessageType::Broadcast, "a", "b", json!({"x": 1}));
    let message = Message::outbound(&client, envelope.clone(), Duration::from_secs(5));
    let value = serde_json::to_value(message.snapshot()).unwrap();
    assert_eq!(value["type"], "broadcast");
    assert_eq!(value["state"], "created");
    assert_eq!(value["uuid"], json!(envelope.uuid));
    message.destroy();
}
