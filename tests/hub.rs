mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use socket_hub::domains::envelope::{MessageType, SERVER};
use socket_hub::domains::message::{Message, Rejection};
use socket_hub::services::connection::{Connection, SendOptions};
use socket_hub::services::hub::{Forward, Hub, HubEvent};

use common::{join, next_message, settings, settings_with_timeout, within};

#[tokio::test]
async fn accepted_peers_are_registered_with_fresh_identities() {
    let hub = Hub::new(settings());
    let mut events = hub.subscribe_channel();

    let (a, a_id) = join(&hub).await;
    let (_b, b_id) = join(&hub).await;
    assert_ne!(a_id, b_id);
    assert_eq!(hub.len(), 2);

    let found = hub.find(&a_id).unwrap();
    assert_eq!(found.identity().as_deref(), Some(a_id.as_str()));
    assert!(found.is_hub_side());
    assert_eq!(found.auth()["transport"], "memory");
    assert!(!a.is_hub_side());

    let mut listed: Vec<String> = hub.list().iter().filter_map(|c| c.identity()).collect();
    listed.sort();
    let mut expected = vec![a_id.clone(), b_id.clone()];
    expected.sort();
    assert_eq!(listed, expected);

    match within(events.recv()).await.unwrap() {
        HubEvent::Connected(connection) => assert_eq!(connection.identity(), Some(a_id)),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn routes_requests_between_peers() {
    let hub = Hub::new(settings());
    let (a, a_id) = join(&hub).await;
    let (b, b_id) = join(&hub).await;
    let (c, _) = join(&hub).await;
    let mut b_inbound = b.subscribe_channel();
    let mut c_inbound = c.subscribe_channel();

    let reply = a
        .send(SendOptions::request(json!("hello")).to(b_id.clone()))
        .unwrap();
    let request = next_message(&mut b_inbound).await;
    assert_eq!(request.from(), a_id);
    assert_eq!(request.to(), b_id);
    assert_eq!(request.uuid(), reply.uuid());
    assert_eq!(request.content(), &json!("hello"));

    request.respond(json!("ack")).unwrap();
    assert_eq!(within(reply).await.unwrap(), json!("ack"));

    assert!(c_inbound.try_recv().is_err());
    assert_eq!(a.outstanding_len(), 0);
    assert_eq!(hub.find(&a_id).unwrap().outstanding_len(), 0);
    assert_eq!(hub.find(&b_id).unwrap().outstanding_len(), 0);
}

#[tokio::test]
async fn sender_cannot_impersonate_another_peer() {
    let hub = Hub::new(settings());
    let (a, a_id) = join(&hub).await;
    let (b, b_id) = join(&hub).await;
    let mut b_inbound = b.subscribe_channel();

    let _ = a
        .send(
            SendOptions::new(MessageType::Default)
                .sender("someone-else")
                .to(b_id)
                .content(json!(1)),
        )
        .unwrap();
    let delivered = next_message(&mut b_inbound).await;
    assert_eq!(delivered.from(), a_id);
}

#[tokio::test]
async fn destination_rejection_propagates() {
    let hub = Hub::new(settings());
    let (a, _) = join(&hub).await;
    let (b, b_id) = join(&hub).await;
    let mut b_inbound = b.subscribe_channel();

    let reply = a.send(SendOptions::request(json!(1)).to(b_id)).unwrap();
    let request = next_message(&mut b_inbound).await;
    request.respond_rejected(json!({"reason": "busy"})).unwrap();

    assert_eq!(
        within(reply).await.unwrap_err(),
        Rejection::Rejected {
            content: json!({"reason": "busy"})
        }
    );
}

#[tokio::test]
async fn unknown_destination_is_rejected() {
    let hub = Hub::new(settings());
    let (a, _) = join(&hub).await;

    let reply = a.send(SendOptions::request(json!(1)).to("nobody")).unwrap();
    assert_eq!(
        within(reply).await.unwrap_err(),
        Rejection::Rejected {
            content: json!("nobody")
        }
    );
}

#[tokio::test]
async fn silent_destination_times_out() {
    let hub = Hub::new(settings_with_timeout(Duration::from_millis(200)));
    let (a, _) = join(&hub).await;
    let (_b, b_id) = join(&hub).await;

    let reply = a
        .send(SendOptions::request(json!(1)).to(b_id).timeout(Duration::from_secs(5)))
        .unwrap();
    match within(reply).await {
        Err(Rejection::TimedOut { .. }) => {}
        other => panic!("expected the hub to report a timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn messages_for_the_hub_surface_as_hub_events() {
    let hub = Hub::new(settings());
    let mut events = hub.subscribe_channel();
    let (a, a_id) = join(&hub).await;

    let reply = a.send(SendOptions::request(json!("status?"))).unwrap();
    let message = within(async {
        loop {
            if let Some(HubEvent::Message(message)) = events.recv().await {
                return message;
            }
        }
    })
    .await;
    assert_eq!(message.from(), a_id);
    assert_eq!(message.to(), SERVER);
    message.respond(json!("fine")).unwrap();

    assert_eq!(within(reply).await.unwrap(), json!("fine"));
}

#[tokio::test]
async fn route_hook_can_suppress_delivery() {
    let hub = Hub::new(settings());
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    hub.set_route_hook(
        move |_message: Arc<Message>,
              _from: Arc<Connection>,
              _to: Option<Arc<Connection>>,
              _forward: Forward| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    let (a, _) = join(&hub).await;
    let (b, b_id) = join(&hub).await;
    let mut b_inbound = b.subscribe_channel();

    let reply = a
        .send(
            SendOptions::request(json!("blocked"))
                .to(b_id)
                .timeout(Duration::from_millis(200)),
        )
        .unwrap();
    let err = within(reply).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(b_inbound.try_recv().is_err());
}

#[tokio::test]
async fn route_hook_sees_both_ends_and_can_forward() {
    let hub = Hub::new(settings());
    let routed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = routed.clone();
    hub.set_route_hook(
        move |message: Arc<Message>,
              from: Arc<Connection>,
              to: Option<Arc<Connection>>,
              forward: Forward| {
            log.lock().push((
                message.uuid().to_string(),
                from.identity(),
                to.and_then(|to| to.identity()),
            ));
            forward.forward();
        },
    );
    let (a, a_id) = join(&hub).await;
    let (b, b_id) = join(&hub).await;
    let mut b_inbound = b.subscribe_channel();

    let reply = a
        .send(SendOptions::request(json!(2)).to(b_id.clone()))
        .unwrap();
    let uuid = reply.uuid().to_string();
    let request = next_message(&mut b_inbound).await;
    request.respond(json!(4)).unwrap();
    assert_eq!(within(reply).await.unwrap(), json!(4));

    let snapshot = routed.lock().clone();
    assert_eq!(snapshot, vec![(uuid, Some(a_id), Some(b_id.clone()))]);

    hub.clear_route_hook();
    let _ = a
        .send(
            SendOptions::new(MessageType::Default)
                .to(b_id)
                .content(json!("unhooked")),
        )
        .unwrap();
    let delivered = next_message(&mut b_inbound).await;
    assert_eq!(delivered.content(), &json!("unhooked"));
    assert_eq!(routed.lock().len(), 1);
}

#[tokio::test]
async fn disconnected_peers_leave_the_registry() {
    let hub = Hub::new(settings());
    let (a, a_id) = join(&hub).await;
    let mut events = hub.subscribe_channel();

    a.destroy();
    let gone = within(async {
        loop {
            if let Some(HubEvent::Disconnected(identity)) = events.recv().await {
                return identity;
            }
        }
    })
    .await;
    assert_eq!(gone, a_id);
    assert!(hub.find(&a_id).is_none());
    assert!(hub.is_empty());
}

#[tokio::test]
async fn broadcast_reaches_every_peer() {
    let hub = Hub::new(settings());
    let (a, _) = join(&hub).await;
    let (b, _) = join(&hub).await;
    let mut a_inbound = a.subscribe_channel();
    let mut b_inbound = b.subscribe_channel();

    assert_eq!(hub.broadcast(json!({"news": true})), 2);
    for inbound in [&mut a_inbound, &mut b_inbound] {
        let message = next_message(inbound).await;
        assert_eq!(message.kind(), MessageType::Broadcast);
        assert_eq!(message.from(), SERVER);
        assert_eq!(message.content(), &json!({"news": true}));
    }
}

#[tokio::test]
async fn peer_can_address_a_request_to_itself() {
    let hub = Hub::new(settings());
    let (a, a_id) = join(&hub).await;
    let mut inbound = a.subscribe_channel();

    let reply = a
        .send(SendOptions::request(json!({"x": 1})).to(a_id.clone()))
        .unwrap();
    let request = next_message(&mut inbound).await;
    assert_eq!(request.uuid(), reply.uuid());
    assert_eq!(request.from(), a_id);
    request.respond(json!({"y": 2})).unwrap();

    assert_eq!(within(reply).await.unwrap(), json!({"y": 2}));
    assert_eq!(a.outstanding_len(), 0);
}
