#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use socket_hub::config::ConnectionSettings;
use socket_hub::domains::envelope::{self, Envelope};
use socket_hub::domains::message::Message;
use socket_hub::interfaces::transport::{TransportEvent, TransportHandle};
use socket_hub::providers::memory::{self, MemoryConnector};
use socket_hub::services::connection::{Connection, ConnectionEvent};
use socket_hub::services::hub::Hub;

pub const PEER: &str = "peer-1";

pub fn settings() -> ConnectionSettings {
    ConnectionSettings::default()
}

pub fn settings_with_timeout(timeout: Duration) -> ConnectionSettings {
    ConnectionSettings {
        timeout,
        ..ConnectionSettings::default()
    }
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting")
}

/// A client and the hub-side connection at the other end of an in-memory socket.
pub fn linked(
    client_settings: ConnectionSettings,
    server_settings: ConnectionSettings,
) -> (Arc<Connection>, Arc<Connection>) {
    let (client_end, server_end) = memory::pair();
    let client = Connection::client(client_settings);
    let server = Connection::hub_side(PEER, Value::Null, server_settings);
    client.attach(client_end);
    server.attach(server_end);
    (client, server)
}

/// A hub-side connection driven by raw frames from the test.
pub fn raw_peer(settings: ConnectionSettings) -> (Arc<Connection>, TransportHandle) {
    let (raw, server_end) = memory::pair();
    let server = Connection::hub_side(PEER, Value::Null, settings);
    server.attach(server_end);
    (server, raw)
}

/// A client attached to a raw end the test plays the hub on.
pub fn raw_hub(settings: ConnectionSettings) -> (Arc<Connection>, TransportHandle) {
    let (client_end, raw) = memory::pair();
    let client = Connection::client(settings);
    client.attach(client_end);
    (client, raw)
}

pub fn send_raw(raw: &TransportHandle, frame: &str) {
    raw.transport.send(frame.to_string()).unwrap();
}

/// Next decoded frame on a raw end, skipping transport notifications.
pub async fn next_frame(raw: &mut TransportHandle) -> Envelope {
    within(async {
        loop {
            match raw.events.recv().await {
                Some(TransportEvent::Message(text)) => return envelope::decode(&text).unwrap(),
                Some(_) => continue,
                None => panic!("raw transport closed"),
            }
        }
    })
    .await
}

pub async fn next_message(events: &mut UnboundedReceiver<ConnectionEvent>) -> Arc<Message> {
    within(async {
        loop {
            match events.recv().await {
                Some(ConnectionEvent::Message(message)) => return message,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
}

pub async fn wait_closed(events: &mut UnboundedReceiver<ConnectionEvent>) {
    within(async {
        while let Some(event) = events.recv().await {
            if matches!(event, ConnectionEvent::Closed) {
                return;
            }
        }
    })
    .await
}

/// Connects a client to `hub` in-process and waits for its identity.
pub async fn join(hub: &Arc<Hub>) -> (Arc<Connection>, String) {
    let connector = MemoryConnector::new(hub.clone());
    let client = Connection::connect(&connector, "memory://hub", settings())
        .await
        .unwrap();
    let identity = within(client.ready()).await.unwrap();
    (client, identity)
}
