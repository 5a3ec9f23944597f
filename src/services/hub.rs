use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::ConnectionSettings;
use crate::domains::envelope::{self, MessageType, SERVER};
use crate::domains::message::{Message, Rejection};
use crate::interfaces::transport::TransportHandle;
use crate::providers::websocket;
use crate::services::connection::{Connection, ConnectionEvent, SendOptions};
use crate::services::events::{EventEmitter, Subscription};

#[derive(Debug, Clone)]
pub enum HubEvent {
    Connected(Arc<Connection>),
    /// A message addressed to the hub itself.
    Message(Arc<Message>),
    Disconnected(String),
}

/// Intercepts peer-to-peer traffic. Calling [`Forward::forward`] delivers the
/// message; dropping the handle suppresses it.
pub trait RouteHook: Send + Sync {
    fn route(
        &self,
        message: Arc<Message>,
        from: Arc<Connection>,
        to: Option<Arc<Connection>>,
        forward: Forward,
    );
}

impl<F> RouteHook for F
where
    F: Fn(Arc<Message>, Arc<Connection>, Option<Arc<Connection>>, Forward) + Send + Sync,
{
    fn route(
        &self,
        message: Arc<Message>,
        from: Arc<Connection>,
        to: Option<Arc<Connection>>,
        forward: Forward,
    ) {
        self(message, from, to, forward)
    }
}

/// Default delivery of one inbound message to its destination peer.
pub struct Forward {
    message: Arc<Message>,
    destination: Option<Arc<Connection>>,
}

impl Forward {
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Sends the message on to its destination and settles the original with the
    /// destination's answer.
    pub fn forward(self) {
        let Forward {
            message,
            destination,
        } = self;
        let Some(destination) = destination.filter(|peer| !peer.is_destroyed()) else {
            tracing::debug!(uuid = %message.uuid(), to = %message.to(), "no route to peer");
            message.reject(Rejection::Unroutable(message.to().to_string()));
            return;
        };

        let options = SendOptions::from(message.envelope().clone()).timeout(message.timeout());
        let reply = match destination.send(options) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(uuid = %message.uuid(), to = %message.to(), error = %err, "forward failed");
                message.reject(Rejection::Unroutable(message.to().to_string()));
                return;
            }
        };
        if message.kind() != MessageType::Async {
            return;
        }

        tokio::spawn(async move {
            match reply.await {
                Ok(value) => {
                    message.resolve(value);
                }
                Err(rejection) if rejection.is_timeout() => message.expire(),
                Err(rejection) => {
                    message.reject(rejection);
                }
            }
        });
    }
}

/// Registry of connected peers and the router between them.
pub struct Hub {
    peers: DashMap<String, Arc<Connection>>,
    route_hook: RwLock<Option<Arc<dyn RouteHook>>>,
    events: Arc<EventEmitter<HubEvent>>,
    settings: ConnectionSettings,
}

impl Hub {
    pub fn new(settings: ConnectionSettings) -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
            route_hook: RwLock::new(None),
            events: Arc::new(EventEmitter::new()),
            settings,
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Registers a new peer on `handle`, assigns it a fresh identity and announces
    /// that identity with an `initialize` envelope.
    pub fn accept(self: &Arc<Self>, handle: TransportHandle, auth: Value) -> Arc<Connection> {
        let identity = envelope::new_id();
        let connection = Connection::hub_side(identity.clone(), auth, self.settings);

        let hub = Arc::downgrade(self);
        let peer = identity.clone();
        connection.subscribe(move |event| {
            let Some(hub) = hub.upgrade() else {
                return;
            };
            match event {
                ConnectionEvent::Message(message) => hub.route(message.clone()),
                ConnectionEvent::Closed => hub.remove(&peer),
                _ => {}
            }
        });

        self.peers.insert(identity.clone(), connection.clone());
        connection.attach(handle);

        let initialize =
            SendOptions::new(MessageType::Initialize).content(Value::String(identity.clone()));
        if let Err(err) = connection.send(initialize) {
            tracing::warn!(peer = %identity, error = %err, "failed to announce identity");
        }
        tracing::info!(peer = %identity, peers = self.peers.len(), "peer connected");
        self.events.emit(&HubEvent::Connected(connection.clone()));
        connection
    }

    /// Completes a WebSocket handshake and accepts the socket as a new peer.
    pub fn upgrade(self: &Arc<Self>, ws: WebSocketUpgrade, auth: Value) -> Response {
        let hub = self.clone();
        ws.on_upgrade(move |socket| async move {
            hub.accept(websocket::server_transport(socket), auth);
        })
    }

    pub fn find(&self, identity: &str) -> Option<Arc<Connection>> {
        self.peers.get(identity).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<Connection>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn set_route_hook<H>(&self, hook: H)
    where
        H: RouteHook + 'static,
    {
        let hook: Arc<dyn RouteHook> = Arc::new(hook);
        *self.route_hook.write() = Some(hook);
    }

    pub fn clear_route_hook(&self) {
        *self.route_hook.write() = None;
    }

    /// Sends a `broadcast` envelope to every registered peer. Returns how many
    /// peers it was written to.
    pub fn broadcast(&self, content: Value) -> usize {
        let mut delivered = 0;
        for peer in self.list() {
            let options = SendOptions::new(MessageType::Broadcast).content(content.clone());
            match peer.send(options) {
                Ok(_) => delivered += 1,
                Err(err) => {
                    tracing::debug!(peer = ?peer.identity(), error = %err, "broadcast skipped peer");
                }
            }
        }
        delivered
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.events.unsubscribe(subscription)
    }

    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<HubEvent> {
        self.events.subscribe_channel()
    }

    /// Destroys every peer connection.
    pub fn shutdown(&self) {
        for peer in self.list() {
            peer.destroy();
        }
    }

    fn route(&self, message: Arc<Message>) {
        if message.to() == SERVER {
            self.events.emit(&HubEvent::Message(message));
            return;
        }

        let from = self.find(message.from());
        let to = self.find(message.to());
        let forward = Forward {
            message: message.clone(),
            destination: to.clone(),
        };
        let hook = self.route_hook.read().clone();
        match (hook, from) {
            (Some(hook), Some(from)) => hook.route(message, from, to, forward),
            _ => forward.forward(),
        }
    }

    fn remove(&self, identity: &str) {
        if self.peers.remove(identity).is_some() {
            tracing::info!(peer = %identity, peers = self.peers.len(), "peer disconnected");
            self.events
                .emit(&HubEvent::Disconnected(identity.to_string()));
        }
    }
}
