use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ConnectionSettings;
use crate::domains::envelope::{self, Envelope, MessageType, SERVER};
use crate::domains::message::{Direction, Message, Reply, Rejection};
use crate::error::{HubError, Result};
use crate::interfaces::transport::{
    Connector, EventStream, Transport, TransportEvent, TransportHandle,
};
use crate::services::events::{EventEmitter, Subscription};
use crate::services::heartbeat::Heartbeat;

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    Initialized(String),
    Message(Arc<Message>),
    Error(String),
    Closed,
}

/// Envelope fields for [`Connection::send`]. Unset fields take the connection's defaults.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub uuid: Option<String>,
    pub kind: MessageType,
    pub from: Option<String>,
    pub to: Option<String>,
    pub content: Value,
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn request(content: Value) -> Self {
        Self::new(MessageType::Async).content(content)
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn sender(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<Envelope> for SendOptions {
    fn from(envelope: Envelope) -> Self {
        Self {
            uuid: Some(envelope.uuid),
            kind: envelope.kind,
            from: Some(envelope.from),
            to: Some(envelope.to),
            content: envelope.content,
            timeout: None,
        }
    }
}

#[derive(Default)]
struct Liveness {
    awaiting_pong: bool,
    last_pong_at: Option<Instant>,
    latency: Option<Duration>,
}

/// One transport bound to one logical peer.
pub struct Connection {
    hub_side: bool,
    settings: ConnectionSettings,
    auth: Value,
    identity: watch::Sender<Option<String>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    outstanding: Mutex<HashMap<(Direction, String), Arc<Message>>>,
    liveness: Mutex<Liveness>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: Arc<EventEmitter<ConnectionEvent>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity())
            .field("hub_side", &self.hub_side)
            .field("outstanding", &self.outstanding_len())
            .finish()
    }
}

impl Connection {
    fn build(
        hub_side: bool,
        identity: Option<String>,
        auth: Value,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (identity, _) = watch::channel(identity);
        Arc::new(Self {
            hub_side,
            settings,
            auth,
            identity,
            transport: RwLock::new(None),
            outstanding: Mutex::new(HashMap::new()),
            liveness: Mutex::new(Liveness::default()),
            tasks: Mutex::new(Vec::new()),
            events: Arc::new(EventEmitter::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Client end; its identity is assigned by the hub's `initialize`.
    pub fn client(settings: ConnectionSettings) -> Arc<Self> {
        Self::build(false, None, Value::Null, settings)
    }

    /// Hub end of a peer. Call [`Connection::attach`] once subscribers are in place.
    pub fn hub_side(
        identity: impl Into<String>,
        auth: Value,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        Self::build(true, Some(identity.into()), auth, settings)
    }

    pub async fn connect(
        connector: &dyn Connector,
        url: &str,
        settings: ConnectionSettings,
    ) -> Result<Arc<Self>> {
        let handle = connector.connect(url).await?;
        let connection = Self::client(settings);
        connection.attach(handle);
        Ok(connection)
    }

    /// Binds a transport and starts reading from it. A previously attached
    /// transport is terminated.
    pub fn attach(self: &Arc<Self>, handle: TransportHandle) {
        let TransportHandle { transport, events } = handle;
        if self.is_destroyed() {
            transport.terminate();
            return;
        }
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        if let Some(previous) = self.transport.write().replace(transport.clone()) {
            tracing::debug!(peer = ?self.identity(), "replacing attached transport");
            previous.terminate();
        }

        tasks.push(tokio::spawn(Self::read_loop(
            Arc::downgrade(self),
            transport,
            events,
        )));
        tasks.push(Heartbeat::new(&self.settings).start(self));
    }

    async fn read_loop(
        connection: Weak<Connection>,
        transport: Arc<dyn Transport>,
        mut events: EventStream,
    ) {
        while let Some(event) = events.recv().await {
            let Some(connection) = connection.upgrade() else {
                return;
            };
            match event {
                TransportEvent::Open => connection.events.emit(&ConnectionEvent::Open),
                TransportEvent::Message(raw) => connection.receive(&raw),
                TransportEvent::Error(error) => {
                    tracing::warn!(peer = ?connection.identity(), %error, "transport error");
                    connection.events.emit(&ConnectionEvent::Error(error));
                    connection.transport_closed(&transport);
                    return;
                }
                TransportEvent::Close => {
                    connection.transport_closed(&transport);
                    return;
                }
            }
        }
        if let Some(connection) = connection.upgrade() {
            connection.transport_closed(&transport);
        }
    }

    /// A replaced transport closing must not take the connection down with it.
    fn transport_closed(&self, transport: &Arc<dyn Transport>) {
        let current = self
            .transport
            .read()
            .as_ref()
            .is_some_and(|attached| same_transport(attached, transport));
        if current {
            self.destroy();
        }
    }

    /// Decodes and dispatches one inbound frame. Malformed frames are logged and dropped.
    pub fn receive(self: &Arc<Self>, raw: &str) {
        let mut envelope = match envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(peer = ?self.identity(), error = %err, "dropping malformed frame");
                return;
            }
        };
        // Only the hub knows who is on the other end; it never trusts the wire.
        if self.hub_side {
            envelope.from = self.identity().unwrap_or_default();
        }
        let message = Message::inbound(self, envelope, self.settings.timeout);
        if let Err(err) = message.handle() {
            tracing::warn!(uuid = %message.uuid(), error = %err, "failed to handle inbound message");
        }
    }

    pub fn send(self: &Arc<Self>, options: SendOptions) -> Result<Reply> {
        if self.is_destroyed() {
            return Err(HubError::Closed);
        }
        let envelope = Envelope {
            uuid: options.uuid.unwrap_or_else(envelope::new_id),
            kind: options.kind,
            from: options.from.unwrap_or_else(|| self.local_identity()),
            to: options.to.unwrap_or_else(|| self.remote_identity()),
            content: options.content,
        };
        let timeout = options.timeout.unwrap_or(self.settings.timeout);
        let message = Message::outbound(self, envelope, timeout);
        message
            .handle()?
            .ok_or_else(|| HubError::Runtime("outbound message produced no reply".to_string()))
    }

    pub(crate) fn transmit(&self, envelope: &Envelope) -> Result<()> {
        let transport = self.transport.read().clone().ok_or(HubError::Closed)?;
        let text = envelope::encode(envelope)?;
        transport.send(text)
    }

    /// Looks up a pending message by uuid, preferring this side's own requests
    /// over requests received from the peer.
    pub fn find_outstanding(&self, uuid: &str) -> Option<Arc<Message>> {
        self.find_outstanding_in(Direction::Outbound, uuid)
            .or_else(|| self.find_outstanding_in(Direction::Inbound, uuid))
    }

    pub fn find_outstanding_in(&self, direction: Direction, uuid: &str) -> Option<Arc<Message>> {
        self.outstanding
            .lock()
            .get(&(direction, uuid.to_string()))
            .cloned()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Registers a pending message. A uuid already pending in the same direction
    /// is kept and the newcomer is rejected.
    pub(crate) fn track(&self, message: Arc<Message>) -> bool {
        if self.is_destroyed() {
            message.destroy();
            return false;
        }
        let key = (message.direction(), message.uuid().to_string());
        let duplicate = {
            let mut outstanding = self.outstanding.lock();
            if outstanding.contains_key(&key) {
                true
            } else {
                outstanding.insert(key, message.clone());
                false
            }
        };
        if duplicate {
            tracing::warn!(uuid = %message.uuid(), direction = ?message.direction(), "uuid already outstanding");
            message.reject(Rejection::Protocol(format!(
                "message {} is already outstanding",
                message.uuid()
            )));
            return false;
        }
        true
    }

    pub(crate) fn forget(&self, message: &Message) {
        let key = (message.direction(), message.uuid().to_string());
        let mut outstanding = self.outstanding.lock();
        let tracked = outstanding
            .get(&key)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), message));
        if tracked {
            outstanding.remove(&key);
        }
    }

    pub(crate) fn surface(&self, message: Arc<Message>) {
        self.events.emit(&ConnectionEvent::Message(message));
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.borrow().clone()
    }

    pub(crate) fn set_identity(&self, identity: String) {
        tracing::debug!(%identity, "identity assigned");
        self.identity.send_replace(Some(identity.clone()));
        self.events.emit(&ConnectionEvent::Initialized(identity));
    }

    /// Waits until an identity is known.
    pub async fn ready(&self) -> Option<String> {
        let mut identity = self.identity.subscribe();
        let current = identity.wait_for(Option::is_some).await.ok()?;
        current.clone()
    }

    /// Identity used as `from` on envelopes this side originates.
    pub fn local_identity(&self) -> String {
        if self.hub_side {
            SERVER.to_string()
        } else {
            self.identity().unwrap_or_default()
        }
    }

    /// Default `to` for envelopes this side originates.
    pub fn remote_identity(&self) -> String {
        if self.hub_side {
            self.identity().unwrap_or_default()
        } else {
            SERVER.to_string()
        }
    }

    pub fn is_hub_side(&self) -> bool {
        self.hub_side
    }

    pub fn auth(&self) -> &Value {
        &self.auth
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn latency(&self) -> Option<Duration> {
        self.liveness.lock().latency
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.liveness.lock().last_pong_at
    }

    pub(crate) fn record_latency(&self, sent_at: &Value) {
        let Some(sent_at) = sent_at.as_i64() else {
            tracing::debug!(?sent_at, "heartbeat without a timestamp");
            return;
        };
        let elapsed = now_millis().saturating_sub(sent_at).max(0) as u64;
        self.liveness.lock().latency = Some(Duration::from_millis(elapsed));
    }

    pub(crate) fn mark_alive(&self) {
        let mut liveness = self.liveness.lock();
        liveness.awaiting_pong = false;
        liveness.last_pong_at = Some(Instant::now());
    }

    /// One heartbeat tick: evicts a peer that missed the previous ping, otherwise pings.
    pub(crate) fn heartbeat(self: &Arc<Self>) {
        let missed = {
            let mut liveness = self.liveness.lock();
            std::mem::replace(&mut liveness.awaiting_pong, true)
        };
        if missed {
            tracing::warn!(peer = ?self.identity(), "no pong since last ping, destroying connection");
            self.destroy();
            return;
        }
        let ping = SendOptions::new(MessageType::Ping).content(Value::from(now_millis()));
        if let Err(err) = self.send(ping) {
            tracing::warn!(peer = ?self.identity(), error = %err, "failed to send ping");
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.events.unsubscribe(subscription)
    }

    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.events.subscribe_channel()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Rejects every outstanding message, stops the heartbeat and closes the transport.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(peer = ?self.identity(), hub_side = self.hub_side, "destroying connection");

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let outstanding: Vec<Arc<Message>> = self
            .outstanding
            .lock()
            .drain()
            .map(|(_, message)| message)
            .collect();
        for message in outstanding {
            message.destroy();
        }

        if let Some(transport) = self.transport.write().take() {
            transport.terminate();
        }
        self.events.emit(&ConnectionEvent::Closed);
    }

    /// Destroys the connection and waits until frames queued before teardown,
    /// including the rejections of outstanding requests, are written out.
    pub async fn close(&self) {
        let transport = self.transport.read().clone();
        self.destroy();
        if let Some(transport) = transport {
            transport.flushed().await;
        }
    }
}

/// Dropping the last handle tears the connection down like [`Connection::destroy`].
impl Drop for Connection {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn same_transport(left: &Arc<dyn Transport>, right: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(left) as *const (),
        Arc::as_ptr(right) as *const (),
    )
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
