use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::domains::envelope::{Envelope, MessageType};
use crate::error::{HubError, Result};
use crate::services::connection::{now_millis, Connection, SendOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Created,
    Pending,
    Resolved,
    Rejected,
    #[serde(rename = "timedout")]
    TimedOut,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// The envelope of a message together with the state it was in when captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub state: MessageState,
}

/// Why a message did not resolve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    /// No response arrived before the local deadline.
    #[error("message {} timed out", .0.envelope.uuid)]
    Timeout(Snapshot),
    /// The peer answered with `response.rejected`.
    #[error("rejected by peer")]
    Rejected { content: Value },
    /// The peer gave up on the request and answered with `response.timedout`.
    #[error("peer timed out before responding")]
    TimedOut { content: Value },
    /// The message or its connection was torn down while still pending.
    #[error("message destroyed before completion")]
    Destroyed { content: Value },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("no route to peer {0}")]
    Unroutable(String),
}

impl Rejection {
    /// Payload carried to the peer in a correlated rejection response.
    pub fn content(&self) -> Value {
        match self {
            Rejection::Timeout(snapshot) => serde_json::to_value(snapshot).unwrap_or(Value::Null),
            Rejection::Rejected { content }
            | Rejection::TimedOut { content }
            | Rejection::Destroyed { content } => content.clone(),
            Rejection::Protocol(reason) | Rejection::Unroutable(reason) => {
                Value::String(reason.clone())
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Rejection::Timeout(_) | Rejection::TimedOut { .. })
    }
}

type ReplyResult = std::result::Result<Value, Rejection>;

/// Resolves once the message it was issued for leaves the pending state.
pub struct Reply {
    uuid: String,
    receiver: oneshot::Receiver<ReplyResult>,
}

impl Reply {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl Future for Reply {
    type Output = ReplyResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without settling: the message was torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(Rejection::Destroyed {
                content: Value::Bool(false),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Inner {
    state: MessageState,
    reply: Option<oneshot::Sender<ReplyResult>>,
    receiver: Option<oneshot::Receiver<ReplyResult>>,
    deadline: Option<JoinHandle<()>>,
    settled: bool,
}

pub struct Message {
    envelope: Envelope,
    direction: Direction,
    timeout: Duration,
    connection: Weak<Connection>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("envelope", &self.envelope)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl Message {
    pub fn outbound(
        connection: &Arc<Connection>,
        envelope: Envelope,
        timeout: Duration,
    ) -> Arc<Self> {
        Self::build(connection, envelope, Direction::Outbound, timeout)
    }

    pub fn inbound(
        connection: &Arc<Connection>,
        envelope: Envelope,
        timeout: Duration,
    ) -> Arc<Self> {
        Self::build(connection, envelope, Direction::Inbound, timeout)
    }

    fn build(
        connection: &Arc<Connection>,
        envelope: Envelope,
        direction: Direction,
        timeout: Duration,
    ) -> Arc<Self> {
        let (reply, receiver) = match direction {
            Direction::Outbound => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            Direction::Inbound => (None, None),
        };
        let message = Arc::new(Self {
            envelope,
            direction,
            timeout,
            connection: Arc::downgrade(connection),
            inner: Mutex::new(Inner {
                state: MessageState::Created,
                reply,
                receiver,
                deadline: None,
                settled: false,
            }),
        });
        message.arm_deadline();
        message
    }

    fn arm_deadline(self: &Arc<Self>) {
        let message = Arc::downgrade(self);
        let timeout = self.timeout;
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(message) = message.upgrade() {
                message.expire();
            }
        });
        self.inner.lock().deadline = Some(deadline);
    }

    pub fn uuid(&self) -> &str {
        &self.envelope.uuid
    }

    pub fn kind(&self) -> MessageType {
        self.envelope.kind
    }

    pub fn from(&self) -> &str {
        &self.envelope.from
    }

    pub fn to(&self) -> &str {
        &self.envelope.to
    }

    pub fn content(&self) -> &Value {
        &self.envelope.content
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> MessageState {
        self.inner.lock().state
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            envelope: self.envelope.clone(),
            state: self.state(),
        }
    }

    /// Moves a freshly created message to pending. Outbound messages are written to
    /// the transport and yield a [`Reply`]; inbound messages are dispatched by type.
    pub fn handle(self: &Arc<Self>) -> Result<Option<Reply>> {
        let receiver = {
            let mut inner = self.inner.lock();
            if inner.state != MessageState::Created {
                tracing::debug!(uuid = %self.uuid(), state = ?inner.state, "message already handled");
                return Err(HubError::Protocol(format!(
                    "message {} already handled",
                    self.uuid()
                )));
            }
            inner.state = MessageState::Pending;
            inner.receiver.take()
        };
        tracing::debug!(uuid = %self.uuid(), kind = %self.kind(), direction = ?self.direction, "handling message");

        let Some(connection) = self.connection.upgrade() else {
            self.destroy();
            return Err(HubError::Closed);
        };

        match self.direction {
            Direction::Outbound => self.dispatch(&connection, receiver).map(Some),
            Direction::Inbound => {
                self.process(&connection);
                Ok(None)
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        receiver: Option<oneshot::Receiver<ReplyResult>>,
    ) -> Result<Reply> {
        let Some(receiver) = receiver else {
            self.destroy();
            return Err(HubError::Runtime(format!(
                "message {} has no reply channel",
                self.uuid()
            )));
        };
        let reply = Reply {
            uuid: self.uuid().to_string(),
            receiver,
        };

        let awaits_response = self.kind() == MessageType::Async;
        if awaits_response && !connection.track(self.clone()) {
            return Ok(reply);
        }

        if let Err(err) = connection.transmit(&self.envelope) {
            tracing::warn!(uuid = %self.uuid(), error = %err, "failed to write message");
            self.destroy();
            return Err(err);
        }

        if !awaits_response {
            self.resolve(self.snapshot_value(MessageState::Resolved));
        }
        Ok(reply)
    }

    fn process(self: &Arc<Self>, connection: &Arc<Connection>) {
        match self.kind() {
            MessageType::Initialize => {
                if connection.is_hub_side() {
                    tracing::warn!(uuid = %self.uuid(), peer = %self.from(), "hub-side connection received initialize");
                    self.reject(Rejection::Protocol(
                        "hub-side connections can not be initialized".to_string(),
                    ));
                    return;
                }
                match self.content().as_str().filter(|identity| !identity.is_empty()) {
                    Some(identity) => {
                        connection.set_identity(identity.to_string());
                        self.resolve(Value::Null);
                    }
                    None => {
                        tracing::warn!(uuid = %self.uuid(), "initialize without an identity string");
                        self.reject(Rejection::Protocol(
                            "initialize content must be an identity string".to_string(),
                        ));
                    }
                }
            }
            MessageType::ResponseResolved
            | MessageType::ResponseRejected
            | MessageType::ResponseTimedout => {
                let original = connection.find_outstanding_in(Direction::Outbound, self.uuid());
                match original {
                    Some(original) => {
                        let content = self.content().clone();
                        match self.kind() {
                            MessageType::ResponseResolved => original.resolve(content),
                            MessageType::ResponseRejected => {
                                original.reject(Rejection::Rejected { content })
                            }
                            _ => original.reject(Rejection::TimedOut { content }),
                        };
                    }
                    None => {
                        tracing::debug!(uuid = %self.uuid(), kind = %self.kind(), "dropping response without outstanding request");
                    }
                }
                self.resolve(Value::Null);
            }
            MessageType::Ping => {
                connection.record_latency(self.content());
                self.resolve(Value::Null);
                let pong = SendOptions::new(MessageType::Pong)
                    .to(self.from())
                    .content(Value::from(now_millis()));
                if let Err(err) = connection.send(pong) {
                    tracing::warn!(uuid = %self.uuid(), error = %err, "failed to answer ping");
                }
            }
            MessageType::Pong => {
                connection.record_latency(self.content());
                connection.mark_alive();
                self.resolve(Value::Null);
            }
            MessageType::Async => {
                // Stays pending until the application responds or the deadline fires.
                if connection.track(self.clone()) {
                    connection.surface(self.clone());
                }
            }
            MessageType::Default | MessageType::Broadcast => {
                self.resolve(self.snapshot_value(MessageState::Resolved));
                connection.surface(self.clone());
            }
        }
    }

    fn expects_response(&self) -> bool {
        self.direction == Direction::Inbound && self.kind() == MessageType::Async
    }

    fn ensure_respondable(&self) -> Result<()> {
        if self.expects_response() {
            Ok(())
        } else {
            tracing::warn!(uuid = %self.uuid(), kind = %self.kind(), direction = ?self.direction, "respond on a message that takes no response");
            Err(HubError::Protocol(
                "respond only works on inbound async messages".to_string(),
            ))
        }
    }

    /// Answers an inbound async request with `response.resolved`.
    pub fn respond(&self, content: Value) -> Result<()> {
        self.ensure_respondable()?;
        if !self.resolve(content) {
            tracing::debug!(uuid = %self.uuid(), "response dropped, request already settled");
        }
        Ok(())
    }

    /// Answers an inbound async request with `response.rejected`.
    pub fn respond_rejected(&self, content: Value) -> Result<()> {
        self.ensure_respondable()?;
        if !self.reject(Rejection::Rejected { content }) {
            tracing::debug!(uuid = %self.uuid(), "rejection dropped, request already settled");
        }
        Ok(())
    }

    /// Only effective while pending. Returns whether this call settled the message.
    pub fn resolve(&self, value: Value) -> bool {
        let reply = {
            let mut inner = self.inner.lock();
            if inner.state != MessageState::Pending {
                tracing::debug!(uuid = %self.uuid(), state = ?inner.state, "cannot resolve message, not pending");
                return false;
            }
            inner.state = MessageState::Resolved;
            inner.settled = true;
            inner.reply.take()
        };
        tracing::debug!(uuid = %self.uuid(), "resolving message");

        if self.expects_response() {
            self.send_response(MessageType::ResponseResolved, value.clone());
        }
        if let Some(reply) = reply {
            let _ = reply.send(Ok(value));
        }
        self.destroy();
        true
    }

    /// Effective while pending or timed out. An inbound async request answers its
    /// peer with `response.rejected` or `response.timedout` accordingly.
    pub fn reject(&self, rejection: Rejection) -> bool {
        let (reply, response_kind) = {
            let mut inner = self.inner.lock();
            let response_kind = match inner.state {
                MessageState::Pending => {
                    inner.state = MessageState::Rejected;
                    MessageType::ResponseRejected
                }
                MessageState::TimedOut if !inner.settled => MessageType::ResponseTimedout,
                state => {
                    tracing::debug!(uuid = %self.uuid(), ?state, "cannot reject message, not pending");
                    return false;
                }
            };
            inner.settled = true;
            (inner.reply.take(), response_kind)
        };
        tracing::debug!(uuid = %self.uuid(), reason = %rejection, "rejecting message");

        if self.expects_response() {
            self.send_response(response_kind, rejection.content());
        }
        if let Some(reply) = reply {
            let _ = reply.send(Err(rejection));
        }
        self.destroy();
        true
    }

    /// Idempotent. A message torn down while pending is rejected first.
    pub fn destroy(&self) {
        let unsettled = {
            let inner = self.inner.lock();
            match inner.state {
                MessageState::Pending => Some(false),
                MessageState::TimedOut if !inner.settled => Some(true),
                _ => None,
            }
        };
        match unsettled {
            Some(false) => {
                tracing::debug!(uuid = %self.uuid(), "early destroy of pending message");
                if self.reject(Rejection::Destroyed {
                    content: Value::Bool(false),
                }) {
                    return;
                }
            }
            Some(true) => {
                if self.reject(Rejection::Timeout(self.snapshot())) {
                    return;
                }
            }
            None => {}
        }

        let deadline = {
            let mut inner = self.inner.lock();
            if inner.state == MessageState::Destroyed {
                return;
            }
            inner.state = MessageState::Destroyed;
            inner.reply = None;
            inner.receiver = None;
            inner.deadline.take()
        };
        if let Some(deadline) = deadline {
            deadline.abort();
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.forget(self);
        }
        tracing::debug!(uuid = %self.uuid(), "message destroyed");
    }

    /// Deadline expiry: pending becomes timed out, then rejects.
    pub(crate) fn expire(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            // May be running inside the deadline task itself, so detach instead of aborting.
            inner.deadline.take();
            match inner.state {
                MessageState::Pending => {
                    inner.state = MessageState::TimedOut;
                    true
                }
                MessageState::Created => false,
                _ => return,
            }
        };
        if pending {
            tracing::debug!(uuid = %self.uuid(), timeout = ?self.timeout, "message timed out");
            self.reject(Rejection::Timeout(self.snapshot()));
        } else {
            self.destroy();
        }
    }

    fn snapshot_value(&self, state: MessageState) -> Value {
        let snapshot = Snapshot {
            envelope: self.envelope.clone(),
            state,
        };
        serde_json::to_value(snapshot).unwrap_or(Value::Null)
    }

    fn send_response(&self, kind: MessageType, content: Value) {
        let Some(connection) = self.connection.upgrade() else {
            tracing::debug!(uuid = %self.uuid(), %kind, "connection gone, response not sent");
            return;
        };
        let response = self.envelope.response(kind, content);
        if let Err(err) = connection.transmit(&response) {
            tracing::warn!(uuid = %self.uuid(), %kind, error = %err, "failed to send response");
        }
    }
}
