use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close,
    Error(String),
}

pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Write side of a full-duplex text socket. Inbound traffic arrives on the
/// [`EventStream`] paired with it in a [`TransportHandle`].
#[async_trait]
pub trait Transport: Send + Sync {
    fn send(&self, text: String) -> Result<()>;

    fn close(&self);

    /// Hard close. Bindings without a distinct abort fall back to `close`.
    fn terminate(&self) {
        self.close();
    }

    /// Resolves once everything queued before a close has been written.
    async fn flushed(&self) {}
}

pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub events: EventStream,
}

impl TransportHandle {
    pub fn new(transport: Arc<dyn Transport>, events: EventStream) -> Self {
        Self { transport, events }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportHandle>;
}
