use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{HubError, Result};
use crate::interfaces::transport::{Connector, Transport, TransportEvent, TransportHandle};
use crate::services::hub::Hub;

/// One end of an in-process socket pair.
pub struct MemoryTransport {
    local: mpsc::UnboundedSender<TransportEvent>,
    remote: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        self.remote
            .send(TransportEvent::Message(text))
            .map_err(|_| HubError::Closed)
    }

    /// Both ends observe `Close`, once.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.local.send(TransportEvent::Close);
        let _ = self.remote.send(TransportEvent::Close);
    }
}

/// Two linked, already open transports. Text sent on one arrives on the other.
pub fn pair() -> (TransportHandle, TransportHandle) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let _ = left_tx.send(TransportEvent::Open);
    let _ = right_tx.send(TransportEvent::Open);

    let left = MemoryTransport {
        local: left_tx.clone(),
        remote: right_tx.clone(),
        closed: closed.clone(),
    };
    let right = MemoryTransport {
        local: right_tx,
        remote: left_tx,
        closed,
    };
    (
        TransportHandle::new(Arc::new(left), left_rx),
        TransportHandle::new(Arc::new(right), right_rx),
    )
}

/// Connects straight into a [`Hub`] living in the same process. The URL is ignored.
#[derive(Clone)]
pub struct MemoryConnector {
    hub: Arc<Hub>,
}

impl MemoryConnector {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<TransportHandle> {
        let (client, server) = pair();
        self.hub.accept(server, json!({ "transport": "memory" }));
        Ok(client)
    }
}
