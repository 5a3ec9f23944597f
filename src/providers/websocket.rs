use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WireMessage;

use crate::error::{HubError, Result};
use crate::interfaces::transport::{Connector, Transport, TransportEvent, TransportHandle};

/// How long a terminated socket may spend writing out frames already queued.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Outgoing {
    Text(String),
    Close,
}

enum Frame {
    Text(String),
    Close,
    Control,
}

/// A WebSocket split into a writer task fed by a queue and a reader task that
/// publishes [`TransportEvent`]s.
struct WsTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Closed when the writer task ends, however it ends.
    written: watch::Receiver<()>,
}

#[async_trait]
impl Transport for WsTransport {
    fn send(&self, text: String) -> Result<()> {
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| HubError::Closed)
    }

    fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    /// Stops reading at once. The writer gets [`DRAIN_TIMEOUT`] to flush the
    /// queue and the close frame before it is aborted.
    fn terminate(&self) {
        self.close();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let Some(writer) = self.writer.lock().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let abort = writer.abort_handle();
                    if tokio::time::timeout(DRAIN_TIMEOUT, writer).await.is_err() {
                        tracing::debug!("websocket writer did not drain in time");
                        abort.abort();
                    }
                });
            }
            Err(_) => writer.abort(),
        }
    }

    async fn flushed(&self) {
        let mut written = self.written.clone();
        while written.changed().await.is_ok() {}
    }
}

fn bind<S, M, E>(socket: S, encode: fn(Outgoing) -> M, decode: fn(M) -> Frame) -> TransportHandle
where
    S: Stream<Item = std::result::Result<M, E>> + Sink<M> + Send + 'static,
    <S as Sink<M>>::Error: Display,
    M: Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = watch::channel(());

    let writer = tokio::spawn(async move {
        let _written = written_tx;
        while let Some(outgoing) = outgoing_rx.recv().await {
            let closing = matches!(outgoing, Outgoing::Close);
            if let Err(err) = sink.send(encode(outgoing)).await {
                tracing::debug!(error = %err, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        let _ = events_tx.send(TransportEvent::Open);
        while let Some(frame) = stream.next().await {
            match frame.map(decode) {
                Ok(Frame::Text(text)) => {
                    if events_tx.send(TransportEvent::Message(text)).is_err() {
                        return;
                    }
                }
                Ok(Frame::Close) => break,
                Ok(Frame::Control) => {}
                Err(err) => {
                    let _ = events_tx.send(TransportEvent::Error(err.to_string()));
                    return;
                }
            }
        }
        let _ = events_tx.send(TransportEvent::Close);
    });

    let transport = WsTransport {
        outgoing: outgoing_tx,
        writer: Mutex::new(Some(writer)),
        reader: Mutex::new(Some(reader)),
        written: written_rx,
    };
    TransportHandle::new(std::sync::Arc::new(transport), events_rx)
}

/// Binds a socket accepted by axum's upgrade handler.
pub fn server_transport(socket: WebSocket) -> TransportHandle {
    bind(
        socket,
        |outgoing| match outgoing {
            Outgoing::Text(text) => AxumMessage::Text(text.into()),
            Outgoing::Close => AxumMessage::Close(None),
        },
        |message| match message {
            AxumMessage::Text(text) => Frame::Text(text.to_string()),
            AxumMessage::Close(_) => Frame::Close,
            _ => Frame::Control,
        },
    )
}

/// Dials hubs with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportHandle> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| HubError::Transport(e.to_string()))?;
        tracing::debug!(%url, "websocket connected");
        Ok(bind(
            socket,
            |outgoing| match outgoing {
                Outgoing::Text(text) => WireMessage::Text(text.into()),
                Outgoing::Close => WireMessage::Close(None),
            },
            |message| match message {
                WireMessage::Text(text) => Frame::Text(text.as_str().to_string()),
                WireMessage::Close(_) => Frame::Close,
                _ => Frame::Control,
            },
        ))
    }
}
