use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Detach token returned by [`EventEmitter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Synchronous fan-out to every handler registered at emit time.
pub struct EventEmitter<E> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(u64, Handler<E>)>>,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push((id, Arc::new(handler)));
        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription.0);
        handlers.len() != before
    }

    pub fn emit(&self, event: &E) {
        // Handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler<E>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

impl<E: Clone + Send + 'static> EventEmitter<E> {
    /// Adapts the emitter to an async consumer. The subscription ends when the
    /// receiver is dropped and the next event fails to send.
    pub fn subscribe_channel(self: &Arc<Self>) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Arc::downgrade(self);
        let slot: Arc<parking_lot::Mutex<Option<Subscription>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let slot_task = slot.clone();
        let subscription = self.subscribe(move |event: &E| {
            if tx.send(event.clone()).is_err() {
                if let (Some(emitter), Some(subscription)) =
                    (emitter.upgrade(), slot_task.lock().take())
                {
                    emitter.unsubscribe(subscription);
                }
            }
        });
        *slot.lock() = Some(subscription);
        rx
    }
}
