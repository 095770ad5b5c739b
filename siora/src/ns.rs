//! A namespace is a logical channel multiplexed over one socket: its own
//! event handlers, its own ack registry, its own monotone ack counter.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use futures::Future;
use serde_json::Value;
use tokio::sync::oneshot;
use tower::BoxError;

use crate::socket::Socket;

/// Boxed event handler: decoded JSON arguments plus the pool of binary
/// buffers, returning the values to ship back if the event carried an ack id.
pub type EventCallback = Box<
    dyn Fn(
            Arc<Socket>,
            Value,
            Vec<Vec<u8>>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, BoxError>> + Send>>
        + Send
        + Sync,
>;

/// Data and binary buffers carried by an ack response.
#[derive(Debug, Clone, PartialEq)]
pub struct AckResponse {
    pub data: Value,
    pub binary: Vec<Vec<u8>>,
}

pub struct Namespace {
    pub path: String,
    handlers: RwLock<HashMap<String, EventCallback>>,
    acks: Mutex<HashMap<i64, oneshot::Sender<AckResponse>>>,
    ack_counter: AtomicI64,
}

impl Namespace {
    pub(crate) fn new(path: String) -> Self {
        Self {
            path,
            handlers: RwLock::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            ack_counter: AtomicI64::new(0),
        }
    }

    /// Register a handler for `event`, replacing any previous one.
    pub fn on<C, F>(&self, event: impl Into<String>, callback: C)
    where
        C: Fn(Arc<Socket>, Value, Vec<Vec<u8>>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Option<Value>, BoxError>> + Send + 'static,
    {
        let handler: EventCallback =
            Box::new(move |socket, data, bin| Box::pin(callback(socket, data, bin)) as _);
        self.handlers.write().unwrap().insert(event.into(), handler);
    }

    pub(crate) fn has_handler(&self, event: &str) -> bool {
        self.handlers.read().unwrap().contains_key(event)
    }

    /// Dispatch an event to its handler and hand back the returned values.
    pub(crate) async fn fire_event(
        &self,
        socket: Arc<Socket>,
        event: &str,
        data: Value,
        bin: Vec<Vec<u8>>,
    ) -> Result<Option<Value>, BoxError> {
        let fut = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(event).map(|handler| handler(socket, data, bin))
        };
        match fut {
            Some(fut) => fut.await,
            None => Ok(None),
        }
    }

    /// Allocate the next ack id. Ids are unique per namespace per socket and
    /// strictly increasing.
    pub(crate) fn next_ack_id(&self) -> i64 {
        self.ack_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn register_ack(&self, id: i64, tx: oneshot::Sender<AckResponse>) {
        self.acks.lock().unwrap().insert(id, tx);
    }

    /// Resolve a pending ack. The handler is invoked at most once: the entry
    /// is removed before the response is delivered.
    pub(crate) fn fire_ack(&self, id: i64, response: AckResponse) {
        if let Some(tx) = self.acks.lock().unwrap().remove(&id) {
            tx.send(response).ok();
        } else {
            tracing::debug!("ack {id} on {} has no pending handler", self.path);
        }
    }

    /// Drop every handler and pending ack; waiting ack futures resolve with
    /// a receive error.
    pub(crate) fn detach_handlers(&self) {
        self.handlers.write().unwrap().clear();
        self.acks.lock().unwrap().clear();
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("pending_acks", &self.acks.lock().unwrap().len())
            .finish()
    }
}
