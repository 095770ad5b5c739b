//! A [`Socket`] is one client connection carrying any number of namespaces
//! over a single engine session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use serde::Serialize;
use serde_json::Value;
use siora_engine::{Event, Sid, Socket as EioSocket};
use tokio::sync::oneshot;

use crate::{
    config::SocketIoConfig,
    errors::{AckError, Error},
    ns::{AckResponse, Namespace},
    packet::Packet,
    parser::{Decoder, Frame, Parser},
};

pub struct Socket {
    /// The engine session id this socket rides on.
    pub sid: Sid,
    esocket: Arc<EioSocket>,
    parser: Parser,
    pub(crate) decoder: Mutex<Decoder>,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    config: Arc<SocketIoConfig>,
}

impl Socket {
    pub(crate) fn new(esocket: Arc<EioSocket>, parser: Parser, config: Arc<SocketIoConfig>) -> Self {
        Self {
            sid: esocket.sid,
            decoder: Mutex::new(parser.decoder()),
            esocket,
            parser,
            namespaces: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register (or fetch) the namespace for `path`. Registration is
    /// idempotent; only namespaces the application registered this way (or
    /// through [`Socket::on`]) are attachable by the peer.
    pub fn of(&self, path: &str) -> Arc<Namespace> {
        let path = normalize(path);
        if let Some(ns) = self.namespaces.read().unwrap().get(&path) {
            return ns.clone();
        }
        self.namespaces
            .write()
            .unwrap()
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Namespace::new(path)))
            .clone()
    }

    pub(crate) fn try_nsp(&self, path: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().unwrap().get(&normalize(path)).cloned()
    }

    /// Register an event handler on a namespace of this socket.
    ///
    /// The handler receives the decoded JSON argument list and the pool of
    /// binary buffers; values it returns are shipped back as an ack when the
    /// inbound event carried an ack id.
    pub fn on<C, F>(&self, ns: &str, event: impl Into<String>, callback: C)
    where
        C: Fn(Arc<Socket>, Value, Vec<Vec<u8>>) -> F + Send + Sync + 'static,
        F: std::future::Future<Output = Result<Option<Value>, tower::BoxError>> + Send + 'static,
    {
        self.of(ns).on(event, callback);
    }

    /// Emit an event on a namespace.
    ///
    /// Array-like data is spread into multiple event arguments; wrap an
    /// array in another array to send it as the single first argument.
    pub fn emit(&self, ns: &str, event: &str, data: impl Serialize) -> Result<(), Error> {
        let data = serde_json::to_value(data)?;
        self.send_packet(Packet::event(normalize(ns), event, data))
    }

    /// Emit an event with binary attachments on a namespace.
    pub fn emit_binary(
        &self,
        ns: &str,
        event: &str,
        data: impl Serialize,
        bin: Vec<Vec<u8>>,
    ) -> Result<(), Error> {
        let data = serde_json::to_value(data)?;
        self.send_packet(Packet::bin_event(normalize(ns), event, data, bin))
    }

    /// Emit an event and wait for the peer's acknowledgement.
    ///
    /// A fresh ack id is allocated on the namespace; the returned future
    /// resolves with the ack data or an [`AckError`] after the configured
    /// timeout.
    pub async fn emit_with_ack(
        &self,
        ns: &str,
        event: &str,
        data: impl Serialize,
    ) -> Result<AckResponse, AckError> {
        let ns = normalize(ns);
        let data = serde_json::to_value(data)?;
        let nsp = self.of(&ns);
        let id = nsp.next_ack_id();
        let (tx, rx) = oneshot::channel();
        nsp.register_ack(id, tx);
        self.send_packet(Packet::event_with_ack(ns, event, data, id))?;
        let response = tokio::time::timeout(self.config.ack_timeout, rx).await??;
        Ok(response)
    }

    /// Close the underlying engine session (and with it every namespace).
    pub fn close(&self) {
        self.esocket.close();
    }

    /// Encode a packet and ship its frames through the engine socket.
    pub(crate) fn send_packet(&self, packet: Packet) -> Result<(), Error> {
        for frame in self.parser.encode(packet)? {
            match frame {
                Frame::Text(text) => self.esocket.emit(Event::Message, text)?,
                Frame::Binary(data) => self.esocket.emit(Event::Message, data)?,
            }
        }
        Ok(())
    }

    pub(crate) fn detach(&self, ns: &str) {
        if let Some(nsp) = self.namespaces.write().unwrap().remove(&normalize(ns)) {
            nsp.detach_handlers();
        }
    }

    /// Detach every namespace; pending ack futures resolve with an error.
    pub(crate) fn detach_all(&self) {
        for (_, nsp) in self.namespaces.write().unwrap().drain() {
            nsp.detach_handlers();
        }
    }
}

fn normalize(ns: &str) -> String {
    if ns.is_empty() {
        return "/".to_string();
    }
    if ns.starts_with('/') {
        ns.to_string()
    } else {
        format!("/{ns}")
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.sid)
            .field("namespaces", &self.namespaces.read().unwrap().len())
            .finish()
    }
}
