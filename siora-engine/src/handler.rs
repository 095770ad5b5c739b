//! The handler trait through which the engine surfaces session events.

use std::sync::Arc;

use bytes::Bytes;

use crate::{errors::Error, socket::Socket};

/// Registered listener for the typed events a session emits: open, close,
/// upgrade, inbound messages and non-fatal errors.
#[async_trait::async_trait]
pub trait EngineHandler: Send + Sync + 'static {
    /// Called when a new session is created, after its Open handshake packet
    /// has been queued.
    fn on_open(&self, socket: Arc<Socket>);

    /// Called exactly once when a session reaches its terminal state.
    fn on_close(&self, socket: Arc<Socket>);

    /// Called after a successful transport upgrade.
    fn on_upgrade(&self, socket: Arc<Socket>) {
        let _ = socket;
    }

    /// Called for non-fatal protocol violations on an open session.
    fn on_error(&self, socket: Arc<Socket>, err: Error) {
        tracing::debug!("[sid={}] engine error: {:?}", socket.sid, err);
    }

    /// Called for every inbound text message packet.
    async fn on_message(&self, msg: String, socket: Arc<Socket>);

    /// Called for every inbound binary message packet.
    async fn on_binary(&self, data: Bytes, socket: Arc<Socket>);
}

#[async_trait::async_trait]
impl<T: EngineHandler> EngineHandler for Arc<T> {
    fn on_open(&self, socket: Arc<Socket>) {
        (**self).on_open(socket)
    }

    fn on_close(&self, socket: Arc<Socket>) {
        (**self).on_close(socket)
    }

    fn on_upgrade(&self, socket: Arc<Socket>) {
        (**self).on_upgrade(socket)
    }

    fn on_error(&self, socket: Arc<Socket>, err: Error) {
        (**self).on_error(socket, err)
    }

    async fn on_message(&self, msg: String, socket: Arc<Socket>) {
        (**self).on_message(msg, socket).await
    }

    async fn on_binary(&self, data: Bytes, socket: Arc<Socket>) {
        (**self).on_binary(data, socket).await
    }
}
