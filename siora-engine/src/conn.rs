//! The conn contract shared by the polling and websocket transports.
//!
//! Modeled as a tagged variant rather than a trait object: there are exactly
//! two transports and the engine frequently needs transport-specific access
//! (the HTTP entry point only ever talks to a polling conn).

use std::sync::Arc;

use crate::{
    errors::Error,
    packet::Packet,
    transport::{polling::PollingConn, ws::WsConn, ConnInfo, TransportType},
};

#[derive(Clone)]
pub enum Conn {
    Polling(Arc<PollingConn>),
    Websocket(Arc<WsConn>),
}

impl Conn {
    pub fn transport(&self) -> TransportType {
        match self {
            Conn::Polling(_) => TransportType::Polling,
            Conn::Websocket(_) => TransportType::Websocket,
        }
    }

    pub fn peer(&self) -> &ConnInfo {
        match self {
            Conn::Polling(conn) => conn.peer(),
            Conn::Websocket(conn) => conn.peer(),
        }
    }

    /// Read the next inbound packet. Parks until one is available, the conn
    /// closes, or (polling only) the conn is paused.
    pub async fn read_packet(&self) -> Result<Packet, Error> {
        match self {
            Conn::Polling(conn) => conn.read_packet().await,
            Conn::Websocket(conn) => conn.read_packet().await,
        }
    }

    /// Queue an outbound packet. Parks while the outbound buffer is full;
    /// never drops a packet while paused.
    pub async fn write_packet(&self, packet: Packet) -> Result<(), Error> {
        match self {
            Conn::Polling(conn) => conn.write_packet(packet).await,
            Conn::Websocket(conn) => conn.write_packet(packet).await,
        }
    }

    /// Gate the outbound stream for an upgrade handshake. Resolves once the
    /// buffered outbound packets have been drained by the peer.
    pub async fn pause(&self) -> Result<(), Error> {
        match self {
            Conn::Polling(conn) => conn.pause().await,
            Conn::Websocket(_) => Ok(()),
        }
    }

    pub fn resume(&self) {
        if let Conn::Polling(conn) = self {
            conn.resume();
        }
    }

    pub fn is_paused(&self) -> bool {
        match self {
            Conn::Polling(conn) => conn.is_paused(),
            Conn::Websocket(_) => false,
        }
    }

    pub async fn close(&self) {
        match self {
            Conn::Polling(conn) => conn.close(),
            Conn::Websocket(conn) => conn.close().await,
        }
    }

    pub fn same_conn(&self, other: &Conn) -> bool {
        match (self, other) {
            (Conn::Polling(a), Conn::Polling(b)) => Arc::ptr_eq(a, b),
            (Conn::Websocket(a), Conn::Websocket(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Conn").field(&self.transport()).finish()
    }
}
