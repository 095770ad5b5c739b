//! The websocket conn and the request path that creates it.
//!
//! The handshake itself is delegated to hyper's upgrade machinery and
//! tungstenite; the conn consumes the upgraded byte stream. New sessions and
//! upgrade candidates both land here, the difference being the presence of a
//! `sid` in the query.

use std::sync::Arc;

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::upgrade::Upgraded;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    tungstenite::{handshake::derive_accept_key, protocol::Role, Message},
    WebSocketStream,
};

use crate::{
    body::ResponseBody,
    conn::Conn,
    errors::Error,
    handler::EngineHandler,
    packet::{MessageType, Packet, PacketType},
    server::EngineServer,
    sid::Sid,
    transport::{ConnInfo, TransportType},
};

pub struct WsConn {
    tx: Mutex<SplitSink<WebSocketStream<Upgraded>, Message>>,
    rx: Mutex<SplitStream<WebSocketStream<Upgraded>>>,
    peer: ConnInfo,
}

impl WsConn {
    fn new(ws: WebSocketStream<Upgraded>, peer: ConnInfo) -> Self {
        let (tx, rx) = ws.split();
        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            peer,
        }
    }

    pub fn peer(&self) -> &ConnInfo {
        &self.peer
    }

    pub(crate) async fn read_packet(&self) -> Result<Packet, Error> {
        let mut rx = self.rx.lock().await;
        while let Some(msg) = rx.next().await {
            match msg? {
                Message::Text(text) => return Packet::decode_text(&text),
                Message::Binary(data) => {
                    let (digit, payload) = data.split_first().ok_or(Error::InvalidPacketType)?;
                    let packet_type = PacketType::from_digit(*digit)?;
                    return Ok(Packet::binary(packet_type, payload.to_vec()));
                }
                // ws-level pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(_) => return Err(Error::ConnClosed),
            }
        }
        Err(Error::ConnClosed)
    }

    pub(crate) async fn write_packet(&self, packet: Packet) -> Result<(), Error> {
        // a Noop left over from the polling upgrade has no meaning on ws
        if packet.packet_type == PacketType::Noop {
            return Ok(());
        }
        let msg = match packet.msg_type {
            MessageType::Text => Message::Text(packet.encode_text()?),
            MessageType::Binary => {
                let mut data = Vec::with_capacity(1 + packet.data.len());
                data.push(packet.packet_type.digit());
                data.extend_from_slice(&packet.data);
                Message::Binary(data)
            }
        };
        self.tx.lock().await.send(msg).await?;
        Ok(())
    }

    pub(crate) async fn close(&self) {
        self.tx.lock().await.send(Message::Close(None)).await.ok();
    }
}

/// Create a response for a websocket upgrade request.
fn ws_response<B>(ws_key: &HeaderValue) -> Result<Response<ResponseBody<B>>, http::Error> {
    let derived = derive_accept_key(ws_key.as_bytes());
    let sec = derived.parse::<HeaderValue>().unwrap();
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::UPGRADE, HeaderValue::from_static("websocket"))
        .header(
            http::header::CONNECTION,
            HeaderValue::from_static("Upgrade"),
        )
        .header(http::header::SEC_WEBSOCKET_ACCEPT, sec)
        .body(ResponseBody::empty_response())
}

/// Answer the websocket handshake and drive the accepted conn in a
/// background task: a fresh session when no sid is given, an upgrade
/// candidate otherwise.
pub(crate) fn serve<H, R, B>(
    engine: Arc<EngineServer<H>>,
    sid: Option<Sid>,
    req: Request<R>,
) -> Result<Response<ResponseBody<B>>, Error>
where
    H: EngineHandler,
{
    let (parts, _) = req.into_parts();
    let ws_key = parts
        .headers
        .get("Sec-WebSocket-Key")
        .ok_or(Error::HttpErrorResponse(StatusCode::BAD_REQUEST))?
        .clone();
    let peer = ConnInfo::from_parts(&parts);

    let req = Request::from_parts(parts, ());
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(conn) => match on_init(engine, conn, sid, peer).await {
                Ok(_) => tracing::debug!("ws conn accepted"),
                Err(e) => tracing::debug!("ws conn rejected: {:?}", e),
            },
            Err(e) => tracing::debug!("ws upgrade error: {}", e),
        }
    });

    Ok(ws_response(&ws_key)?)
}

async fn on_init<H: EngineHandler>(
    engine: Arc<EngineServer<H>>,
    conn: Upgraded,
    sid: Option<Sid>,
    peer: ConnInfo,
) -> Result<(), Error> {
    let ws = WebSocketStream::from_raw_socket(conn, Role::Server, None).await;
    let conn = Conn::Websocket(Arc::new(WsConn::new(ws, peer)));

    match sid {
        Some(sid) => {
            let socket = engine.get_socket(sid).ok_or(Error::UnknownSession)?;
            if socket.current_conn().await.transport() == TransportType::Websocket {
                conn.close().await;
                return Err(Error::UpgradeFailed);
            }
            tracing::debug!("[sid={sid}] websocket upgrade candidate");
            socket.upgrade(conn).await?;
            engine.handler().on_upgrade(socket);
        }
        None => {
            let socket = engine.create_session(conn, TransportType::Websocket)?;
            tracing::debug!("[sid={}] new websocket session", socket.sid);
        }
    }
    Ok(())
}
