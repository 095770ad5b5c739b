//! The engine server: creates sessions on first contact, routes follow-up
//! requests to them, supervises the per-session reader task and evicts dead
//! sessions.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use http::{header, Response, StatusCode};

use crate::{
    body::ResponseBody,
    config::EngineConfig,
    conn::Conn,
    errors::Error,
    handler::EngineHandler,
    packet::{MessageType, OpenPacket, Packet, PacketType},
    session::SessionManager,
    sid::Sid,
    socket::Socket,
    transport::{polling::PollingConn, polling::WireFormat, ConnInfo, TransportType},
};

pub struct EngineServer<H: EngineHandler> {
    pub config: EngineConfig,
    handler: H,
    sessions: SessionManager,
    sweeper_started: AtomicBool,
}

impl<H: EngineHandler> EngineServer<H> {
    pub fn new(handler: H, config: EngineConfig) -> Self {
        Self {
            config,
            handler,
            sessions: SessionManager::new(),
            sweeper_started: AtomicBool::new(false),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn get_socket(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.sessions.get(sid)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every live session. New requests are still served; call sites
    /// that want a full stop drop the service afterwards.
    pub fn close(&self) {
        for socket in self.sessions.collect(|_| true) {
            self.close_session(socket.sid);
        }
    }

    /// Create a session over a freshly accepted conn: register it, start its
    /// emitter/reader/heartbeat tasks, queue the Open handshake packet and
    /// hand it to the handler.
    pub(crate) fn create_session(
        self: &Arc<Self>,
        conn: Conn,
        transport: TransportType,
    ) -> Result<Arc<Socket>, Error> {
        let sid = Sid::new();
        let engine = self.clone();
        let close_fn = Box::new(move |sid: Sid| engine.close_session(sid));
        let socket = Socket::new(sid, conn, &self.config, close_fn);
        self.sessions.put(sid, socket.clone());

        socket.spawn_emitter();
        let open = OpenPacket::new(transport, sid, &self.config);
        socket.submit(Packet::open(&open)?)?;
        socket.spawn_heartbeat(self.config.ping_interval, self.config.ping_timeout);
        self.spawn_reader(socket.clone());
        self.start_sweeper();

        tracing::debug!("[sid={sid}] session created on {transport}");
        self.handler.on_open(socket.clone());
        Ok(socket)
    }

    /// The only way a session leaves the registry. Idempotent across racing
    /// callers: whoever removes the entry notifies the handler.
    pub(crate) fn close_session(&self, sid: Sid) {
        if let Some(socket) = self.sessions.remove(sid) {
            socket.close();
            self.handler.on_close(socket);
            tracing::debug!(
                "[sid={sid}] session closed, {} remaining",
                self.sessions.len()
            );
        }
    }

    fn spawn_reader(self: &Arc<Self>, socket: Arc<Socket>) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_socket(socket).await;
        });
    }

    /// Per-session reader: pulls packets off the current conn under the read
    /// deadline and dispatches them. A paused conn parks the loop until the
    /// conn slot changes; any other error or an elapsed deadline ends the
    /// session.
    async fn run_socket(self: Arc<Self>, socket: Arc<Socket>) {
        while !socket.is_closed() {
            let conn = socket.current_conn().await;
            match tokio::time::timeout(socket.read_timeout(), conn.read_packet()).await {
                Err(_) => {
                    tracing::debug!("[sid={}] read deadline elapsed", socket.sid);
                    self.close_session(socket.sid);
                    break;
                }
                Ok(Err(Error::ConnPaused)) => socket.wait_conn_change().await,
                Ok(Err(e)) => {
                    if !e.is_closed() {
                        tracing::debug!("[sid={}] read error: {:?}", socket.sid, e);
                    }
                    self.close_session(socket.sid);
                    break;
                }
                Ok(Ok(packet)) => self.dispatch(&socket, packet).await,
            }
        }
    }

    async fn dispatch(&self, socket: &Arc<Socket>, packet: Packet) {
        socket.mark_alive();
        match packet.packet_type {
            // v3 clients may drive the heartbeat themselves, answer in kind
            PacketType::Ping => {
                socket.note_pong();
                socket.submit(Packet::pong_of(&packet)).ok();
            }
            PacketType::Pong => socket.note_pong(),
            PacketType::Message => match packet.msg_type {
                MessageType::Text => match String::from_utf8(packet.data.to_vec()) {
                    Ok(msg) => self.handler.on_message(msg, socket.clone()).await,
                    Err(e) => self
                        .handler
                        .on_error(socket.clone(), Error::Utf8(e.utf8_error())),
                },
                MessageType::Binary => self.handler.on_binary(packet.data, socket.clone()).await,
            },
            PacketType::Close => self.close_session(socket.sid),
            PacketType::Noop => {}
            PacketType::Open | PacketType::Upgrade => {
                self.handler
                    .on_error(socket.clone(), Error::BadPacket(packet));
            }
        }
    }

    /// Background probe closing sessions whose last heartbeat is older than
    /// `ping_interval + ping_timeout`.
    fn start_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::downgrade(self);
        let period = self.config.ping_interval + self.config.ping_timeout;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(engine) = engine.upgrade() else { break };
                let stale = engine
                    .sessions
                    .collect(|socket| socket.last_seen().elapsed() > period);
                for socket in stale {
                    tracing::debug!("[sid={}] heartbeat expired, evicting", socket.sid);
                    engine.close_session(socket.sid);
                }
            }
        });
    }

    /// First GET of a session: accept a polling conn, create the session and
    /// serve the handshake through the regular polling path so it comes back
    /// in the requested wire format.
    pub(crate) async fn open_polling_req<B>(
        self: &Arc<Self>,
        format: WireFormat,
        peer: ConnInfo,
    ) -> Result<Response<ResponseBody<B>>, Error> {
        let conn = Arc::new(PollingConn::new(self.config.polling_buffer, peer));
        self.create_session(Conn::Polling(conn.clone()), TransportType::Polling)?;
        let body = conn.handle_get(format).await?;
        http_response(StatusCode::OK, format.content_type(), body)
    }

    /// Follow-up GET: park on the session's outbound queue.
    pub(crate) async fn polling_get<B>(
        self: &Arc<Self>,
        sid: Sid,
        format: WireFormat,
    ) -> Result<Response<ResponseBody<B>>, Error> {
        let polling = self.polling_conn(sid).await?;
        match polling.handle_get(format).await {
            Ok(body) => http_response(StatusCode::OK, format.content_type(), body),
            // two concurrent polling requests are a protocol violation
            Err(Error::MultiplePollingRequests) => {
                self.close_session(sid);
                Err(Error::MultiplePollingRequests)
            }
            Err(e) => Err(e),
        }
    }

    /// POST: decode the body as a payload into the session's inbound queue.
    pub(crate) async fn polling_post<B>(
        self: &Arc<Self>,
        sid: Sid,
        content_type: Option<String>,
        body: Bytes,
    ) -> Result<Response<ResponseBody<B>>, Error> {
        if body.len() > self.config.max_payload {
            return Err(Error::PayloadTooLarge);
        }
        let polling = self.polling_conn(sid).await?;
        match polling.handle_post(content_type.as_deref(), body).await {
            Ok(()) => http_response(
                StatusCode::OK,
                "text/plain; charset=UTF-8",
                Bytes::from_static(b"ok"),
            ),
            Err(e) => {
                // a malformed payload poisons the conn, not just the request
                if matches!(
                    e,
                    Error::InvalidPacketLength
                        | Error::PayloadTruncated
                        | Error::InvalidPacketType
                        | Error::Utf8(_)
                        | Error::Base64(_)
                ) {
                    tracing::debug!("[sid={sid}] error parsing payload: {:?}", e);
                    self.close_session(sid);
                }
                Err(e)
            }
        }
    }

    async fn polling_conn(&self, sid: Sid) -> Result<Arc<PollingConn>, Error> {
        let socket = self.get_socket(sid).ok_or(Error::UnknownSession)?;
        match socket.current_conn().await {
            Conn::Polling(polling) => Ok(polling),
            Conn::Websocket(_) => Err(Error::TransportMismatch),
        }
    }
}

pub(crate) fn http_response<B>(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Result<Response<ResponseBody<B>>, Error> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len())
        .body(ResponseBody::custom_response(body))
        .map_err(Error::Http)
}
