//! A [`Socket`] is the server-side identity of a session: it owns the
//! current conn (replaceable under a write lock during an upgrade), an
//! asynchronous outbound emitter and the heartbeat job.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use bytes::Bytes;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch, Mutex, Notify, RwLock},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::EngineConfig,
    conn::Conn,
    errors::Error,
    packet::{Packet, PacketType},
    sid::Sid,
    transport::TransportType,
};

/// The typed events a session knows how to emit, mapped onto packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Error,
}

impl Event {
    fn packet_type(self) -> Option<PacketType> {
        match self {
            Event::Open => Some(PacketType::Open),
            Event::Close => Some(PacketType::Close),
            Event::Ping => Some(PacketType::Ping),
            Event::Pong => Some(PacketType::Pong),
            Event::Message => Some(PacketType::Message),
            // upgrade and error are inbound-only events
            Event::Upgrade | Event::Error => None,
        }
    }
}

/// Payload accepted by [`Socket::emit`]: opaque bytes go out as binary
/// frames, text as UTF-8, anything else JSON-encoded.
pub enum EmitData {
    Text(String),
    Binary(Bytes),
    Json(Value),
}

impl From<String> for EmitData {
    fn from(s: String) -> Self {
        EmitData::Text(s)
    }
}
impl From<&str> for EmitData {
    fn from(s: &str) -> Self {
        EmitData::Text(s.to_string())
    }
}
impl From<Vec<u8>> for EmitData {
    fn from(data: Vec<u8>) -> Self {
        EmitData::Binary(data.into())
    }
}
impl From<Bytes> for EmitData {
    fn from(data: Bytes) -> Self {
        EmitData::Binary(data)
    }
}
impl From<Value> for EmitData {
    fn from(value: Value) -> Self {
        EmitData::Json(value)
    }
}

pub struct Socket {
    /// The session id.
    pub sid: Sid,

    /// Current conn; swapped atomically w.r.t. readers during an upgrade.
    conn: RwLock<Conn>,

    /// Submission queue drained by the emitter task.
    tx: mpsc::Sender<Packet>,
    emitter_rx: StdMutex<Option<mpsc::Receiver<Packet>>>,

    /// Pong notifications from the handle loop to the heartbeat job.
    pong_tx: mpsc::Sender<()>,
    pong_rx: Mutex<mpsc::Receiver<()>>,

    /// Signaled whenever the conn slot changes (swap or failed-upgrade
    /// resume), unparking a reader idled by a paused conn.
    conn_changed: Notify,

    closed: watch::Sender<bool>,
    once: AtomicBool,
    close_fn: Box<dyn Fn(Sid) + Send + Sync>,

    heartbeat_handle: StdMutex<Option<JoinHandle<()>>>,
    last_seen: StdMutex<Instant>,

    read_timeout: Duration,
    write_timeout: Duration,
    upgrade_timeout: Duration,
}

impl Socket {
    pub(crate) fn new(
        sid: Sid,
        conn: Conn,
        config: &EngineConfig,
        close_fn: Box<dyn Fn(Sid) + Send + Sync>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_buffer_size);
        let (pong_tx, pong_rx) = mpsc::channel(1);
        Arc::new(Self {
            sid,
            conn: RwLock::new(conn),
            tx,
            emitter_rx: StdMutex::new(Some(rx)),
            pong_tx,
            pong_rx: Mutex::new(pong_rx),
            conn_changed: Notify::new(),
            closed: watch::channel(false).0,
            once: AtomicBool::new(false),
            close_fn,
            heartbeat_handle: StdMutex::new(None),
            last_seen: StdMutex::new(Instant::now()),
            read_timeout: config.ping_interval + config.ping_timeout,
            write_timeout: config.ping_timeout,
            upgrade_timeout: config.upgrade_timeout,
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub(crate) async fn current_conn(&self) -> Conn {
        self.conn.read().await.clone()
    }

    /// The transport the session currently rides on.
    pub async fn transport(&self) -> TransportType {
        self.conn.read().await.transport()
    }

    /// Emits a typed event to the client, serializing the payload by shape.
    ///
    /// The packet is queued on the emitter; `ErrInvalidEvent` is returned
    /// for events that have no outbound packet form, [`Error::BufferFull`]
    /// when the submission queue is saturated and [`Error::EmitterClosed`]
    /// once the session closed.
    pub fn emit(&self, event: Event, data: impl Into<EmitData>) -> Result<(), Error> {
        let packet_type = event.packet_type().ok_or(Error::InvalidEvent)?;
        let packet = match data.into() {
            EmitData::Text(s) => Packet::text(packet_type, s),
            EmitData::Binary(b) => Packet::binary(packet_type, b),
            EmitData::Json(v) => Packet::text(packet_type, serde_json::to_string(&v)?),
        };
        self.submit(packet)
    }

    /// Emits a message packet, the common case of [`Socket::emit`].
    pub fn send(&self, data: impl Into<EmitData>) -> Result<(), Error> {
        self.emit(Event::Message, data)
    }

    pub(crate) fn submit(&self, packet: Packet) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::EmitterClosed);
        }
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::BufferFull,
            mpsc::error::TrySendError::Closed(_) => Error::EmitterClosed,
        })
    }

    /// Closes the session. Idempotent: the emitter is shut down and the
    /// current conn closed exactly once, no matter how many callers race.
    pub fn close(&self) {
        if self.once.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("[sid={}] closing session", self.sid);
        self.tx.try_send(Packet::close()).ok();
        self.closed.send_replace(true);
        self.conn_changed.notify_waiters();
        self.abort_heartbeat();
        (self.close_fn)(self.sid);
    }

    pub(crate) fn mark_alive(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub(crate) fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap()
    }

    pub(crate) fn note_pong(&self) {
        self.mark_alive();
        self.pong_tx.try_send(()).ok();
    }

    /// Park until the conn slot changes or the session closes. Returns
    /// immediately when the current conn is no longer paused (the swap or
    /// the failed-upgrade resume already happened).
    pub(crate) async fn wait_conn_change(&self) {
        let mut closed = self.closed.subscribe();
        let mut notified = std::pin::pin!(self.conn_changed.notified());
        notified.as_mut().enable();
        if self.is_closed() || !self.current_conn().await.is_paused() {
            return;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = closed.changed() => {}
        }
    }

    /// Single-writer loop draining the submission queue through the current
    /// conn. On transport swap subsequent writes target the new conn; on
    /// teardown the remaining queue is flushed and the conn closed.
    pub(crate) fn spawn_emitter(self: &Arc<Self>) {
        let Some(mut rx) = self.emitter_rx.lock().unwrap().take() else {
            return;
        };
        let socket = self.clone();
        tokio::spawn(async move {
            let mut closed = socket.closed.subscribe();
            loop {
                if socket.is_closed() {
                    break;
                }
                let packet = tokio::select! {
                    packet = rx.recv() => match packet {
                        Some(packet) => packet,
                        None => break,
                    },
                    _ = closed.changed() => break,
                };
                if socket.write_through(packet).await.is_err() {
                    break;
                }
            }
            // flush what was queued before the close latch fired
            while let Ok(packet) = rx.try_recv() {
                if socket.write_through(packet).await.is_err() {
                    break;
                }
            }
            socket.current_conn().await.close().await;
            tracing::debug!("[sid={}] emitter closed", socket.sid);
        });
    }

    async fn write_through(&self, packet: Packet) -> Result<(), Error> {
        loop {
            let conn = self.current_conn().await;
            // hold off while an upgrade has the conn gated; the packet goes
            // out on whichever conn wins the handshake
            if conn.is_paused() {
                self.wait_conn_change().await;
                if self.is_closed() {
                    return Err(Error::EmitterClosed);
                }
                continue;
            }
            return match tokio::time::timeout(self.write_timeout, conn.write_packet(packet)).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    if !e.is_closed() {
                        tracing::debug!("[sid={}] write error: {:?}", self.sid, e);
                    }
                    self.close();
                    Err(e)
                }
                Err(_) => {
                    tracing::debug!("[sid={}] write deadline elapsed", self.sid);
                    self.close();
                    Err(Error::ConnClosed)
                }
            };
        }
    }

    /// Heartbeat: send a Ping every `interval`, expect a Pong within
    /// `timeout`, close the session otherwise.
    pub(crate) fn spawn_heartbeat(self: &Arc<Self>, interval: Duration, timeout: Duration) {
        let socket = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = socket.heartbeat_job(interval, timeout).await {
                tracing::debug!("[sid={}] heartbeat error: {:?}", socket.sid, e);
                socket.close();
            }
        });
        self.heartbeat_handle
            .lock()
            .unwrap()
            .replace(handle);
    }

    async fn heartbeat_job(&self, interval: Duration, timeout: Duration) -> Result<(), Error> {
        let mut pong_rx = self
            .pong_rx
            .try_lock()
            .expect("pong receiver should be locked only once");
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tick.tick().await;
            // some clients pong ahead of the ping, consume stale responses
            pong_rx.try_recv().ok();
            self.submit(Packet::ping())
                .map_err(|_| Error::HeartbeatTimeout)?;
            tokio::time::timeout(timeout, pong_rx.recv())
                .await
                .map_err(|_| Error::HeartbeatTimeout)?
                .ok_or(Error::HeartbeatTimeout)?;
            self.mark_alive();
        }
    }

    pub(crate) fn abort_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Validate an upgrade candidate and swap the session onto it.
    ///
    /// The candidate must open with a probe Ping (echoed back as a Pong) and
    /// commit with an Upgrade packet once the old conn is paused. Every
    /// failure path closes only the candidate and leaves the session on its
    /// old conn; the old conn is never closed here, its teardown belongs to
    /// the emitter.
    pub(crate) async fn upgrade(&self, new_conn: Conn) -> Result<(), Error> {
        let probe = match tokio::time::timeout(self.upgrade_timeout, new_conn.read_packet()).await {
            Ok(Ok(packet)) => packet,
            _ => {
                new_conn.close().await;
                return Err(Error::UpgradeFailed);
            }
        };
        if probe.packet_type != PacketType::Ping {
            tracing::debug!(
                "[sid={}] upgrade aborted, expected ping got {:?}",
                self.sid,
                probe.packet_type
            );
            new_conn.close().await;
            return Err(Error::UpgradeFailed);
        }

        let pong = Packet::pong_of(&probe);
        match tokio::time::timeout(self.write_timeout, new_conn.write_packet(pong)).await {
            Ok(Ok(())) => {}
            _ => {
                new_conn.close().await;
                return Err(Error::UpgradeFailed);
            }
        }

        // gate the old conn; buffered packets drain to the peer before the
        // new conn accepts writes
        let old_conn = self.current_conn().await;
        match tokio::time::timeout(self.upgrade_timeout, old_conn.pause()).await {
            Ok(Ok(())) => {}
            _ => {
                new_conn.close().await;
                return Err(Error::UpgradeFailed);
            }
        }

        match tokio::time::timeout(self.upgrade_timeout, new_conn.read_packet()).await {
            Ok(Ok(packet)) if packet.packet_type == PacketType::Upgrade => {}
            _ => {
                new_conn.close().await;
                old_conn.resume();
                self.conn_changed.notify_waiters();
                return Err(Error::UpgradeFailed);
            }
        }

        *self.conn.write().await = new_conn;
        self.conn_changed.notify_waiters();
        tracing::debug!("[sid={}] transport upgraded", self.sid);
        Ok(())
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.sid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Socket {
    /// Test-support constructor: a socket riding a polling conn that the
    /// caller can drive directly, emitter already running.
    #[doc(hidden)]
    pub fn new_dummy(
        close_fn: Box<dyn Fn(Sid) + Send + Sync>,
    ) -> (Arc<Socket>, Arc<crate::transport::polling::PollingConn>) {
        let conn = Arc::new(crate::transport::polling::PollingConn::new(
            64,
            crate::transport::ConnInfo::default(),
        ));
        let socket = Socket::new(
            Sid::new(),
            Conn::Polling(conn.clone()),
            &EngineConfig::default(),
            close_fn,
        );
        socket.spawn_emitter();
        (socket, conn)
    }
}
