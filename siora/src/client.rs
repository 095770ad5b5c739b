//! The bridge between the engine and the Socket.IO layer: decodes inbound
//! frames, attaches namespaces and routes packets per the protocol table.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use serde_json::Value;
use siora_engine::{EngineHandler, Sid, Socket as EioSocket};
use tower::BoxError;

use crate::{
    config::SocketIoConfig,
    errors::Error,
    ns::{AckResponse, Namespace},
    packet::{Packet, PacketData},
    parser::{Frame, Parser},
    socket::Socket,
};

pub(crate) type ConnectCallback = Box<dyn Fn(Arc<Socket>) -> Result<(), BoxError> + Send + Sync>;
pub(crate) type ErrorCallback = Box<dyn Fn(Arc<Socket>, BoxError) + Send + Sync>;

pub(crate) struct Client {
    config: Arc<SocketIoConfig>,
    parser: Parser,
    sockets: RwLock<HashMap<Sid, Arc<Socket>>>,
    on_connect: RwLock<Option<ConnectCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
}

impl Client {
    pub(crate) fn new(config: Arc<SocketIoConfig>) -> Self {
        Self {
            parser: Parser::new(config.parser),
            config,
            sockets: RwLock::new(HashMap::new()),
            on_connect: RwLock::new(None),
            on_error: RwLock::new(None),
        }
    }

    pub(crate) fn set_on_connect(&self, callback: ConnectCallback) {
        self.on_connect.write().unwrap().replace(callback);
    }

    pub(crate) fn set_on_error(&self, callback: ErrorCallback) {
        self.on_error.write().unwrap().replace(callback);
    }

    pub(crate) fn get_socket(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.sockets.read().unwrap().get(&sid).cloned()
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.sockets.read().unwrap().len()
    }

    fn emit_error(&self, socket: &Arc<Socket>, err: impl Into<BoxError>) {
        let err = err.into();
        if let Some(callback) = self.on_error.read().unwrap().as_ref() {
            callback(socket.clone(), err);
        } else {
            tracing::debug!("[sid={}] unhandled error: {err}", socket.sid);
        }
    }

    /// Routing table for a decoded packet.
    async fn process(&self, socket: &Arc<Socket>, packet: Packet) {
        match packet.inner {
            PacketData::Connect(_auth) => {
                // attaching is idempotent, but only namespaces the
                // application registered are attachable
                let reply = if socket.try_nsp(&packet.ns).is_some() {
                    Packet::connect(packet.ns)
                } else {
                    Packet::error(packet.ns, "Invalid namespace")
                };
                if let Err(e) = socket.send_packet(reply) {
                    self.emit_error(socket, e);
                }
            }
            PacketData::Disconnect => socket.detach(&packet.ns),
            PacketData::Event(event, data, id) => {
                self.fire(socket, &packet.ns, &event, data, vec![], id).await;
            }
            PacketData::BinaryEvent(event, bin, id) => {
                self.fire(socket, &packet.ns, &event, bin.data, bin.bin, id)
                    .await;
            }
            PacketData::EventAck(data, id) => self.fire_ack(
                socket,
                &packet.ns,
                id,
                AckResponse {
                    data,
                    binary: vec![],
                },
            ),
            PacketData::BinaryAck(bin, id) => self.fire_ack(
                socket,
                &packet.ns,
                id,
                AckResponse {
                    data: bin.data,
                    binary: bin.bin,
                },
            ),
            PacketData::Error(data) => self.emit_error(socket, Error::Peer(data)),
        }
    }

    /// Resolve the namespace a packet addresses, answering with an error
    /// packet when it was never registered.
    fn addressed_nsp(&self, socket: &Arc<Socket>, ns: &str) -> Option<Arc<Namespace>> {
        let nsp = socket.try_nsp(ns);
        if nsp.is_none() {
            tracing::debug!("[sid={}] packet for unknown namespace {ns}", socket.sid);
            if let Err(e) = socket.send_packet(Packet::error(ns, "Invalid namespace")) {
                self.emit_error(socket, e);
            }
        }
        nsp
    }

    fn fire_ack(&self, socket: &Arc<Socket>, ns: &str, id: i64, response: AckResponse) {
        if let Some(nsp) = self.addressed_nsp(socket, ns) {
            nsp.fire_ack(id, response);
        }
    }

    async fn fire(
        &self,
        socket: &Arc<Socket>,
        ns: &str,
        event: &str,
        data: Value,
        bin: Vec<Vec<u8>>,
        id: Option<i64>,
    ) {
        let Some(nsp) = self.addressed_nsp(socket, ns) else {
            return;
        };
        if !nsp.has_handler(event) {
            tracing::debug!("[sid={}] no handler for {event:?} on {ns}", socket.sid);
            return;
        }
        match nsp.fire_event(socket.clone(), event, data, bin).await {
            Ok(values) => {
                if let Some(id) = id {
                    let ack = Packet::ack(nsp.path.clone(), values.unwrap_or(Value::Null), id);
                    if let Err(e) = socket.send_packet(ack) {
                        self.emit_error(socket, e);
                    }
                }
            }
            // a failing handler surfaces to on_error and suppresses the ack
            Err(e) => self.emit_error(socket, e),
        }
    }

    async fn decode(&self, esocket: &Arc<EioSocket>, frame: Frame) {
        let Some(socket) = self.get_socket(esocket.sid) else {
            tracing::debug!("[sid={}] frame for unknown socket", esocket.sid);
            return;
        };
        let decoded = socket.decoder.lock().unwrap().add(frame);
        match decoded {
            // codec errors surface to the application, the conn stays up
            Err(e) => self.emit_error(&socket, e),
            Ok(Some(packet)) => self.process(&socket, packet).await,
            Ok(None) => {}
        }
    }
}

#[siora_engine::async_trait]
impl EngineHandler for Client {
    fn on_open(&self, esocket: Arc<EioSocket>) {
        let socket = Arc::new(Socket::new(
            esocket.clone(),
            self.parser,
            self.config.clone(),
        ));
        self.sockets
            .write()
            .unwrap()
            .insert(esocket.sid, socket.clone());
        tracing::debug!("[sid={}] socket.io connection", socket.sid);

        if let Some(callback) = self.on_connect.read().unwrap().as_ref() {
            if let Err(e) = callback(socket.clone()) {
                self.emit_error(&socket, e);
            }
        }
        // the default namespace is attached as soon as the session opens
        socket.of("/");
        if let Err(e) = socket.send_packet(Packet::connect("/")) {
            self.emit_error(&socket, e);
        }
    }

    fn on_close(&self, esocket: Arc<EioSocket>) {
        if let Some(socket) = self.sockets.write().unwrap().remove(&esocket.sid) {
            tracing::debug!("[sid={}] socket.io disconnection", socket.sid);
            socket.detach_all();
        }
    }

    fn on_error(&self, esocket: Arc<EioSocket>, err: siora_engine::errors::Error) {
        if let Some(socket) = self.get_socket(esocket.sid) {
            self.emit_error(&socket, Error::Engine(err));
        }
    }

    async fn on_message(&self, msg: String, esocket: Arc<EioSocket>) {
        self.decode(&esocket, Frame::Text(msg)).await;
    }

    async fn on_binary(&self, data: Bytes, esocket: Arc<EioSocket>) {
        self.decode(&esocket, Frame::Binary(data.to_vec())).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use siora_engine::transport::polling::{PollingConn, WireFormat};

    use super::*;

    fn client() -> Arc<Client> {
        Arc::new(Client::new(Arc::new(SocketIoConfig::default())))
    }

    fn dummy_session() -> (Arc<EioSocket>, Arc<PollingConn>) {
        EioSocket::new_dummy(Box::new(|_| {}))
    }

    async fn drain(conn: &PollingConn) -> Vec<u8> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.handle_get(WireFormat::Xhr).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn open_attaches_default_namespace_and_replies_connect() {
        let client = client();
        let (esocket, conn) = dummy_session();
        client.on_open(esocket.clone());
        assert!(client.get_socket(esocket.sid).is_some());
        assert_eq!(drain(&conn).await, b"2:40");
    }

    #[tokio::test]
    async fn event_with_ack_id_is_answered_with_handler_return_values() {
        let client = client();
        client.set_on_connect(Box::new(|socket| {
            socket.on("/", "add", |_socket, data, _bin| async move {
                let args: Vec<i64> = serde_json::from_value(data)?;
                Ok(Some(json!([args[0] + args[1]])))
            });
            Ok(())
        }));
        let (esocket, conn) = dummy_session();
        client.on_open(esocket.clone());
        drain(&conn).await; // connect reply

        client
            .on_message("21[\"add\",1,2]".to_string(), esocket.clone())
            .await;
        assert_eq!(drain(&conn).await, b"6:431[3]");
    }

    #[tokio::test]
    async fn handler_error_suppresses_the_ack() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let client = client();
        client.set_on_connect(Box::new(|socket| {
            socket.on("/", "boom", |_socket, _data, _bin| async move {
                Err("handler exploded".into())
            });
            Ok(())
        }));
        let seen = errors.clone();
        client.set_on_error(Box::new(move |_socket, err| {
            seen.lock().unwrap().push(err.to_string());
        }));
        let (esocket, conn) = dummy_session();
        client.on_open(esocket.clone());
        drain(&conn).await;

        client
            .on_message("25[\"boom\"]".to_string(), esocket.clone())
            .await;
        assert_eq!(errors.lock().unwrap().as_slice(), ["handler exploded"]);
        // no ack frame was produced, only the packets already drained
        esocket.send("sentinel").unwrap();
        assert_eq!(drain(&conn).await, b"9:4sentinel");
    }

    #[tokio::test]
    async fn binary_event_dispatches_with_attached_buffers() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let client = client();
        let sink = received.clone();
        client.set_on_connect(Box::new(move |socket| {
            let sink = sink.clone();
            socket.on("/", "img", move |_socket, _data, bin| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().extend(bin);
                    Ok(None)
                }
            });
            Ok(())
        }));
        let (esocket, _conn) = dummy_session();
        client.on_open(esocket.clone());

        client
            .on_message(
                "51-[\"img\",{\"_placeholder\":true,\"num\":0}]".to_string(),
                esocket.clone(),
            )
            .await;
        // not yielded until the attachment arrives
        assert!(received.lock().unwrap().is_empty());
        client
            .on_binary(Bytes::from_static(&[0xDE, 0xAD]), esocket.clone())
            .await;
        assert_eq!(received.lock().unwrap().as_slice(), [vec![0xDE, 0xAD]]);
    }

    #[tokio::test]
    async fn ack_round_trip_resolves_emit_with_ack() {
        let client = client();
        let (esocket, conn) = dummy_session();
        client.on_open(esocket.clone());
        let socket = client.get_socket(esocket.sid).unwrap();

        let pending = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.emit_with_ack("/", "question", json!(["ready?"])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // first ack id on a namespace is 1
        client
            .on_message("31[\"yes\"]".to_string(), esocket.clone())
            .await;
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.data, json!(["yes"]));
        // the emitted event carried the ack id
        let body = drain(&conn).await;
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("421[\"question\",\"ready?\"]"), "body: {body}");
    }

    #[tokio::test]
    async fn connect_to_registered_namespace_is_acknowledged() {
        let client = client();
        client.set_on_connect(Box::new(|socket| {
            socket.on("/chat", "msg", |_socket, _data, _bin| async move { Ok(None) });
            Ok(())
        }));
        let (esocket, conn) = dummy_session();
        client.on_open(esocket.clone());
        drain(&conn).await; // connect reply for "/"

        client.on_message("0/chat,".to_string(), esocket.clone()).await;
        assert_eq!(drain(&conn).await, b"8:40/chat,");
    }

    #[tokio::test]
    async fn connect_to_unknown_namespace_yields_error_packet() {
        let client = client();
        let (esocket, conn) = dummy_session();
        client.on_open(esocket.clone());
        drain(&conn).await; // connect reply for "/"

        client.on_message("0/nope,".to_string(), esocket.clone()).await;
        let body = String::from_utf8(drain(&conn).await).unwrap();
        assert!(
            body.contains("44/nope,{\"message\":\"Invalid namespace\"}"),
            "no error packet in: {body}"
        );
        assert!(client.get_socket(esocket.sid).is_some());
    }

    #[tokio::test]
    async fn event_on_unknown_namespace_yields_error_packet() {
        let client = client();
        let (esocket, conn) = dummy_session();
        client.on_open(esocket.clone());
        drain(&conn).await;

        client
            .on_message("2/nope,[\"hello\"]".to_string(), esocket.clone())
            .await;
        let body = String::from_utf8(drain(&conn).await).unwrap();
        assert!(
            body.contains("44/nope,{\"message\":\"Invalid namespace\"}"),
            "no error packet in: {body}"
        );
    }

    #[tokio::test]
    async fn disconnect_packet_detaches_the_namespace() {
        let client = client();
        client.set_on_connect(Box::new(|socket| {
            socket.on("/chat", "msg", |_socket, _data, _bin| async move { Ok(None) });
            Ok(())
        }));
        let (esocket, _conn) = dummy_session();
        client.on_open(esocket.clone());
        let socket = client.get_socket(esocket.sid).unwrap();
        assert!(socket.try_nsp("/chat").is_some());

        client
            .on_message("1/chat,".to_string(), esocket.clone())
            .await;
        assert!(socket.try_nsp("/chat").is_none());
    }

    #[tokio::test]
    async fn engine_close_detaches_everything() {
        let client = client();
        let (esocket, _conn) = dummy_session();
        client.on_open(esocket.clone());
        let socket = client.get_socket(esocket.sid).unwrap();
        let pending = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.emit_with_ack("/", "q", json!([])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.on_close(esocket.clone());
        assert!(client.get_socket(esocket.sid).is_none());
        // the pending ack resolves with a receive error, not a hang
        assert!(matches!(
            pending.await.unwrap(),
            Err(crate::errors::AckError::Recv(_))
        ));
    }

    #[tokio::test]
    async fn codec_errors_surface_without_closing() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let client = client();
        let seen = errors.clone();
        client.set_on_error(Box::new(move |_socket, err| {
            seen.lock().unwrap().push(err.to_string());
        }));
        let (esocket, _conn) = dummy_session();
        client.on_open(esocket.clone());

        client
            .on_message("9garbage".to_string(), esocket.clone())
            .await;
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(client.get_socket(esocket.sid).is_some());
    }
}
