//! End-to-end polling flows through the tower service: handshake, message
//! exchange in both directions, wire-format negotiation and session expiry.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, StatusCode};
use hyper::Body;
use serde_json::Value;
use tower::Service;

use siora_engine::{
    config::EngineConfig, errors::Error, EngineHandler, EngineService, Sid, Socket,
};

/// Echoes every message straight back to the session that sent it.
#[derive(Debug)]
struct EchoHandler;

#[siora_engine::async_trait]
impl EngineHandler for EchoHandler {
    fn on_open(&self, _socket: Arc<Socket>) {}

    fn on_close(&self, _socket: Arc<Socket>) {}

    async fn on_message(&self, msg: String, socket: Arc<Socket>) {
        socket.send(msg).ok();
    }

    async fn on_binary(&self, data: Bytes, socket: Arc<Socket>) {
        socket.send(data).ok();
    }
}

type Svc = EngineService<EchoHandler>;

async fn call(svc: &mut Svc, req: Request<Body>) -> (StatusCode, Bytes) {
    let res = svc.call(req).await.unwrap();
    let status = res.status();
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    (status, body)
}

async fn get(svc: &mut Svc, query: &str) -> (StatusCode, Bytes) {
    let req = Request::get(format!("http://io.test/engine.io/?EIO=3&{query}"))
        .body(Body::empty())
        .unwrap();
    call(svc, req).await
}

async fn post(svc: &mut Svc, query: &str, body: &'static str) -> (StatusCode, Bytes) {
    let req = Request::post(format!("http://io.test/engine.io/?EIO=3&{query}"))
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap();
    call(svc, req).await
}

/// Perform the polling handshake and return the fresh session id.
async fn handshake(svc: &mut Svc) -> Sid {
    let (status, body) = get(svc, "transport=polling&b64=1").await;
    assert_eq!(status, StatusCode::OK);
    let body = std::str::from_utf8(&body).unwrap();
    let (_len, frame) = body.split_once(':').unwrap();
    assert!(frame.starts_with('0'), "expected an open packet, got {frame}");
    let open: Value = serde_json::from_str(&frame[1..]).unwrap();
    assert_eq!(open["upgrades"], serde_json::json!(["websocket"]));
    assert!(open["pingInterval"].is_u64());
    assert!(open["pingTimeout"].is_u64());
    open["sid"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn handshake_returns_open_packet_with_fresh_sid() {
    let mut svc = EngineService::new(EchoHandler);
    let sid = handshake(&mut svc).await;
    assert!(svc.engine().get_socket(sid).is_some());
}

#[tokio::test]
async fn get_blocks_until_server_emits() {
    let mut svc = EngineService::new(EchoHandler);
    let sid = handshake(&mut svc).await;

    let parked = {
        let mut svc = svc.clone();
        let query = format!("transport=polling&sid={sid}&b64=1");
        tokio::spawn(async move { get(&mut svc, &query).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let socket = svc.engine().get_socket(sid).unwrap();
    socket.send("hello").unwrap();

    let (status, body) = parked.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"6:4hello");
}

#[tokio::test]
async fn post_feeds_the_session_reader() {
    let mut svc = EngineService::new(EchoHandler);
    let sid = handshake(&mut svc).await;

    let (status, body) = post(&mut svc, &format!("transport=polling&sid={sid}"), "6:4world").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"ok");

    // the echo handler sends the message back out
    let (status, body) = get(&mut svc, &format!("transport=polling&sid={sid}&b64=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"6:4world");
}

#[tokio::test]
async fn jsonp_handshake_is_wrapped_in_callback() {
    let mut svc = EngineService::new(EchoHandler);
    let (status, body) = get(&mut svc, "transport=polling&j=2").await;
    assert_eq!(status, StatusCode::OK);
    let body = std::str::from_utf8(&body).unwrap();
    assert!(body.starts_with("___eio[2](\""), "unexpected body: {body}");
    assert!(body.ends_with("\");"));
}

#[tokio::test]
async fn unknown_sid_is_rejected() {
    let mut svc = EngineService::new(EchoHandler);
    let (status, _) = get(&mut svc, "transport=polling&sid=AAAAAAAAAAAAAAHs&b64=1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let mut svc = EngineService::new(EchoHandler);
    let req = Request::get("http://io.test/engine.io/?EIO=2&transport=polling")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&mut svc, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn non_engine_paths_fall_through_to_404() {
    let mut svc = EngineService::new(EchoHandler);
    let req = Request::get("http://io.test/other")
        .body(Body::empty())
        .unwrap();
    let res = svc.call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn other_methods_are_rejected() {
    let mut svc = EngineService::new(EchoHandler);
    let req = Request::put("http://io.test/engine.io/?EIO=3&transport=polling&sid=AAAAAAAAAAAAAAHs")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&mut svc, req).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn bad_payload_closes_the_session() {
    let mut svc = EngineService::new(EchoHandler);
    let sid = handshake(&mut svc).await;
    let (status, _) = post(&mut svc, &format!("transport=polling&sid={sid}"), "not-a-payload").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(svc.engine().get_socket(sid).is_none());
}

#[tokio::test]
async fn heartbeat_timeout_evicts_the_session() {
    let config = EngineConfig::builder()
        .ping_interval(Duration::from_millis(40))
        .ping_timeout(Duration::from_millis(40))
        .build();
    let mut svc = EngineService::with_config(EchoHandler, config);
    let sid = handshake(&mut svc).await;
    assert!(svc.engine().get_socket(sid).is_some());

    // no pong ever arrives: the session must reach its terminal state
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(svc.engine().get_socket(sid).is_none());

    let (status, _) = get(&mut svc, &format!("transport=polling&sid={sid}&b64=1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn emit_after_close_fails() {
    let mut svc = EngineService::new(EchoHandler);
    let sid = handshake(&mut svc).await;
    let socket = svc.engine().get_socket(sid).unwrap();
    socket.close();
    assert!(svc.engine().get_socket(sid).is_none());
    assert!(matches!(socket.send("nope"), Err(Error::EmitterClosed)));
}
