//! Full-stack flows over HTTP polling: handshake, namespace connect,
//! event dispatch with acknowledgement.

use std::time::Duration;

use http::{Request, StatusCode};
use hyper::Body;
use serde_json::json;
use tower::Service;

use siora::{Server, SocketIoService};

async fn get(svc: &mut SocketIoService, query: &str) -> (StatusCode, String) {
    let req = Request::get(format!("http://io.test/engine.io/?EIO=3&{query}"))
        .body(Body::empty())
        .unwrap();
    let res = svc.call(req).await.unwrap();
    let status = res.status();
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn post(svc: &mut SocketIoService, query: &str, body: String) -> StatusCode {
    let req = Request::post(format!("http://io.test/engine.io/?EIO=3&{query}"))
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap();
    let res = svc.call(req).await.unwrap();
    res.status()
}

/// Handshake and wait for the namespace connect frame, returning the sid.
async fn connect(svc: &mut SocketIoService) -> String {
    let (status, body) = get(svc, "transport=polling&b64=1").await;
    assert_eq!(status, StatusCode::OK);
    let (len, rest) = body.split_once(':').unwrap();
    let len: usize = len.parse().unwrap();
    let frame = &rest[..len];
    assert!(frame.starts_with('0'), "expected an open packet, got {frame}");
    let open: serde_json::Value = serde_json::from_str(&frame[1..]).unwrap();
    let sid = open["sid"].as_str().unwrap().to_string();

    // the socket.io connect reply for "/" arrives with the handshake or on
    // the next poll
    if !rest[len..].contains("2:40") {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, body) = get(svc, &format!("transport=polling&sid={sid}&b64=1")).await;
        assert!(body.contains("2:40"), "no connect reply in: {body}");
    }
    sid
}

#[tokio::test]
async fn handshake_connects_default_namespace() {
    let (server, mut svc) = Server::new();
    let sid = connect(&mut svc).await;
    assert_eq!(server.socket_count(), 1);
    assert!(server.get_socket(sid.parse().unwrap()).is_some());
}

#[tokio::test]
async fn event_with_ack_round_trip() {
    let (server, mut svc) = Server::new();
    server.on_connect(|socket| {
        socket.on("/", "add", |_socket, data, _bin| async move {
            let args: Vec<i64> = serde_json::from_value(data)?;
            Ok(Some(json!([args.iter().sum::<i64>()])))
        });
        Ok(())
    });

    let sid = connect(&mut svc).await;
    let status = post(
        &mut svc,
        &format!("transport=polling&sid={sid}"),
        "14:421[\"add\",1,2]".to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (status, body) = get(&mut svc, &format!("transport=polling&sid={sid}&b64=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("6:431[3]"), "no ack in: {body}");
}

#[tokio::test]
async fn server_emits_to_the_client() {
    let (server, mut svc) = Server::new();
    let sid = connect(&mut svc).await;
    let socket = server.get_socket(sid.parse().unwrap()).unwrap();
    socket.emit("/", "news", json!(["it works"])).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_, body) = get(&mut svc, &format!("transport=polling&sid={sid}&b64=1")).await;
    assert!(
        body.contains("42[\"news\",\"it works\"]"),
        "no event in: {body}"
    );
}

#[tokio::test]
async fn transport_close_tears_down_the_socket() {
    let (server, mut svc) = Server::new();
    let sid = connect(&mut svc).await;
    assert_eq!(server.socket_count(), 1);

    // engine-level close packet from the client
    let status = post(
        &mut svc,
        &format!("transport=polling&sid={sid}"),
        "1:1".to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.socket_count(), 0);
}
