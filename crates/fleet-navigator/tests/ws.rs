//! End-to-end tests: a Mate over a real WebSocket, the operator over the admin API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use fleet_crypto::cipher;
use fleet_crypto::keys::{to_spki, KeyKind};
use fleet_crypto::Identity;
use fleet_navigator::{BusinessHandler, NavigatorConfig, NavigatorServer};
use fleet_proto::BusinessMessage;

const TOKEN: &str = "test-admin-token-0123";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Echo;

#[async_trait]
impl BusinessHandler for Echo {
    async fn handle(&self, _device_id: &str, message: BusinessMessage) -> Option<Value> {
        Some(json!({"type": format!("{}_ack", message.kind), "payload": message.data}))
    }
}

struct Harness {
    _dir: TempDir,
    server: Arc<NavigatorServer>,
    addr: SocketAddr,
}

async fn start() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = NavigatorConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        data_dir: dir.path().to_path_buf(),
        database_path: Some(dir.path().join("devices.db")),
        admin_token: Some(TOKEN.to_string()),
        shutdown_timeout_secs: 1,
        ..Default::default()
    };
    let server = Arc::new(NavigatorServer::with_handler(config, Arc::new(Echo)).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });

    Harness {
        _dir: dir,
        server,
        addr,
    }
}

async fn connect(addr: SocketAddr, path: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next non-control message, or panic after a few seconds.
async fn next_message(socket: &mut Socket) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn recv(socket: &mut Socket) -> Value {
    match next_message(socket).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn expect_close(socket: &mut Socket) -> u16 {
    match next_message(socket).await {
        Message::Close(Some(frame)) => u16::from(frame.code),
        other => panic!("expected close frame, got {other:?}"),
    }
}

async fn admin(h: &Harness, method: &str, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    let response = h
        .server
        .router()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_pair_authenticate_and_exchange() {
    let h = start().await;
    let mate = Identity::generate();
    let mut socket = connect(h.addr, "/api/fleet-mate/ws/build-box").await;

    send(
        &mut socket,
        json!({
            "type": "pairing_request",
            "mateId": "build-box",
            "data": {
                "name": "Build Box",
                "type": "os",
                "publicKey": STANDARD.encode(to_spki(KeyKind::Ed25519, &mate.sign_pub())),
                "exchangeKey": STANDARD.encode(to_spki(KeyKind::X25519, &mate.kex_pub())),
            }
        }),
    )
    .await;

    let response = recv(&mut socket).await;
    assert_eq!(response["type"], "pairing_response");
    assert_eq!(response["payload"]["status"], "PENDING");
    let request_id = response["payload"]["requestId"].as_str().unwrap().to_string();
    let code = response["payload"]["pairingCode"].as_str().unwrap().to_string();

    // Operator sees the same code and approves
    let (status, pending) = admin(&h, "GET", "/api/pairing/pending", Some(TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending[0]["requestId"], request_id.as_str());
    assert_eq!(pending[0]["pairingCode"], code.as_str());
    assert_eq!(pending[0]["ipv4"], "127.0.0.1");

    let (status, device) = admin(
        &h,
        "POST",
        &format!("/api/pairing/approve/{request_id}"),
        Some(TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(device["deviceId"], "os-build-box");
    assert!(device.get("sharedSecret").is_none());

    let approved = recv(&mut socket).await;
    assert_eq!(approved["type"], "pairing_approved");
    assert_eq!(approved["payload"]["status"], "APPROVED");
    let device_id = approved["payload"]["deviceId"].as_str().unwrap().to_string();
    let secret = mate
        .derive_shared_secret_b64(approved["payload"]["navigatorExchangeKey"].as_str().unwrap())
        .unwrap();

    // Challenge-response
    send(&mut socket, json!({"type": "auth_challenge_request", "deviceId": device_id})).await;
    let challenge = recv(&mut socket).await;
    assert_eq!(challenge["type"], "auth_challenge");
    let nonce = challenge["payload"]["nonce"].as_str().unwrap();
    let signature = STANDARD.encode(mate.sign(format!("{device_id}:{nonce}").as_bytes()));

    send(
        &mut socket,
        json!({
            "type": "auth",
            "deviceId": device_id,
            "publicKey": mate.sign_pub_b64(),
            "signature": signature,
            "nonce": nonce,
        }),
    )
    .await;
    let success = recv(&mut socket).await;
    assert_eq!(
        success,
        json!({"type": "auth_success", "payload": {"deviceId": device_id, "deviceName": "Build Box"}})
    );

    // Encrypted business traffic both ways
    let inner = json!({"type": "stats", "data": {"cpu": 42}}).to_string();
    send(
        &mut socket,
        json!({
            "type": "encrypted",
            "deviceId": device_id,
            "payload": cipher::seal_base64(&secret, inner.as_bytes()).unwrap(),
        }),
    )
    .await;

    let reply = recv(&mut socket).await;
    assert_eq!(reply["type"], "encrypted");
    let plaintext = cipher::open_base64(&secret, reply["payload"]["payload"].as_str().unwrap()).unwrap();
    let decoded: Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(decoded, json!({"type": "stats_ack", "payload": {"cpu": 42}}));

    let (_, summary) = admin(&h, "GET", "/api/pairing/summary", Some(TOKEN)).await;
    assert_eq!(summary["trusted"], 1);
    assert_eq!(summary["activeSessions"], 1);
    assert_eq!(summary["connected"], 1);

    // Revocation closes the socket
    let (status, _) = admin(
        &h,
        "DELETE",
        &format!("/api/pairing/trusted/{device_id}"),
        Some(TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(expect_close(&mut socket).await, 1008);

    let (_, trusted) = admin(&h, "GET", "/api/pairing/trusted", Some(TOKEN)).await;
    assert_eq!(trusted, json!([]));

    h.server.shutdown();
}

#[tokio::test]
async fn test_unauthenticated_encrypted_frame() {
    let h = start().await;
    let mut socket = connect(h.addr, "/ws").await;

    send(
        &mut socket,
        json!({
            "type": "encrypted",
            "deviceId": "os-build-box",
            "payload": STANDARD.encode([7u8; 48]),
        }),
    )
    .await;
    assert_eq!(
        recv(&mut socket).await,
        json!({"type": "error", "payload": {"message": "Not authenticated"}})
    );

    // Still open
    send(&mut socket, json!({"type": "auth_challenge_request", "deviceId": "os-build-box"})).await;
    assert_eq!(recv(&mut socket).await["type"], "auth_challenge");

    h.server.shutdown();
}

#[tokio::test]
async fn test_legacy_register_is_closed() {
    let h = start().await;
    let mut socket = connect(h.addr, "/ws").await;

    send(&mut socket, json!({"type": "register", "mateId": "old-mate"})).await;

    let error = recv(&mut socket).await;
    assert_eq!(
        error["payload"]["message"],
        "Legacy registration is disabled, pairing required"
    );
    assert_eq!(expect_close(&mut socket).await, 1008);

    h.server.shutdown();
}

#[tokio::test]
async fn test_rejection_reaches_mate() {
    let h = start().await;
    let mate = Identity::generate();
    let mut socket = connect(h.addr, "/ws").await;

    send(
        &mut socket,
        json!({
            "type": "pairing_request",
            "name": "Spare",
            "deviceType": "os",
            "publicKey": mate.sign_pub_b64(),
            "exchangeKey": mate.kex_pub_b64(),
        }),
    )
    .await;
    let request_id = recv(&mut socket).await["payload"]["requestId"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, _) = admin(
        &h,
        "POST",
        &format!("/api/pairing/reject/{request_id}"),
        Some(TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        recv(&mut socket).await,
        json!({"type": "pairing_rejected", "payload": {"status": "REJECTED"}})
    );

    let (status, body) = admin(
        &h,
        "POST",
        &format!("/api/pairing/approve/{request_id}"),
        Some(TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains(&request_id));

    h.server.shutdown();
}

#[tokio::test]
async fn test_admin_requires_token() {
    let h = start().await;

    let (status, _) = admin(&h, "GET", "/api/pairing/pending", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = admin(&h, "GET", "/api/pairing/pending", Some("wrong-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, keys) = admin(&h, "GET", "/api/pairing/navigator-key", Some(TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        STANDARD.decode(keys["publicKey"].as_str().unwrap()).unwrap().len(),
        32
    );

    let (status, health) = admin(&h, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");

    h.server.shutdown();
}

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = NavigatorConfig {
        data_dir: dir.path().to_path_buf(),
        database_path: Some(dir.path().join("devices.db")),
        ..Default::default()
    };

    let first = NavigatorServer::new(config.clone()).unwrap();
    let key = first.gateway().coordinator().navigator_public_key();
    drop(first);

    let second = NavigatorServer::new(config).unwrap();
    assert_eq!(second.gateway().coordinator().navigator_public_key(), key);
}
