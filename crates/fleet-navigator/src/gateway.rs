//! Secure channel gateway.
//!
//! Terminates Mate WebSocket connections. Each connection runs a reader
//! loop that handles frames strictly in order, plus a writer task that
//! drains an unbounded queue, so any task (admin API, business handler)
//! can push frames to a connection through its [`ConnectionHandle`].
//!
//! Frames go through two stages: [`Gateway::decode`] turns the text into a
//! canonical [`Inbound`], stripping and decrypting the envelope, then
//! [`Gateway::dispatch`] routes the message.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use dashmap::{DashMap, DashSet};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use fleet_core::{AuthOutcome, PairingCoordinator, PairingError, TrustedDevice};
use fleet_crypto::cipher;
use fleet_crypto::CipherError;
use fleet_proto::outbound::{AuthChallenge, AuthFailed, AuthSuccess, EncryptedPayload, PairingApproved};
use fleet_proto::{AuthRequest, BusinessMessage, EncryptedFrame, FrameError, Inbound, Outbound, PairingRequest, PairingStatus};

pub type ConnectionId = u64;

/// Why a frame could not be handled. Only [`GatewayError::wire_message`]
/// reaches the peer.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("legacy registration is disabled")]
    LegacyRegistration,

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("no session secret for {0}")]
    SessionNotEstablished(String),

    #[error("device not connected: {0}")]
    NotConnected(String),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

impl GatewayError {
    pub fn wire_message(&self) -> &'static str {
        match self {
            GatewayError::LegacyRegistration => "Legacy registration is disabled, pairing required",
            GatewayError::NotAuthenticated => "Not authenticated",
            GatewayError::SessionNotEstablished(_) => "Session not established",
            GatewayError::Cipher(_) => "Decryption failed",
            GatewayError::Frame(_) => "Invalid message format",
            GatewayError::NotConnected(_)
            | GatewayError::Serialization(_)
            | GatewayError::ConnectionClosed => "Internal error",
        }
    }
}

// ============================================================================
// Connections
// ============================================================================

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

/// Sending side of one WebSocket connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, frame: &Outbound) -> Result<(), GatewayError> {
        self.send_text(frame.to_json()?)
    }

    pub fn send_text(&self, text: String) -> Result<(), GatewayError> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Which devices are reachable over which connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    by_device: DashMap<String, ConnectionHandle>,
    authenticated: DashSet<String>,
    by_connection: DashMap<ConnectionId, String>,
    pending_pairings: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle for a new connection.
    pub fn open(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        (ConnectionHandle { id, tx }, rx)
    }

    /// Bind an authenticated device to a connection.
    ///
    /// Returns the connection it displaced, if it was a different one.
    fn bind(&self, device_id: &str, conn: &ConnectionHandle) -> Option<ConnectionHandle> {
        self.by_connection.insert(conn.id, device_id.to_string());
        self.authenticated.insert(device_id.to_string());
        let previous = self.by_device.insert(device_id.to_string(), conn.clone())?;
        if previous.id == conn.id {
            return None;
        }
        self.by_connection
            .remove_if(&previous.id, |_, bound| bound == device_id);
        Some(previous)
    }

    /// Device authenticated on this connection, if any.
    pub fn device_of(&self, conn_id: ConnectionId) -> Option<String> {
        let device_id = self.by_connection.get(&conn_id)?.value().clone();
        self.authenticated.contains(&device_id).then_some(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.by_device.get(device_id).map(|e| e.value().clone())
    }

    pub fn is_authenticated(&self, device_id: &str) -> bool {
        self.authenticated.contains(device_id)
    }

    fn remember_pairing(&self, request_id: &str, conn: &ConnectionHandle) {
        self.pending_pairings.insert(request_id.to_string(), conn.clone());
    }

    fn take_pairing(&self, request_id: &str) -> Option<ConnectionHandle> {
        self.pending_pairings.remove(request_id).map(|(_, conn)| conn)
    }

    pub fn is_pairing(&self, conn_id: ConnectionId) -> bool {
        self.pending_pairings.iter().any(|e| e.value().id == conn_id)
    }

    /// Drop a device from every map. Returns its connection.
    fn release_device(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.authenticated.remove(device_id);
        let (_, conn) = self.by_device.remove(device_id)?;
        self.by_connection.remove_if(&conn.id, |_, bound| bound == device_id);
        Some(conn)
    }

    /// Forget a closed connection. Returns the device whose session it held.
    ///
    /// A device that has since reconnected elsewhere is left alone.
    fn release_connection(&self, conn_id: ConnectionId) -> Option<String> {
        self.pending_pairings.retain(|_, conn| conn.id != conn_id);
        let (_, device_id) = self.by_connection.remove(&conn_id)?;
        self.by_device
            .remove_if(&device_id, |_, conn| conn.id == conn_id)?;
        self.authenticated.remove(&device_id);
        Some(device_id)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.by_device.iter().map(|e| e.key().clone()).collect();
        devices.sort();
        devices
    }

    pub fn pending_pairing_count(&self) -> usize {
        self.pending_pairings.len()
    }
}

// ============================================================================
// Business messages
// ============================================================================

/// Receives every message the pairing layer does not interpret.
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    /// Handle a message from an authenticated device. A returned value is
    /// sent back to the device through the encrypted envelope.
    async fn handle(&self, device_id: &str, message: BusinessMessage) -> Option<Value>;
}

/// Logs business traffic and drops it.
pub struct LoggingHandler;

#[async_trait]
impl BusinessHandler for LoggingHandler {
    async fn handle(&self, device_id: &str, message: BusinessMessage) -> Option<Value> {
        debug!(device_id, kind = %message.kind, "Business message without handler");
        None
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Whether the reader loop keeps going after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Result of the transport stage.
enum Decoded {
    /// Arrived in clear
    Plain(Inbound),
    /// Arrived inside an envelope from this device
    Unwrapped { device_id: String, inner: Inbound },
}

pub struct Gateway {
    coordinator: Arc<PairingCoordinator>,
    connections: ConnectionRegistry,
    handler: Arc<dyn BusinessHandler>,
}

impl Gateway {
    pub fn new(coordinator: Arc<PairingCoordinator>, handler: Arc<dyn BusinessHandler>) -> Self {
        Self {
            coordinator,
            connections: ConnectionRegistry::new(),
            handler,
        }
    }

    pub fn coordinator(&self) -> &Arc<PairingCoordinator> {
        &self.coordinator
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.connections.connected_devices()
    }

    /// Drive one upgraded socket until it closes or the server shuts down.
    pub async fn serve_socket(
        self: Arc<Self>,
        socket: WebSocket,
        peer: SocketAddr,
        path_id: Option<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (conn, mut outgoing) = self.connections.open();
        let conn_id = conn.id();
        info!(conn_id, %peer, path_id = path_id.as_deref().unwrap_or("-"), "Mate connected");

        let (mut sink, mut stream) = socket.split();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                let (message, last) = match frame {
                    Outgoing::Text(text) => (Message::Text(text), false),
                    Outgoing::Close { code, reason } => (
                        Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };
                if sink.send(message).await.is_err() || last {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                message = stream.next() => {
                    let flow = match message {
                        Some(Ok(Message::Text(text))) => self.handle_text(&conn, Some(peer), &text).await,
                        Some(Ok(Message::Binary(_))) => {
                            self.reply_error(&conn, "Binary frames are not supported");
                            Flow::Continue
                        }
                        Some(Ok(Message::Close(_))) | None => Flow::Close,
                        Some(Ok(_)) => Flow::Continue,
                        Some(Err(e)) => {
                            debug!(conn_id, error = %e, "WebSocket receive error");
                            Flow::Close
                        }
                    };
                    if flow == Flow::Close {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        conn.close(close_code::AWAY, "Navigator shutting down");
                        break;
                    }
                }
            }
        }

        self.on_disconnect(&conn);
        drop(conn);
        let _ = writer.await;
        info!(conn_id, %peer, "Mate disconnected");
    }

    /// Handle one text frame.
    pub async fn handle_text(&self, conn: &ConnectionHandle, peer: Option<SocketAddr>, text: &str) -> Flow {
        match self.decode(conn, text) {
            Ok(decoded) => self.dispatch(conn, peer, decoded).await,
            Err(e) => {
                match &e {
                    GatewayError::Cipher(_) | GatewayError::SessionNotEstablished(_) => {
                        warn!(conn_id = conn.id(), error = %e, "Dropping encrypted frame")
                    }
                    _ => debug!(conn_id = conn.id(), error = %e, "Rejecting frame"),
                }
                self.reply_error(conn, e.wire_message());
                Flow::Continue
            }
        }
    }

    /// Transport stage: parse, and unwrap the envelope if there is one.
    fn decode(&self, conn: &ConnectionHandle, text: &str) -> Result<Decoded, GatewayError> {
        match Inbound::parse(text)? {
            Inbound::Encrypted(frame) => self.open_envelope(conn, frame),
            inbound => Ok(Decoded::Plain(inbound)),
        }
    }

    fn open_envelope(&self, conn: &ConnectionHandle, frame: EncryptedFrame) -> Result<Decoded, GatewayError> {
        let device_id = self
            .connections
            .device_of(conn.id())
            .ok_or(GatewayError::NotAuthenticated)?;
        if frame.device_id.as_deref().is_some_and(|claimed| claimed != device_id) {
            return Err(GatewayError::NotAuthenticated);
        }

        let secret = self
            .coordinator
            .session_secret(&device_id)
            .ok_or_else(|| GatewayError::SessionNotEstablished(device_id.clone()))?;
        let plaintext = cipher::open_base64(&secret, &frame.payload)?;
        let inner = Inbound::parse_inner(&plaintext)?;

        debug!(device_id = %device_id, kind = inner.kind(), "Unwrapped envelope");
        Ok(Decoded::Unwrapped { device_id, inner })
    }

    /// Dispatch stage.
    async fn dispatch(&self, conn: &ConnectionHandle, peer: Option<SocketAddr>, decoded: Decoded) -> Flow {
        let (inbound, sealed_by) = match decoded {
            Decoded::Plain(inbound) => (inbound, None),
            Decoded::Unwrapped { device_id, inner } => (inner, Some(device_id)),
        };
        debug!(conn_id = conn.id(), kind = inbound.kind(), sealed_by = sealed_by.as_deref(), "Frame received");

        match inbound {
            Inbound::PairingRequest(request) => self.on_pairing_request(conn, peer, request).await,
            Inbound::AuthChallengeRequest { device_id } => self.on_challenge_request(conn, &device_id),
            Inbound::Auth(request) => self.on_auth(conn, request).await,
            Inbound::Register => {
                let e = GatewayError::LegacyRegistration;
                warn!(conn_id = conn.id(), "Refusing legacy registration");
                self.reply_error(conn, e.wire_message());
                conn.close(close_code::POLICY, "Pairing required");
                return Flow::Close;
            }
            Inbound::Heartbeat { .. } => self.on_heartbeat(conn).await,
            Inbound::Business(message) => self.on_business(conn, message).await,
            // Envelopes are opened in `decode` and never nest
            Inbound::Encrypted(_) => self.reply_error(conn, GatewayError::NotAuthenticated.wire_message()),
        }
        Flow::Continue
    }

    async fn on_pairing_request(&self, conn: &ConnectionHandle, peer: Option<SocketAddr>, mut request: PairingRequest) {
        request.ipv6 = request.ipv6.map(|ip| strip_scope(&ip).to_string());
        if request.ipv4.is_none() && request.ipv6.is_none() {
            match peer.map(|addr| addr.ip().to_canonical()) {
                Some(IpAddr::V4(ip)) => request.ipv4 = Some(ip.to_string()),
                Some(IpAddr::V6(ip)) => request.ipv6 = Some(strip_scope(&ip.to_string()).to_string()),
                None => {}
            }
        }

        match self.coordinator.create_pairing_request(request).await {
            Ok(response) => {
                if response.status == PairingStatus::Pending {
                    if let Some(request_id) = &response.request_id {
                        self.connections.remember_pairing(request_id, conn);
                    }
                }
                self.reply(conn, &Outbound::PairingResponse(response));
            }
            Err(e @ (PairingError::InvalidKey(_) | PairingError::InvalidRequest(_))) => {
                debug!(conn_id = conn.id(), error = %e, "Invalid pairing request");
                self.reply_error(conn, &format!("Pairing request rejected: {e}"));
            }
            Err(e) => {
                error!(conn_id = conn.id(), error = %e, "Pairing request failed");
                self.reply_error(conn, "Pairing request failed");
            }
        }
    }

    fn on_challenge_request(&self, conn: &ConnectionHandle, device_id: &str) {
        let nonce = self.coordinator.generate_challenge(device_id);
        self.reply(
            conn,
            &Outbound::AuthChallenge(AuthChallenge {
                device_id: device_id.to_string(),
                nonce,
                navigator_public_key: self.coordinator.navigator_public_key(),
            }),
        );
    }

    async fn on_auth(&self, conn: &ConnectionHandle, request: AuthRequest) {
        let outcome = self
            .coordinator
            .authenticate(&request.device_id, &request.public_key, &request.signature, &request.nonce)
            .await;

        match outcome {
            Ok(AuthOutcome::Success { device_id, device_name }) => {
                if self.promote(conn, &device_id) {
                    self.reply(conn, &Outbound::AuthSuccess(AuthSuccess { device_id, device_name }));
                } else {
                    warn!(device_id = %device_id, "Session ended before the connection was bound");
                    self.reply(
                        conn,
                        &Outbound::AuthFailed(AuthFailed {
                            error: fleet_core::AuthFailure::WIRE_MESSAGE.to_string(),
                        }),
                    );
                }
            }
            Ok(AuthOutcome::Failed(cause)) => {
                self.reply(
                    conn,
                    &Outbound::AuthFailed(AuthFailed {
                        error: cause.wire_message().to_string(),
                    }),
                );
            }
            Err(e) => {
                error!(device_id = %request.device_id, error = %e, "Authentication aborted");
                self.reply(
                    conn,
                    &Outbound::AuthFailed(AuthFailed {
                        error: fleet_core::AuthFailure::WIRE_MESSAGE.to_string(),
                    }),
                );
            }
        }
    }

    /// Mark the connection authenticated for `device_id`.
    ///
    /// Returns `false`, leaving the connection unbound, when the device no
    /// longer holds a session (revoked or disabled mid-handshake).
    fn promote(&self, conn: &ConnectionHandle, device_id: &str) -> bool {
        if !self.coordinator.is_authenticated(device_id) {
            return false;
        }

        // One connection speaks for one device at a time
        if let Some(other) = self.connections.device_of(conn.id()) {
            if other != device_id {
                self.connections.release_device(&other);
                self.coordinator.end_session(&other);
            }
        }

        if let Some(previous) = self.connections.bind(device_id, conn) {
            info!(device_id, old_conn = previous.id(), new_conn = conn.id(), "Replacing older connection");
            previous.close(close_code::POLICY, "Replaced by a newer connection");
        }

        // A revoke may have landed between the check and the bind
        if !self.coordinator.is_authenticated(device_id) {
            self.connections.release_device(device_id);
            return false;
        }
        true
    }

    async fn on_heartbeat(&self, conn: &ConnectionHandle) {
        let Some(device_id) = self.connections.device_of(conn.id()) else {
            self.reply_error(conn, GatewayError::NotAuthenticated.wire_message());
            return;
        };
        if let Err(e) = self.coordinator.touch_last_seen(&device_id).await {
            warn!(device_id = %device_id, error = %e, "Failed to record heartbeat");
        }
    }

    async fn on_business(&self, conn: &ConnectionHandle, message: BusinessMessage) {
        let Some(device_id) = self.connections.device_of(conn.id()) else {
            debug!(conn_id = conn.id(), kind = %message.kind, "Business message before authentication");
            self.reply_error(conn, GatewayError::NotAuthenticated.wire_message());
            return;
        };
        if !self.coordinator.is_authenticated(&device_id) {
            debug!(device_id = %device_id, "Business message after the session ended");
            self.connections.release_device(&device_id);
            self.reply_error(conn, GatewayError::NotAuthenticated.wire_message());
            return;
        }

        if let Some(reply) = self.handler.handle(&device_id, message).await {
            if let Err(e) = self.send_encrypted(&device_id, &reply) {
                warn!(device_id = %device_id, error = %e, "Failed to send handler reply");
            }
        }
    }

    fn reply(&self, conn: &ConnectionHandle, frame: &Outbound) {
        if let Err(e) = conn.send(frame) {
            debug!(conn_id = conn.id(), error = %e, "Reply not delivered");
        }
    }

    fn reply_error(&self, conn: &ConnectionHandle, message: &str) {
        self.reply(conn, &Outbound::error(message));
    }

    // ------------------------------------------------------------------------
    // Outbound operations
    // ------------------------------------------------------------------------

    /// Send a frame to a device inside the encrypted envelope.
    ///
    /// Without a session secret the frame goes out in clear.
    pub fn send_encrypted<T: Serialize + ?Sized>(&self, device_id: &str, frame: &T) -> Result<(), GatewayError> {
        let conn = self
            .connections
            .get(device_id)
            .ok_or_else(|| GatewayError::NotConnected(device_id.to_string()))?;
        let json = serde_json::to_string(frame)?;

        let Some(secret) = self.coordinator.session_secret(device_id) else {
            warn!(device_id, "No session secret, sending frame unencrypted");
            return conn.send_text(json);
        };

        let payload = cipher::seal_base64(&secret, json.as_bytes())?;
        conn.send(&Outbound::Encrypted(EncryptedPayload {
            device_id: device_id.to_string(),
            payload,
            sequence: None,
        }))
    }

    /// Tell the connection that asked for pairing that it was approved.
    ///
    /// The connection stays unauthenticated; the Mate authenticates next.
    pub fn notify_pairing_approved(&self, request_id: &str, device: &TrustedDevice) -> bool {
        let Some(conn) = self.connections.take_pairing(request_id) else {
            debug!(request_id, "Approved pairing has no waiting connection");
            return false;
        };
        conn.send(&Outbound::PairingApproved(PairingApproved {
            device_id: device.device_id.clone(),
            device_name: device.name.clone(),
            navigator_exchange_key: self.coordinator.navigator_exchange_key(),
            status: PairingStatus::Approved,
        }))
        .is_ok()
    }

    pub fn notify_pairing_rejected(&self, request_id: &str) -> bool {
        match self.connections.take_pairing(request_id) {
            Some(conn) => conn.send(&Outbound::rejected()).is_ok(),
            None => false,
        }
    }

    /// Force-close a device's connection and end its session.
    pub fn disconnect_device(&self, device_id: &str, reason: &str) -> bool {
        self.coordinator.end_session(device_id);
        match self.connections.release_device(device_id) {
            Some(conn) => {
                info!(device_id, reason, "Disconnecting device");
                conn.close(close_code::POLICY, reason);
                true
            }
            None => false,
        }
    }

    fn on_disconnect(&self, conn: &ConnectionHandle) {
        if let Some(device_id) = self.connections.release_connection(conn.id()) {
            self.coordinator.end_session(&device_id);
            debug!(device_id = %device_id, conn_id = conn.id(), "Session closed with connection");
        }
    }
}

/// `fe80::1%eth0` -> `fe80::1`
fn strip_scope(ip: &str) -> &str {
    ip.split('%').next().unwrap_or(ip)
}
