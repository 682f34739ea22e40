// src/signal.rs
//
// Signaling plane: an authenticated, rate-limited duplex message bus that
// routes SDP/ICE between peers and hands out peer-list hints from the
// overlay engine.
//
// One WebSocket session per peer at `/ws?peer_id=...&token=...`.  Each
// session has exactly one writer task draining an outbound queue, which
// keeps source-to-target delivery FIFO for a connected pair.  The read
// loop applies a per-socket token bucket, a size cap, and ping/pong
// liveness; closing a session removes the peer from the overlay unless a
// newer session for the same peer id has already taken over (reconnect
// semantics).
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth;
use crate::config::Config;
use crate::domain::{validate_id, NetworkMetrics, Peer, PeerCapabilities};
use crate::error::{ApiError, Error};
use crate::mesh::MeshEngine;
use crate::metrics::MetricsRegistry;
use crate::quality::AbrController;
use crate::store::Store;

/// Peer-list hints cap: a joiner is pointed at up to this many sources.
const PEERS_LIST_LIMIT: usize = 4;

// ─── Wire format ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    JoinStream,
    Offer,
    Answer,
    IceCandidate,
    MetricsUpdate,
    PeersList,
    MetricsUpdated,
    Error,
}

/// One JSON frame on the signaling socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Sender (incoming) or routed source (outgoing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    /// Only set on routed outbound messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_peer: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SignalMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Error,
            peer_id: None,
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({ "message": message.into() }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JoinStreamPayload {
    stream_id: String,
    #[serde(default)]
    is_publisher: bool,
    #[serde(default)]
    capabilities: CapabilitiesPayload,
}

#[derive(Debug, Default, Deserialize)]
struct CapabilitiesPayload {
    #[serde(default)]
    max_bitrate: i64,
    #[serde(default)]
    codecs: Vec<String>,
    #[serde(default)]
    can_relay: bool,
}

#[derive(Debug, Deserialize)]
struct SdpPayload {
    sdp: String,
    #[serde(default)]
    target_peer: Option<String>,
    #[serde(default)]
    stream_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IceCandidatePayload {
    candidate: String,
    #[serde(default)]
    target_peer: Option<String>,
    #[serde(default)]
    stream_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetricsUpdatePayload {
    #[serde(default)]
    bandwidth: f64,
    #[serde(default)]
    packet_loss: f64,
    #[serde(default)]
    latency_ms: f64,
}

#[derive(Debug, Serialize)]
struct PeersListItem {
    peer_id: String,
    address: String,
    quality: String,
}

/// SDP sanity check: must open with `v=` and carry the mandatory o/s/t
/// lines.
pub fn validate_sdp(sdp: &str) -> Result<(), Error> {
    let ok = sdp.starts_with("v=")
        && sdp.contains("o=")
        && sdp.contains("s=")
        && sdp.contains("t=");
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput("invalid SDP format".into()))
    }
}

// ─── Rate limiting ──────────────────────────────────────────────────────────

/// Per-socket token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(refill_per_sec: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last: Instant::now(),
        }
    }

    /// Zero rate disables the limiter entirely.
    pub fn allow(&mut self) -> bool {
        if self.refill_per_sec <= 0.0 {
            return true;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-IP new-connection limiter: at most `max` connects per minute.
pub struct IpConnectLimiter {
    attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    max_per_minute: u32,
}

impl IpConnectLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_per_minute,
        }
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        if self.max_per_minute == 0 {
            return true;
        }
        let window = Duration::from_secs(60);
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap();
        attempts.retain(|_, stamps| {
            stamps.retain(|t| now.duration_since(*t) < window);
            !stamps.is_empty()
        });
        let entry = attempts.entry(ip).or_default();
        if entry.len() >= self.max_per_minute as usize {
            return false;
        }
        entry.push(now);
        true
    }
}

// ─── Connection registry ────────────────────────────────────────────────────

/// Frames queued towards one socket's writer task.
#[derive(Debug)]
enum OutboundFrame {
    Message(Box<SignalMessage>),
    Ping,
    Close,
}

struct PeerHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
    addr: Option<SocketAddr>,
}

// ─── Server ─────────────────────────────────────────────────────────────────

pub struct SignalServer {
    config: Arc<Config>,
    store: Arc<Store>,
    mesh: Arc<MeshEngine>,
    abr: Arc<AbrController>,
    metrics: Arc<MetricsRegistry>,
    conns: Mutex<HashMap<String, PeerHandle>>,
    generation: AtomicU64,
    active: AtomicUsize,
    ip_limiter: IpConnectLimiter,
    shutdown: CancellationToken,
}

impl SignalServer {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        mesh: Arc<MeshEngine>,
        abr: Arc<AbrController>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let ip_limiter = IpConnectLimiter::new(config.signal.connects_per_minute_per_ip);
        Arc::new(Self {
            config,
            store,
            mesh,
            abr,
            metrics,
            conns: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            ip_limiter,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.clone())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.conns.lock().unwrap().contains_key(peer_id)
    }

    fn peer_address(&self, peer_id: &str) -> Option<SocketAddr> {
        self.conns.lock().unwrap().get(peer_id).and_then(|h| h.addr)
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Install a session; an existing session for the same peer id is
    /// cancelled (reconnect semantics).  Returns the session generation.
    fn register(
        &self,
        peer_id: &str,
        addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<OutboundFrame>,
        cancel: CancellationToken,
    ) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = PeerHandle {
            generation,
            tx,
            cancel,
            addr,
        };
        let previous = self.conns.lock().unwrap().insert(peer_id.to_string(), handle);
        if let Some(previous) = previous {
            info!(peer_id, "replacing previous signaling session");
            let _ = previous.tx.send(OutboundFrame::Close);
            previous.cancel.cancel();
        }
        generation
    }

    /// Remove the session if it is still the current one for the peer id.
    /// Returns true when this call actually removed it.
    fn unregister(&self, peer_id: &str, generation: u64) -> bool {
        let mut conns = self.conns.lock().unwrap();
        match conns.get(peer_id) {
            Some(handle) if handle.generation == generation => {
                conns.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    /// Queue a message to a connected peer.  Undeliverable messages are
    /// neither stored nor retried.
    fn deliver(&self, target: &str, message: SignalMessage) -> Result<(), Error> {
        let conns = self.conns.lock().unwrap();
        let handle = conns
            .get(target)
            .ok_or_else(|| Error::NotFound(format!("peer '{target}' is not connected")))?;
        handle
            .tx
            .send(OutboundFrame::Message(Box::new(message)))
            .map_err(|_| Error::NotFound(format!("peer '{target}' is not connected")))
    }

    // ── Socket lifecycle ────────────────────────────────────────────────

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, peer_id: String, addr: SocketAddr) {
        let cancel = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let generation = self.register(&peer_id, Some(addr), out_tx.clone(), cancel.clone());
        self.active.fetch_add(1, Ordering::Relaxed);
        info!(peer_id = %peer_id, %addr, "signaling session open");

        let (mut sink, mut stream) = socket.split();

        // The single writer: serialises every frame towards this socket.
        let writer_peer = peer_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    OutboundFrame::Message(msg) => match serde_json::to_string(&*msg) {
                        Ok(json) => sink.send(Message::Text(json)).await,
                        Err(e) => {
                            warn!(peer_id = %writer_peer, error = %e, "outbound encode failed");
                            continue;
                        }
                    },
                    OutboundFrame::Ping => sink.send(Message::Ping(Vec::new())).await,
                    OutboundFrame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        let mut bucket = TokenBucket::new(
            self.config.signal.messages_per_second,
            self.config.signal.burst,
        );
        let ping_interval = Duration::from_secs(self.config.signal.ping_interval_secs.max(1));
        let pong_timeout = Duration::from_secs(self.config.signal.pong_timeout_secs.max(1));
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(peer_id = %peer_id, "session cancelled");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    let _ = out_tx.send(OutboundFrame::Close);
                    break;
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() > pong_timeout {
                        warn!(peer_id = %peer_id, "pong timeout, closing session");
                        break;
                    }
                    let _ = out_tx.send(OutboundFrame::Ping);
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            if text.len() > self.config.signal.max_message_size_bytes {
                                let _ = out_tx.send(OutboundFrame::Message(Box::new(
                                    SignalMessage::error("message too large"),
                                )));
                                continue;
                            }
                            if !bucket.allow() {
                                let _ = out_tx.send(OutboundFrame::Message(Box::new(
                                    SignalMessage::error("rate limit exceeded"),
                                )));
                                continue;
                            }
                            let message: SignalMessage = match serde_json::from_str(&text) {
                                Ok(m) => m,
                                Err(e) => {
                                    let _ = out_tx.send(OutboundFrame::Message(Box::new(
                                        SignalMessage::error(format!("malformed message: {e}")),
                                    )));
                                    continue;
                                }
                            };
                            match self.handle_message(&peer_id, message).await {
                                Ok(Some(reply)) => {
                                    let _ = out_tx.send(OutboundFrame::Message(Box::new(reply)));
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    debug!(peer_id = %peer_id, error = %e, "handler failure");
                                    let _ = out_tx.send(OutboundFrame::Message(Box::new(
                                        SignalMessage::error(e.message()),
                                    )));
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_seen = Instant::now();
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // The websocket layer answers pings itself; an
                            // inbound ping still proves liveness.
                            last_seen = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Binary(_))) => {
                            let _ = out_tx.send(OutboundFrame::Message(Box::new(
                                SignalMessage::error("binary frames are not supported"),
                            )));
                        }
                        Some(Err(e)) => {
                            debug!(peer_id = %peer_id, error = %e, "socket read error");
                            break;
                        }
                    }
                }
            }
        }

        writer.abort();
        self.active.fetch_sub(1, Ordering::Relaxed);

        // Only the current session tears down overlay state; a superseded
        // session (reconnect) leaves the peer in place.
        if self.unregister(&peer_id, generation) {
            if let Err(e) = self.mesh.remove_peer(&peer_id).await {
                warn!(peer_id = %peer_id, error = %e, "overlay removal on close failed");
            }
            self.abr.stop_monitoring(&peer_id);
            info!(peer_id = %peer_id, "signaling session closed");
        } else {
            debug!(peer_id = %peer_id, "superseded session closed");
        }
    }

    // ── Message handling ────────────────────────────────────────────────

    async fn handle_message(
        &self,
        sender_id: &str,
        message: SignalMessage,
    ) -> Result<Option<SignalMessage>, Error> {
        match message.kind {
            SignalKind::JoinStream => self.on_join_stream(sender_id, message).await,
            SignalKind::Offer | SignalKind::Answer => self.on_sdp(sender_id, message).await,
            SignalKind::IceCandidate => self.on_ice_candidate(sender_id, message).await,
            SignalKind::MetricsUpdate => self.on_metrics_update(sender_id, message).await,
            SignalKind::PeersList | SignalKind::MetricsUpdated | SignalKind::Error => Err(
                Error::InvalidInput("server-emitted message type received".into()),
            ),
        }
    }

    async fn on_join_stream(
        &self,
        sender_id: &str,
        message: SignalMessage,
    ) -> Result<Option<SignalMessage>, Error> {
        let payload: JoinStreamPayload = serde_json::from_value(message.payload)?;
        validate_id(&payload.stream_id)?;
        if payload.capabilities.max_bitrate < 0 {
            return Err(Error::InvalidInput("max_bitrate must be >= 0".into()));
        }

        let capabilities = PeerCapabilities {
            max_bitrate_kbps: payload.capabilities.max_bitrate as u32,
            codecs: if payload.capabilities.codecs.is_empty() {
                PeerCapabilities::default().codecs
            } else {
                payload.capabilities.codecs
            },
            is_publisher: payload.is_publisher,
            can_relay: payload.capabilities.can_relay,
        };
        let peer = Peer::new(sender_id, &payload.stream_id, capabilities)?;

        match self.mesh.add_peer(peer).await {
            Ok(()) => {}
            // Rejoin after reconnect: the peer record is still live.
            Err(Error::Conflict(_)) => {
                debug!(peer_id = sender_id, "join for existing peer, refreshing");
                self.store.heartbeat(sender_id).await?;
            }
            Err(e) => return Err(e),
        }

        self.abr.start_monitoring(sender_id, Arc::clone(&self.store));

        let sources = self
            .mesh
            .find_optimal_sources(&payload.stream_id, sender_id, PEERS_LIST_LIMIT)
            .await?;
        let items: Vec<PeersListItem> = sources
            .iter()
            .map(|p| PeersListItem {
                peer_id: p.id.clone(),
                address: self
                    .peer_address(&p.id)
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                quality: self
                    .abr
                    .current_quality(&p.id)
                    .map(|q| q.to_string())
                    .unwrap_or_else(|| "auto".to_string()),
            })
            .collect();

        Ok(Some(SignalMessage {
            kind: SignalKind::PeersList,
            peer_id: Some(sender_id.to_string()),
            stream_id: Some(payload.stream_id),
            from_peer: None,
            payload: serde_json::json!({ "peers": items }),
        }))
    }

    async fn on_sdp(
        &self,
        sender_id: &str,
        message: SignalMessage,
    ) -> Result<Option<SignalMessage>, Error> {
        let kind = message.kind;
        let payload: SdpPayload = serde_json::from_value(message.payload.clone())?;
        validate_sdp(&payload.sdp)?;

        let target = self
            .resolve_target(sender_id, payload.target_peer.as_deref(), payload.stream_id.as_deref())
            .await?;

        self.deliver(
            &target,
            SignalMessage {
                kind,
                peer_id: Some(sender_id.to_string()),
                stream_id: payload.stream_id.clone(),
                from_peer: Some(sender_id.to_string()),
                payload: message.payload,
            },
        )?;
        self.metrics.inc_signal_routed();
        Ok(None)
    }

    async fn on_ice_candidate(
        &self,
        sender_id: &str,
        message: SignalMessage,
    ) -> Result<Option<SignalMessage>, Error> {
        let payload: IceCandidatePayload = serde_json::from_value(message.payload.clone())?;
        if payload.candidate.is_empty() {
            return Err(Error::InvalidInput("candidate must not be empty".into()));
        }

        let target = self
            .resolve_target(sender_id, payload.target_peer.as_deref(), payload.stream_id.as_deref())
            .await?;

        self.deliver(
            &target,
            SignalMessage {
                kind: SignalKind::IceCandidate,
                peer_id: Some(sender_id.to_string()),
                stream_id: payload.stream_id.clone(),
                from_peer: Some(sender_id.to_string()),
                payload: message.payload,
            },
        )?;
        self.metrics.inc_signal_routed();
        Ok(None)
    }

    async fn on_metrics_update(
        &self,
        sender_id: &str,
        message: SignalMessage,
    ) -> Result<Option<SignalMessage>, Error> {
        let payload: MetricsUpdatePayload = serde_json::from_value(message.payload)?;
        if payload.bandwidth < 0.0 || payload.packet_loss < 0.0 || payload.latency_ms < 0.0 {
            return Err(Error::InvalidInput(
                "metrics fields must be non-negative".into(),
            ));
        }

        let previous = self.store.get_peer(sender_id).await?.metrics;
        let timestamp = crate::domain::now_millis();
        let next = NetworkMetrics {
            bandwidth_down_kbps: payload.bandwidth,
            bandwidth_up_kbps: previous.bandwidth_up_kbps,
            packet_loss: payload.packet_loss.min(1.0),
            latency_ms: payload.latency_ms,
            jitter_ms: previous.jitter_ms,
            available_bitrate_kbps: payload.bandwidth,
            cpu_percent: previous.cpu_percent,
            memory_percent: previous.memory_percent,
            timestamp,
        };
        self.mesh.update_peer_metrics(sender_id, next).await?;

        Ok(Some(SignalMessage {
            kind: SignalKind::MetricsUpdated,
            peer_id: Some(sender_id.to_string()),
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({ "timestamp": timestamp }),
        }))
    }

    // ── Target resolution ───────────────────────────────────────────────

    /// Deterministic routing: explicit target first, then the first
    /// publisher (by peer id) in the stream, then any other connected
    /// peer, otherwise no-target.
    async fn resolve_target(
        &self,
        sender_id: &str,
        explicit: Option<&str>,
        stream_hint: Option<&str>,
    ) -> Result<String, Error> {
        if let Some(target) = explicit {
            self.store.get_peer(target).await.map_err(|_| {
                Error::NotFound(format!("target peer '{target}' does not exist"))
            })?;
            if !self.is_connected(target) {
                return Err(Error::NotFound(format!(
                    "target peer '{target}' is not connected"
                )));
            }
            return Ok(target.to_string());
        }

        let stream_id = match stream_hint {
            Some(s) => s.to_string(),
            None => self.store.get_peer(sender_id).await?.stream_id,
        };

        let mut peers = self.store.find_by_stream(&stream_id).await?;
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(publisher) = peers
            .iter()
            .find(|p| p.capabilities.is_publisher && p.id != sender_id && self.is_connected(&p.id))
        {
            return Ok(publisher.id.clone());
        }

        if let Some(any) = peers
            .iter()
            .find(|p| p.id != sender_id && self.is_connected(&p.id))
        {
            return Ok(any.id.clone());
        }

        Err(Error::NotFound("no target peer available".into()))
    }

    // ── Graceful shutdown ───────────────────────────────────────────────

    /// Stop accepting sockets, ask every session to close, drain within
    /// the grace period, then force-cancel stragglers.
    pub async fn shutdown(&self) {
        info!(
            sessions = self.connection_count(),
            "signaling shutdown started"
        );
        self.shutdown.cancel();

        let handles: Vec<(String, CancellationToken)> = {
            let conns = self.conns.lock().unwrap();
            for handle in conns.values() {
                let _ = handle.tx.send(OutboundFrame::Close);
            }
            conns
                .iter()
                .map(|(id, h)| (id.clone(), h.cancel.clone()))
                .collect()
        };

        let grace = Duration::from_secs(self.config.signal.shutdown_grace_secs);
        let deadline = Instant::now() + grace;
        while self.connection_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if self.connection_count() > 0 {
            warn!(
                remaining = self.connection_count(),
                "grace period expired, force-closing sessions"
            );
            for (_, cancel) in handles {
                cancel.cancel();
            }
        }
        info!("signaling shutdown complete");
    }
}

// ─── HTTP upgrade handler ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsQuery {
    peer_id: String,
    #[serde(default)]
    token: Option<String>,
}

fn origin_allowed(headers: &HeaderMap, allowed: &str) -> bool {
    if allowed == "*" {
        return true;
    }
    let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        // Non-browser clients send no Origin; the token gate still applies.
        return true;
    };
    allowed
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == origin)
}

async fn ws_handler(
    State(server): State<Arc<SignalServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if server.shutdown.is_cancelled() {
        return ApiError::internal("server is shutting down").into_response();
    }

    if !origin_allowed(&headers, &server.config.allowed_origins) {
        return ApiError::unauthorized("origin not allowed").into_response();
    }

    if let Err(e) = validate_id(&query.peer_id) {
        return ApiError::from(e).into_response();
    }

    if server.config.auth_enabled {
        let Some(token) = query.token.as_deref() else {
            return ApiError::unauthorized("token query parameter required").into_response();
        };
        let claims = match auth::verify_token(&server.config.jwt_secret, token) {
            Ok(c) => c,
            Err(e) => {
                warn!(peer_id = %query.peer_id, error = %e, "signaling token rejected");
                return match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        ApiError::token_expired().into_response()
                    }
                    _ => ApiError::token_invalid().into_response(),
                };
            }
        };
        if let Some(bound) = &claims.peer_id {
            if bound != &query.peer_id {
                return ApiError::unauthorized("token is bound to a different peer").into_response();
            }
        }
    }

    if !server.ip_limiter.check(addr.ip()) {
        return ApiError::rate_limited("too many connections from this address").into_response();
    }

    let max = server.config.signal.max_connections;
    if max > 0 && server.connection_count() >= max {
        return ApiError::rate_limited("connection capacity reached").into_response();
    }

    let peer_id = query.peer_id;
    let server = server.clone();
    // Hard protocol cap well above the application cap; oversize frames
    // below it get an in-band error instead of a closed socket.
    let protocol_cap = server.config.signal.max_message_size_bytes.saturating_mul(2);
    ws.max_message_size(protocol_cap)
        .on_upgrade(move |socket| server.handle_socket(socket, peer_id, addr))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::store::MemoryStore;

    fn test_server() -> Arc<SignalServer> {
        let config = Arc::new(Config::default());
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let bus = EventBus::new();
        let mesh = MeshEngine::new(store.clone(), config.mesh.clone(), bus.clone());
        let abr = Arc::new(AbrController::new(config.abr.clone(), bus));
        let metrics = Arc::new(MetricsRegistry::new());
        SignalServer::new(config, store, mesh, abr, metrics)
    }

    fn connect(server: &Arc<SignalServer>, peer_id: &str) -> mpsc::UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        server.register(peer_id, None, tx, CancellationToken::new());
        rx
    }

    fn join_msg(stream: &str, is_publisher: bool, bitrate: i64) -> SignalMessage {
        SignalMessage {
            kind: SignalKind::JoinStream,
            peer_id: None,
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({
                "stream_id": stream,
                "is_publisher": is_publisher,
                "capabilities": { "max_bitrate": bitrate, "codecs": ["VP8"], "can_relay": true }
            }),
        }
    }

    fn recv_message(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> SignalMessage {
        match rx.try_recv().expect("expected a frame") {
            OutboundFrame::Message(m) => *m,
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    const VALID_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn sdp_validation() {
        assert!(validate_sdp(VALID_SDP).is_ok());
        assert!(validate_sdp("hello").is_err());
        assert!(validate_sdp("v=0\r\no=- 0 0\r\ns=-\r\n").is_err()); // missing t=
        assert!(validate_sdp("").is_err());
    }

    #[test]
    fn sdp_rejection_message_matches_contract() {
        let err = validate_sdp("hello").unwrap_err();
        // The wire error payload carries the bare message.
        assert_eq!(err.message(), "invalid SDP format");
        assert_eq!(err.to_string(), "invalid input: invalid SDP format");
    }

    #[test]
    fn token_bucket_enforces_rate_and_burst() {
        let mut bucket = TokenBucket::new(10.0, 3.0);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        // Burst exhausted, immediate fourth call is rejected.
        assert!(!bucket.allow());
    }

    #[test]
    fn token_bucket_zero_rate_is_passthrough() {
        let mut bucket = TokenBucket::new(0.0, 0.0);
        for _ in 0..1000 {
            assert!(bucket.allow());
        }
    }

    #[test]
    fn ip_limiter_caps_per_minute() {
        let limiter = IpConnectLimiter::new(2);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
        // Other addresses are unaffected.
        assert!(limiter.check("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn ip_limiter_zero_disables() {
        let limiter = IpConnectLimiter::new(0);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..100 {
            assert!(limiter.check(ip));
        }
    }

    #[test]
    fn signal_message_wire_shape() {
        let json = r#"{"type":"join_stream","peer_id":"p1","payload":{"stream_id":"s"}}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, SignalKind::JoinStream);
        assert_eq!(msg.peer_id.as_deref(), Some("p1"));

        let out = SignalMessage::error("boom");
        let encoded = serde_json::to_string(&out).unwrap();
        assert!(encoded.contains("\"type\":\"error\""));
        assert!(encoded.contains("\"message\":\"boom\""));
        // Absent optionals are omitted from the wire.
        assert!(!encoded.contains("from_peer"));
    }

    #[tokio::test]
    async fn join_stream_replies_with_peers_list() {
        let server = test_server();
        let _pub_rx = connect(&server, "pub-1");
        let _sub_rx = connect(&server, "sub-1");

        let reply = server
            .handle_message("pub-1", join_msg("s-1", true, 2500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, SignalKind::PeersList);

        // Give the publisher bandwidth so it qualifies as a source.
        let mut p = server.store.get_peer("pub-1").await.unwrap();
        p.metrics.bandwidth_down_kbps = 3000.0;
        p.metrics.timestamp = 1;
        server.store.update_peer(&p).await.unwrap();

        let reply = server
            .handle_message("sub-1", join_msg("s-1", false, 1000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, SignalKind::PeersList);
        let peers = reply.payload["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["peer_id"], "pub-1");
        assert!(peers.len() <= PEERS_LIST_LIMIT);

        // Both peers are persisted.
        assert!(server.store.get_peer("pub-1").await.is_ok());
        assert!(server.store.get_peer("sub-1").await.is_ok());
    }

    #[tokio::test]
    async fn join_stream_validates_input() {
        let server = test_server();

        let bad_stream = server
            .handle_message("p", join_msg("bad stream id!", false, 0))
            .await;
        assert!(matches!(bad_stream, Err(Error::InvalidInput(_))));

        let bad_bitrate = server
            .handle_message("p", join_msg("s-1", false, -5))
            .await;
        assert!(matches!(bad_bitrate, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn rejoin_after_reconnect_is_tolerated() {
        let server = test_server();
        let _rx = connect(&server, "p1");
        server
            .handle_message("p1", join_msg("s-1", false, 500))
            .await
            .unwrap();
        // The same peer joining again (second socket) must not error.
        let reply = server
            .handle_message("p1", join_msg("s-1", false, 500))
            .await
            .unwrap();
        assert!(reply.is_some());
    }

    #[tokio::test]
    async fn offer_routes_to_explicit_target_with_from_peer() {
        let server = test_server();
        let _a = connect(&server, "a");
        let mut b = connect(&server, "b");
        server.handle_message("a", join_msg("s-1", true, 100)).await.unwrap();
        server.handle_message("b", join_msg("s-1", false, 100)).await.unwrap();

        let offer = SignalMessage {
            kind: SignalKind::Offer,
            peer_id: None,
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({ "sdp": VALID_SDP, "target_peer": "b" }),
        };
        let reply = server.handle_message("a", offer).await.unwrap();
        assert!(reply.is_none(), "routed messages have no sender reply");

        let routed = recv_message(&mut b);
        assert_eq!(routed.kind, SignalKind::Offer);
        assert_eq!(routed.from_peer.as_deref(), Some("a"));
        assert_eq!(routed.peer_id.as_deref(), Some("a"));
        assert_eq!(routed.payload["sdp"], VALID_SDP);
    }

    #[tokio::test]
    async fn invalid_sdp_is_rejected_before_routing() {
        let server = test_server();
        let _a = connect(&server, "a");
        let mut b = connect(&server, "b");
        server.handle_message("a", join_msg("s-1", false, 100)).await.unwrap();
        server.handle_message("b", join_msg("s-1", false, 100)).await.unwrap();

        let offer = SignalMessage {
            kind: SignalKind::Offer,
            peer_id: None,
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({ "sdp": "hello", "target_peer": "b" }),
        };
        let err = server.handle_message("a", offer).await.unwrap_err();
        assert!(err.to_string().contains("invalid SDP format"));
        assert!(b.try_recv().is_err(), "nothing must reach the target");
    }

    #[tokio::test]
    async fn ice_candidate_routes_and_requires_content() {
        let server = test_server();
        let _a = connect(&server, "a");
        let mut b = connect(&server, "b");
        server.handle_message("a", join_msg("s-1", false, 100)).await.unwrap();
        server.handle_message("b", join_msg("s-1", false, 100)).await.unwrap();

        let empty = SignalMessage {
            kind: SignalKind::IceCandidate,
            peer_id: None,
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({ "candidate": "", "target_peer": "b" }),
        };
        assert!(server.handle_message("a", empty).await.is_err());

        let candidate = SignalMessage {
            kind: SignalKind::IceCandidate,
            peer_id: None,
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({
                "candidate": "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host",
                "target_peer": "b"
            }),
        };
        server.handle_message("a", candidate).await.unwrap();
        let routed = recv_message(&mut b);
        assert_eq!(routed.kind, SignalKind::IceCandidate);
        assert_eq!(routed.from_peer.as_deref(), Some("a"));
        assert_eq!(
            routed.payload["candidate"],
            "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host"
        );
    }

    #[tokio::test]
    async fn target_resolution_priority() {
        let server = test_server();
        let _a = connect(&server, "a");
        let _p = connect(&server, "p");
        let _z = connect(&server, "z");
        server.handle_message("z", join_msg("s-1", false, 100)).await.unwrap();
        server.handle_message("p", join_msg("s-1", true, 100)).await.unwrap();
        server.handle_message("a", join_msg("s-1", false, 100)).await.unwrap();

        // No explicit target: the publisher wins over the lexically-first peer.
        let target = server.resolve_target("a", None, Some("s-1")).await.unwrap();
        assert_eq!(target, "p");

        // The publisher itself falls through to any other peer.
        let target = server.resolve_target("p", None, Some("s-1")).await.unwrap();
        assert_eq!(target, "a");

        // Explicit target must exist.
        let missing = server.resolve_target("a", Some("ghost"), None).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn target_resolution_requires_connection() {
        let server = test_server();
        let _a = connect(&server, "a");
        server.handle_message("a", join_msg("s-1", false, 100)).await.unwrap();

        // "b" exists in the store but holds no socket.
        let b = Peer::new("b", "s-1", PeerCapabilities::default()).unwrap();
        server.store.add_peer(&b).await.unwrap();

        let explicit = server.resolve_target("a", Some("b"), None).await;
        assert!(matches!(explicit, Err(Error::NotFound(_))));

        let fallback = server.resolve_target("a", None, Some("s-1")).await;
        assert!(matches!(fallback, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn metrics_update_round_trip() {
        let server = test_server();
        let _a = connect(&server, "a");
        server.handle_message("a", join_msg("s-1", false, 100)).await.unwrap();

        let update = SignalMessage {
            kind: SignalKind::MetricsUpdate,
            peer_id: None,
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({
                "bandwidth": 1800.0, "packet_loss": 0.02, "latency_ms": 45.0
            }),
        };
        let reply = server.handle_message("a", update).await.unwrap().unwrap();
        assert_eq!(reply.kind, SignalKind::MetricsUpdated);
        assert!(reply.payload["timestamp"].as_i64().unwrap() > 0);

        let stored = server.store.get_peer("a").await.unwrap();
        assert_eq!(stored.metrics.bandwidth_down_kbps, 1800.0);
        assert_eq!(stored.metrics.packet_loss, 0.02);
        assert_eq!(stored.metrics.latency_ms, 45.0);
    }

    #[tokio::test]
    async fn metrics_update_rejects_negative_fields() {
        let server = test_server();
        let _a = connect(&server, "a");
        server.handle_message("a", join_msg("s-1", false, 100)).await.unwrap();

        let update = SignalMessage {
            kind: SignalKind::MetricsUpdate,
            peer_id: None,
            stream_id: None,
            from_peer: None,
            payload: serde_json::json!({
                "bandwidth": -1.0, "packet_loss": 0.0, "latency_ms": 0.0
            }),
        };
        assert!(matches!(
            server.handle_message("a", update).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_session() {
        let server = test_server();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let cancel1 = CancellationToken::new();
        let gen1 = server.register("p", None, tx1, cancel1.clone());

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let gen2 = server.register("p", None, tx2, CancellationToken::new());
        assert_ne!(gen1, gen2);

        // The first session was told to close and cancelled.
        assert!(cancel1.is_cancelled());
        assert!(matches!(
            rx1.try_recv(),
            Ok(OutboundFrame::Close)
        ));

        // Its teardown must not unregister the replacement.
        assert!(!server.unregister("p", gen1));
        assert!(server.is_connected("p"));
        assert!(server.unregister("p", gen2));
        assert!(!server.is_connected("p"));
    }

    #[tokio::test]
    async fn server_emitted_kinds_are_rejected_inbound() {
        let server = test_server();
        for kind in [SignalKind::PeersList, SignalKind::MetricsUpdated, SignalKind::Error] {
            let msg = SignalMessage {
                kind,
                peer_id: None,
                stream_id: None,
                from_peer: None,
                payload: serde_json::Value::Null,
            };
            assert!(server.handle_message("a", msg).await.is_err());
        }
    }

    #[test]
    fn origin_check() {
        let mut headers = HeaderMap::new();
        assert!(origin_allowed(&headers, "*"));

        headers.insert(ORIGIN, "https://app.example.com".parse().unwrap());
        assert!(origin_allowed(
            &headers,
            "https://app.example.com, https://admin.example.com"
        ));
        assert!(!origin_allowed(&headers, "https://other.example.com"));
    }
}
