// src/sfu.rs
//
// SFU forwarding core.
//
//   Publisher  ──RTP──>  per-track ingress loop ──> TrackForwarder ──> N
//                                                     (local track)     subscribers
//
// A publisher session owns one audio forwarder and three simulcast video
// forwarders (low/medium/high).  Each forwarder owns a `TrackLocalStaticRTP`
// that is attached to subscriber peer connections; writing one packet to the
// local track fans out to every attached transport.  RTCP feedback read from
// the senders feeds per-peer NetworkMetrics back into the store.
//
// Locking: one mutex guards the publishers/subscribers/forwarders maps; it
// is never held across RTP/RTCP reads or a peer-connection close.  Cleanup
// collects references under the lock, releases it, then closes connections.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::config::Config;
use crate::domain::{NetworkMetrics, QualityLabel};
use crate::error::Error;
use crate::events::{EventBus, EventPayload, EventType};
use crate::metrics::MetricsRegistry;
use crate::store::Store;

/// Fixed receive slab for RTP and RTCP reads.
const READ_BUF_SIZE: usize = 1500;

// ─── Track classification ───────────────────────────────────────────────────

/// What a forwarder carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackClass {
    Audio,
    Video(QualityLabel),
}

/// Per-packet admission class under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Audio,
    VideoKeyframe,
    VideoNormal,
    VideoLow,
}

/// Classify one packet given the track it arrived on.
pub fn classify_packet(class: TrackClass, mime: &str, payload: &[u8]) -> PacketClass {
    match class {
        TrackClass::Audio => PacketClass::Audio,
        TrackClass::Video(label) => {
            if is_keyframe(mime, payload) {
                PacketClass::VideoKeyframe
            } else if label == QualityLabel::Low {
                PacketClass::VideoLow
            } else {
                PacketClass::VideoNormal
            }
        }
    }
}

/// The admission rule: everything below 70 % load, drop video-low below
/// 90 %, audio and keyframes only above that.
pub fn admit(load_percent: u32, class: PacketClass) -> bool {
    if load_percent < 70 {
        return true;
    }
    if load_percent < 90 {
        return class != PacketClass::VideoLow;
    }
    matches!(class, PacketClass::Audio | PacketClass::VideoKeyframe)
}

// ─── Keyframe detection ─────────────────────────────────────────────────────

/// VP8 payload descriptor: when the X bit is set, skip the extension block
/// (picture id, TL0PICIDX, TID/KEYIDX) before the payload header, whose
/// inverse-keyframe P bit identifies keyframes.  The S bit must mark the
/// start of the partition.
fn vp8_is_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let b0 = payload[0];
    let start_of_partition = b0 & 0x10 != 0;
    let mut idx = 1usize;

    if b0 & 0x80 != 0 {
        // Extended control present.
        if payload.len() <= idx {
            return false;
        }
        let ext = payload[idx];
        idx += 1;
        if ext & 0x80 != 0 {
            // PictureID, one or two bytes.
            if payload.len() <= idx {
                return false;
            }
            idx += if payload[idx] & 0x80 != 0 { 2 } else { 1 };
        }
        if ext & 0x40 != 0 {
            idx += 1; // TL0PICIDX
        }
        if ext & 0x30 != 0 {
            idx += 1; // TID / KEYIDX
        }
    }

    start_of_partition && idx < payload.len() && payload[idx] & 0x01 == 0
}

/// H.264: NAL type 5 (IDR), directly or inside a STAP-A aggregate.
fn h264_is_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let nal_type = payload[0] & 0x1F;
    if nal_type == 5 {
        return true;
    }
    if nal_type == 24 {
        // STAP-A: [hdr] ([u16 size][nal])*
        let mut idx = 1usize;
        while idx + 2 < payload.len() {
            let size = ((payload[idx] as usize) << 8) | payload[idx + 1] as usize;
            idx += 2;
            if size == 0 || idx >= payload.len() {
                break;
            }
            if payload[idx] & 0x1F == 5 {
                return true;
            }
            idx += size;
        }
    }
    false
}

/// Codec-dispatching keyframe probe.
pub fn is_keyframe(mime: &str, payload: &[u8]) -> bool {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("vp8") {
        vp8_is_keyframe(payload)
    } else if mime.contains("h264") {
        h264_is_keyframe(payload)
    } else {
        false
    }
}

// ─── TrackForwarder ─────────────────────────────────────────────────────────

/// A fan-out node: one local track written by the publisher ingress loop,
/// read by every attached subscriber transport.  The subscriber set is
/// bookkeeping for cleanup and invariants; the media fan-out itself happens
/// inside `TrackLocalStaticRTP`.
pub struct TrackForwarder {
    pub id: String,
    pub publisher_id: String,
    pub stream_id: String,
    pub class: TrackClass,
    pub track: Arc<TrackLocalStaticRTP>,
    mime: String,
    subscribers: Mutex<HashMap<String, Arc<RTCPeerConnection>>>,
}

impl TrackForwarder {
    pub fn new(publisher_id: &str, stream_id: &str, class: TrackClass) -> Self {
        let (suffix, capability) = match class {
            TrackClass::Audio => (
                "audio".to_string(),
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    ..Default::default()
                },
            ),
            TrackClass::Video(label) => (
                format!("video-{label}"),
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    ..Default::default()
                },
            ),
        };
        let id = format!("{publisher_id}-{suffix}");
        let mime = capability.mime_type.clone();
        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            id.clone(),
            format!("meshcast-{publisher_id}"),
        ));
        Self {
            id,
            publisher_id: publisher_id.to_string(),
            stream_id: stream_id.to_string(),
            class,
            track,
            mime,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn add_subscriber(&self, peer_id: &str, pc: Arc<RTCPeerConnection>) {
        self.subscribers
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), pc);
    }

    pub fn remove_subscriber(&self, peer_id: &str) {
        self.subscribers.lock().unwrap().remove(peer_id);
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers.lock().unwrap().keys().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    fn subscriber_pcs(&self) -> Vec<Arc<RTCPeerConnection>> {
        self.subscribers.lock().unwrap().values().cloned().collect()
    }

    /// Write one parsed packet to the local track; the track fans out to
    /// every attached transport internally.
    pub async fn write(&self, packet: &webrtc::rtp::packet::Packet) -> Result<(), webrtc::Error> {
        use webrtc::track::track_local::TrackLocalWriter;
        self.track.write_rtp(packet).await.map(|_| ())
    }
}

// ─── Sessions ───────────────────────────────────────────────────────────────

pub struct PublisherSession {
    pub peer_id: String,
    pub stream_id: String,
    pub pc: Arc<RTCPeerConnection>,
    pub audio: Arc<TrackForwarder>,
    pub video: HashMap<QualityLabel, Arc<TrackForwarder>>,
    /// TrackID → forwarder, the union of audio + video.
    pub tracks: HashMap<String, Arc<TrackForwarder>>,
    /// Primary (high rung) video SSRC, for PLI requests.
    video_ssrc: AtomicU64,
    /// Arrival-order fallback for simulcast layers without a usable rid.
    next_layer: AtomicUsize,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl PublisherSession {
    /// Map an incoming remote video track to a simulcast rung.
    fn layer_for_rid(&self, rid: &str) -> QualityLabel {
        match rid {
            "low" | "q" => QualityLabel::Low,
            "medium" | "h" => QualityLabel::Medium,
            "high" | "f" => QualityLabel::High,
            _ => {
                // Assign in arrival order: high, medium, low.
                let order = [QualityLabel::High, QualityLabel::Medium, QualityLabel::Low];
                let idx = self.next_layer.fetch_add(1, Ordering::Relaxed);
                order[idx.min(order.len() - 1)]
            }
        }
    }
}

pub struct SubscriberSession {
    pub peer_id: String,
    pub stream_id: String,
    pub pc: Arc<RTCPeerConnection>,
    pub sources: Vec<String>,
    current_quality: Mutex<QualityLabel>,
    /// Per-source video senders, rebound on quality switches.
    video_senders: Mutex<Vec<(String, Arc<RTCRtpSender>)>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SubscriberSession {
    pub fn current_quality(&self) -> QualityLabel {
        *self.current_quality.lock().unwrap()
    }
}

// ─── RTCP digestion ─────────────────────────────────────────────────────────

/// Folded view of one RTCP batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RtcpSummary {
    pub fraction_lost: Vec<f64>,
    pub jitter_ms: Vec<f64>,
    pub rtt_ms: Option<f64>,
    pub nack_count: u32,
    pub pli_count: u32,
    pub sender_octets: u64,
    pub sender_packets: u64,
}

impl RtcpSummary {
    pub fn is_empty(&self) -> bool {
        self.fraction_lost.is_empty()
            && self.nack_count == 0
            && self.pli_count == 0
            && self.sender_octets == 0
    }

    fn avg(values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    /// Merge this batch into the peer's previous metrics sample.
    ///
    /// Bandwidth figures are carried over — they come from the client's
    /// own `metrics_update` messages, not from RTCP.
    pub fn apply_to(&self, previous: &NetworkMetrics) -> NetworkMetrics {
        let mut next = *previous;
        if let Some(loss) = Self::avg(&self.fraction_lost) {
            next.packet_loss = (loss + self.nack_count as f64 * 0.001).min(1.0);
        } else if self.nack_count > 0 {
            next.packet_loss = (previous.packet_loss + self.nack_count as f64 * 0.001).min(1.0);
        }
        if let Some(jitter) = Self::avg(&self.jitter_ms) {
            next.jitter_ms = jitter;
        }
        if let Some(rtt) = self.rtt_ms {
            next.latency_ms = rtt;
        }
        next.timestamp = crate::domain::now_millis();
        next
    }
}

/// Fold a compound RTCP batch into a summary.
pub fn process_rtcp(
    packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>],
) -> RtcpSummary {
    let mut summary = RtcpSummary::default();
    for packet in packets {
        let any = packet.as_any();
        if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
            for report in &rr.reports {
                summary
                    .fraction_lost
                    .push(report.fraction_lost as f64 / 256.0);
                // RTP jitter is in clock-rate units; video runs at 90 kHz.
                summary.jitter_ms.push(report.jitter as f64 / 90.0);
            }
        } else if let Some(sr) = any.downcast_ref::<SenderReport>() {
            summary.sender_octets += sr.octet_count as u64;
            summary.sender_packets += sr.packet_count as u64;
        } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
            summary.nack_count += nack
                .nacks
                .iter()
                .map(|p| p.packet_list().len() as u32)
                .sum::<u32>()
                .max(1);
        } else if any.downcast_ref::<PictureLossIndication>().is_some() {
            summary.pli_count += 1;
        }
    }
    summary
}

// ─── SfuServer ──────────────────────────────────────────────────────────────

struct SfuState {
    publishers: HashMap<String, Arc<PublisherSession>>,
    subscribers: HashMap<String, Arc<SubscriberSession>>,
    /// TrackID → forwarder.
    forwarders: HashMap<String, Arc<TrackForwarder>>,
}

pub struct SfuServer {
    config: Arc<Config>,
    store: Arc<Store>,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<SfuState>,
    /// Instance load input for the admission rule, percent.
    load_percent: AtomicU32,
}

impl SfuServer {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        bus: EventBus,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let sfu = Arc::new(Self {
            config,
            store,
            metrics,
            state: Mutex::new(SfuState {
                publishers: HashMap::new(),
                subscribers: HashMap::new(),
                forwarders: HashMap::new(),
            }),
            load_percent: AtomicU32::new(0),
        });
        sfu.spawn_quality_listener(bus);
        sfu
    }

    /// Feed the admission rule.  Wired to whatever load signal the deployment
    /// reports (CPU by default).
    pub fn set_load_percent(&self, load: u32) {
        self.load_percent.store(load.min(100), Ordering::Relaxed);
    }

    pub fn load_percent(&self) -> u32 {
        self.load_percent.load(Ordering::Relaxed)
    }

    /// `(publishers, subscribers, forwarders)` map sizes.
    pub fn session_counts(&self) -> (usize, usize, usize) {
        let st = self.state.lock().unwrap();
        (
            st.publishers.len(),
            st.subscribers.len(),
            st.forwarders.len(),
        )
    }

    pub fn publisher(&self, peer_id: &str) -> Option<Arc<PublisherSession>> {
        self.state.lock().unwrap().publishers.get(peer_id).cloned()
    }

    pub fn subscriber(&self, peer_id: &str) -> Option<Arc<SubscriberSession>> {
        self.state.lock().unwrap().subscribers.get(peer_id).cloned()
    }

    pub fn forwarder(&self, track_id: &str) -> Option<Arc<TrackForwarder>> {
        self.state.lock().unwrap().forwarders.get(track_id).cloned()
    }

    fn forwarders_of_publisher(&self, publisher_id: &str) -> Vec<Arc<TrackForwarder>> {
        self.state
            .lock()
            .unwrap()
            .forwarders
            .values()
            .filter(|f| f.publisher_id == publisher_id)
            .cloned()
            .collect()
    }

    // ── PeerConnection factory ──────────────────────────────────────────

    /// Create a new `RTCPeerConnection` using the configured ICE servers
    /// and optional ephemeral UDP port range.
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = webrtc::api::setting_engine::SettingEngine::default();
        if self.config.udp_port_min > 0 && self.config.udp_port_max > 0 {
            let ephemeral = webrtc::ice::udp_network::EphemeralUDP::new(
                self.config.udp_port_min,
                self.config.udp_port_max,
            )
            .map_err(|e| webrtc::Error::new(format!("invalid UDP port range: {e}")))?;
            setting_engine
                .set_udp_network(webrtc::ice::udp_network::UDPNetwork::Ephemeral(ephemeral));
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .ice_servers_for_server()
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await?;
        Ok(Arc::new(pc))
    }

    // ── ICE gathering helper ────────────────────────────────────────────

    async fn wait_for_ice(pc: &Arc<RTCPeerConnection>, timeout_secs: u64) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            if state == webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState::Complete {
                if let Some(t) = tx.lock().unwrap().take() {
                    let _ = t.send(());
                }
            }
            Box::pin(async {})
        }));
        let _ = tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), rx).await;
    }

    async fn offer_with_ice(pc: &Arc<RTCPeerConnection>) -> Result<RTCSessionDescription, Error> {
        let offer = pc.create_offer(None).await.map_err(Error::from)?;
        pc.set_local_description(offer).await.map_err(Error::from)?;
        Self::wait_for_ice(pc, 10).await;
        pc.local_description()
            .await
            .ok_or_else(|| Error::Transient("local description unavailable after ICE".into()))
    }

    // ── Disconnect wiring ───────────────────────────────────────────────

    fn register_disconnect_callbacks(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, peer_id: &str) {
        {
            let sfu = self.clone();
            let pid = peer_id.to_string();
            pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let sfu = sfu.clone();
                let pid = pid.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected
                    ) {
                        info!(peer_id = %pid, ?state, "ice state triggered cleanup");
                        sfu.cleanup_peer(&pid).await;
                    }
                })
            }));
        }
        {
            let sfu = self.clone();
            let pid = peer_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sfu = sfu.clone();
                let pid = pid.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
                    ) {
                        info!(peer_id = %pid, ?state, "connection state triggered cleanup");
                        sfu.cleanup_peer(&pid).await;
                    }
                })
            }));
        }
    }

    // ── Publisher establishment ─────────────────────────────────────────

    /// Create a publisher session and return the SDP offer.
    pub async fn create_publisher(
        self: &Arc<Self>,
        peer_id: &str,
        stream_id: &str,
    ) -> Result<RTCSessionDescription, Error> {
        crate::domain::validate_id(peer_id)?;
        crate::domain::validate_id(stream_id)?;
        if self.publisher(peer_id).is_some() {
            return Err(Error::Conflict(format!(
                "peer '{peer_id}' is already publishing"
            )));
        }

        let pc = self.create_peer_connection().await.map_err(|e| {
            warn!(peer_id, error = %e, "publisher peer connection failed");
            Error::Transient(format!("peer connection: {e}"))
        })?;

        // One audio forwarder plus the three simulcast rungs.
        let audio = Arc::new(TrackForwarder::new(peer_id, stream_id, TrackClass::Audio));
        let mut video = HashMap::new();
        for label in QualityLabel::descending() {
            video.insert(
                label,
                Arc::new(TrackForwarder::new(
                    peer_id,
                    stream_id,
                    TrackClass::Video(label),
                )),
            );
        }

        let cancel = CancellationToken::new();
        let mut tracks: HashMap<String, Arc<TrackForwarder>> = HashMap::new();
        tracks.insert(audio.id.clone(), audio.clone());
        for fwd in video.values() {
            tracks.insert(fwd.id.clone(), fwd.clone());
        }

        // Attach the local tracks so the offer negotiates both directions,
        // and drain sender RTCP for receiver reports from the publisher.
        for fwd in tracks.values() {
            let sender = pc
                .add_track(Arc::clone(&fwd.track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(Error::from)?;
            self.spawn_rtcp_loop(peer_id, sender, cancel.clone());
        }

        let session = Arc::new(PublisherSession {
            peer_id: peer_id.to_string(),
            stream_id: stream_id.to_string(),
            pc: pc.clone(),
            audio,
            video,
            tracks,
            video_ssrc: AtomicU64::new(0),
            next_layer: AtomicUsize::new(0),
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
        });

        self.setup_publisher_on_track(&pc, &session);
        self.register_disconnect_callbacks(&pc, peer_id);

        let offer = Self::offer_with_ice(&pc).await?;

        {
            let mut st = self.state.lock().unwrap();
            st.publishers.insert(peer_id.to_string(), session.clone());
            for fwd in session.tracks.values() {
                st.forwarders.insert(fwd.id.clone(), fwd.clone());
            }
        }
        self.metrics.inc_publishers(stream_id);
        info!(peer_id, stream_id, "publisher session established");
        Ok(offer)
    }

    /// Apply the publisher's SDP answer.
    pub async fn handle_publisher_answer(&self, peer_id: &str, sdp: String) -> Result<(), Error> {
        let session = self
            .publisher(peer_id)
            .ok_or_else(|| Error::NotFound(format!("publisher '{peer_id}'")))?;
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::InvalidInput(format!("invalid SDP answer: {e}")))?;
        session
            .pc
            .set_remote_description(answer)
            .await
            .map_err(Error::from)
    }

    /// Forward incoming publisher RTP into the matching forwarder.
    fn setup_publisher_on_track(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, session: &Arc<PublisherSession>) {
        let sfu = self.clone();
        let session = session.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sfu = sfu.clone();
            let session = session.clone();
            Box::pin(async move {
                let kind = track.kind();
                let rid = track.rid().to_string();
                info!(
                    peer_id = %session.peer_id,
                    ?kind,
                    rid = %rid,
                    ssrc = track.ssrc(),
                    "publisher track received"
                );

                let forwarder = if kind == RTPCodecType::Audio {
                    session.audio.clone()
                } else {
                    let label = session.layer_for_rid(&rid);
                    if label == QualityLabel::High {
                        session
                            .video_ssrc
                            .store(track.ssrc() as u64, Ordering::Relaxed);
                    }
                    session.video[&label].clone()
                };

                let cancel = session.cancel.clone();
                let load = sfu.clone();
                tokio::spawn(async move {
                    load.ingress_loop(track, forwarder, cancel).await;
                });
            })
        }));
    }

    /// Per-track ingress: read into the fixed slab, parse, admit, write.
    async fn ingress_loop(
        self: Arc<Self>,
        track: Arc<webrtc::track::track_remote::TrackRemote>,
        forwarder: Arc<TrackForwarder>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let (packet, _) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(track_id = %forwarder.id, "ingress loop cancelled");
                    return;
                }
                read = track.read(&mut buf) => match read {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Transport gone or peer closed: the loop ends.
                        debug!(track_id = %forwarder.id, error = %e, "ingress read ended");
                        return;
                    }
                }
            };

            let class = classify_packet(forwarder.class, forwarder.mime(), &packet.payload);
            if !admit(self.load_percent(), class) {
                self.metrics.inc_rtp_dropped();
                continue;
            }

            if let Err(e) = forwarder.write(&packet).await {
                // A single subscriber write failure never stops ingress.
                warn!(track_id = %forwarder.id, error = %e, "forwarder write failed");
                continue;
            }
            self.metrics.inc_rtp_forwarded();
        }
    }

    /// Drain and digest sender RTCP: receiver reports update the peer's
    /// stored metrics, PLIs are relayed to the publisher as keyframe
    /// requests.
    fn spawn_rtcp_loop(
        self: &Arc<Self>,
        peer_id: &str,
        sender: Arc<RTCRtpSender>,
        cancel: CancellationToken,
    ) {
        let sfu = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            loop {
                let packets = tokio::select! {
                    _ = cancel.cancelled() => return,
                    read = sender.read_rtcp() => match read {
                        Ok((packets, _)) => packets,
                        Err(e) => {
                            debug!(peer_id = %peer_id, error = %e, "rtcp loop ended");
                            return;
                        }
                    }
                };

                sfu.metrics.inc_rtcp_processed();
                let summary = process_rtcp(&packets);
                if summary.is_empty() {
                    continue;
                }

                if summary.pli_count > 0 {
                    sfu.request_keyframe_for_subscriber(&peer_id).await;
                }

                if !summary.fraction_lost.is_empty() || summary.nack_count > 0 {
                    match sfu.store.get_peer(&peer_id).await {
                        Ok(peer) => {
                            let next = summary.apply_to(&peer.metrics);
                            if let Err(e) = sfu.store.update_metrics(&peer_id, next).await {
                                debug!(peer_id = %peer_id, error = %e, "rtcp metrics update skipped");
                            }
                        }
                        Err(_) => {
                            // Peer not in the store (e.g. pure-SFU session);
                            // feedback still counts for observability.
                        }
                    }
                }
            }
        });
    }

    /// Relay a keyframe request from a subscriber to its sources.
    async fn request_keyframe_for_subscriber(&self, peer_id: &str) {
        let sources = match self.subscriber(peer_id) {
            Some(s) => s.sources.clone(),
            None => return,
        };
        for source in sources {
            self.request_keyframe(&source).await;
        }
    }

    /// Ask a publisher for an immediate keyframe (PLI).
    pub async fn request_keyframe(&self, publisher_id: &str) {
        let session = match self.publisher(publisher_id) {
            Some(p) => p,
            None => return,
        };
        let ssrc = session.video_ssrc.load(Ordering::Relaxed);
        if ssrc == 0 {
            return;
        }
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: ssrc as u32,
        };
        if let Err(e) = session.pc.write_rtcp(&[Box::new(pli)]).await {
            warn!(publisher_id, error = %e, "PLI send failed");
        }
    }

    // ── Subscriber establishment ────────────────────────────────────────

    /// Create a subscriber session attached to the given source peers and
    /// return the SDP offer.
    pub async fn create_subscriber(
        self: &Arc<Self>,
        peer_id: &str,
        stream_id: &str,
        sources: Vec<String>,
    ) -> Result<RTCSessionDescription, Error> {
        crate::domain::validate_id(peer_id)?;
        crate::domain::validate_id(stream_id)?;
        if self.subscriber(peer_id).is_some() {
            return Err(Error::Conflict(format!(
                "peer '{peer_id}' is already subscribed"
            )));
        }

        let pc = self.create_peer_connection().await.map_err(|e| {
            warn!(peer_id, error = %e, "subscriber peer connection failed");
            Error::Transient(format!("peer connection: {e}"))
        })?;

        let cancel = CancellationToken::new();
        let initial_quality = QualityLabel::Medium;
        let mut video_senders: Vec<(String, Arc<RTCRtpSender>)> = Vec::new();
        let mut attached_any = false;

        for source in &sources {
            let forwarders = self.forwarders_of_publisher(source);
            if forwarders.is_empty() {
                warn!(peer_id, source = %source, "source has no forwarders, skipping");
                continue;
            }
            for fwd in &forwarders {
                // Register in every forwarder set of the source; the media
                // attachment is audio plus the currently selected rung.
                fwd.add_subscriber(peer_id, pc.clone());
            }

            if let Some(audio) = forwarders.iter().find(|f| f.class == TrackClass::Audio) {
                let sender = pc
                    .add_track(Arc::clone(&audio.track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(Error::from)?;
                self.spawn_rtcp_loop(peer_id, sender, cancel.clone());
                attached_any = true;
            }
            if let Some(video) = forwarders
                .iter()
                .find(|f| f.class == TrackClass::Video(initial_quality))
            {
                let sender = pc
                    .add_track(Arc::clone(&video.track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(Error::from)?;
                self.spawn_rtcp_loop(peer_id, sender.clone(), cancel.clone());
                video_senders.push((source.clone(), sender));
                attached_any = true;
            }
        }

        if !attached_any {
            let _ = pc.close().await;
            return Err(Error::NotFound(format!(
                "no forwarders available for sources {sources:?}"
            )));
        }

        let session = Arc::new(SubscriberSession {
            peer_id: peer_id.to_string(),
            stream_id: stream_id.to_string(),
            pc: pc.clone(),
            sources: sources.clone(),
            current_quality: Mutex::new(initial_quality),
            video_senders: Mutex::new(video_senders),
            cancel,
            closed: AtomicBool::new(false),
        });

        self.register_disconnect_callbacks(&pc, peer_id);

        let offer = Self::offer_with_ice(&pc).await?;

        self.state
            .lock()
            .unwrap()
            .subscribers
            .insert(peer_id.to_string(), session);
        self.metrics.inc_subscribers(stream_id);

        // Fresh subscribers want a keyframe promptly.
        for source in &sources {
            self.request_keyframe(source).await;
        }

        info!(peer_id, stream_id, sources = sources.len(), "subscriber session established");
        Ok(offer)
    }

    /// Apply the subscriber's SDP answer.
    pub async fn handle_subscriber_answer(&self, peer_id: &str, sdp: String) -> Result<(), Error> {
        let session = self
            .subscriber(peer_id)
            .ok_or_else(|| Error::NotFound(format!("subscriber '{peer_id}'")))?;
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::InvalidInput(format!("invalid SDP answer: {e}")))?;
        session
            .pc
            .set_remote_description(answer)
            .await
            .map_err(Error::from)
    }

    // ── Simulcast layer selection ───────────────────────────────────────

    /// Rebind a subscriber's video senders to the forwarders of the new
    /// quality rung.
    pub async fn set_subscriber_quality(
        &self,
        peer_id: &str,
        label: QualityLabel,
    ) -> Result<(), Error> {
        let session = self
            .subscriber(peer_id)
            .ok_or_else(|| Error::NotFound(format!("subscriber '{peer_id}'")))?;

        let senders: Vec<(String, Arc<RTCRtpSender>)> =
            session.video_senders.lock().unwrap().clone();

        for (source, sender) in senders {
            let forwarder = self
                .forwarders_of_publisher(&source)
                .into_iter()
                .find(|f| f.class == TrackClass::Video(label));
            let Some(forwarder) = forwarder else {
                warn!(peer_id, source = %source, %label, "no forwarder for rung");
                continue;
            };
            if let Err(e) = sender
                .replace_track(Some(
                    Arc::clone(&forwarder.track) as Arc<dyn TrackLocal + Send + Sync>
                ))
                .await
            {
                warn!(peer_id, source = %source, error = %e, "layer rebind failed");
                continue;
            }
            // A new rung starts cleanly with a keyframe.
            self.request_keyframe(&source).await;
        }

        *session.current_quality.lock().unwrap() = label;
        info!(peer_id, %label, "subscriber layer selected");
        Ok(())
    }

    /// React to ABR quality.switched events.
    fn spawn_quality_listener(self: &Arc<Self>, bus: EventBus) {
        let sfu = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.event_type != EventType::QualitySwitched {
                            continue;
                        }
                        if let EventPayload::Quality(q) = event.data {
                            if sfu.subscriber(&q.peer_id).is_some() {
                                if let Err(e) =
                                    sfu.set_subscriber_quality(&q.peer_id, q.to).await
                                {
                                    debug!(peer_id = %q.peer_id, error = %e, "layer switch skipped");
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "quality listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    // ── Disconnection ───────────────────────────────────────────────────

    /// Tear down every session the peer participates in.
    ///
    /// Collect references under the lock, release it, then close
    /// connections; metric counters move exactly once per session.
    pub async fn cleanup_peer(&self, peer_id: &str) {
        struct Collected {
            publisher: Option<Arc<PublisherSession>>,
            subscriber: Option<Arc<SubscriberSession>>,
            orphaned_subscriber_pcs: Vec<Arc<RTCPeerConnection>>,
        }

        let collected = {
            let mut st = self.state.lock().unwrap();
            let publisher = st.publishers.remove(peer_id);
            let subscriber = st.subscribers.remove(peer_id);
            let mut orphaned_subscriber_pcs = Vec::new();

            if let Some(publisher) = &publisher {
                // Delete the publisher's forwarders and collect the PCs of
                // subscribers attached to them.
                for fwd in publisher.tracks.values() {
                    st.forwarders.remove(&fwd.id);
                    orphaned_subscriber_pcs.extend(fwd.subscriber_pcs());
                }
            }
            if subscriber.is_some() {
                // Remove this peer from every forwarder's subscriber set.
                for fwd in st.forwarders.values() {
                    fwd.remove_subscriber(peer_id);
                }
            }

            Collected {
                publisher,
                subscriber,
                orphaned_subscriber_pcs,
            }
        };

        if let Some(publisher) = collected.publisher {
            if !publisher.closed.swap(true, Ordering::SeqCst) {
                publisher.cancel.cancel();
                if let Err(e) = publisher.pc.close().await {
                    debug!(peer_id, error = %e, "publisher pc close");
                }
                for pc in &collected.orphaned_subscriber_pcs {
                    if let Err(e) = pc.close().await {
                        debug!(peer_id, error = %e, "orphaned subscriber pc close");
                    }
                }
                self.metrics.dec_publishers(&publisher.stream_id);
                info!(peer_id, stream_id = %publisher.stream_id, "publisher cleaned up");
            }
        }

        if let Some(subscriber) = collected.subscriber {
            if !subscriber.closed.swap(true, Ordering::SeqCst) {
                subscriber.cancel.cancel();
                if let Err(e) = subscriber.pc.close().await {
                    debug!(peer_id, error = %e, "subscriber pc close");
                }
                self.metrics.dec_subscribers(&subscriber.stream_id);
                info!(peer_id, stream_id = %subscriber.stream_id, "subscriber cleaned up");
            }
        }
    }

    /// Explicit disconnect (HTTP helper / control facade leave).
    pub async fn disconnect(&self, peer_id: &str) {
        self.cleanup_peer(peer_id).await;
    }

    /// Close every session (shutdown path).
    pub async fn shutdown(&self) {
        let peer_ids: Vec<String> = {
            let st = self.state.lock().unwrap();
            st.publishers
                .keys()
                .chain(st.subscribers.keys())
                .cloned()
                .collect()
        };
        for peer_id in peer_ids {
            self.cleanup_peer(&peer_id).await;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // VP8 payload with no extensions, S bit set, P bit clear (keyframe).
    const VP8_KEYFRAME: &[u8] = &[0x10, 0x00, 0x9D, 0x01, 0x2A];
    // Same but P bit set (interframe).
    const VP8_INTERFRAME: &[u8] = &[0x10, 0x01, 0x9D, 0x01, 0x2A];

    #[test]
    fn vp8_keyframe_plain_descriptor() {
        assert!(vp8_is_keyframe(VP8_KEYFRAME));
        assert!(!vp8_is_keyframe(VP8_INTERFRAME));
        assert!(!vp8_is_keyframe(&[]));
    }

    #[test]
    fn vp8_keyframe_extended_descriptor() {
        // X set, then extension byte with I (picture id, 1 byte), S set.
        let key = [0x90, 0x80, 0x42, 0x00, 0x9D];
        assert!(vp8_is_keyframe(&key));

        // Two-byte picture id (M bit inside picture id).
        let key_wide = [0x90, 0x80, 0x81, 0x42, 0x00, 0x9D];
        assert!(vp8_is_keyframe(&key_wide));

        // Not the start of a partition: never a keyframe boundary.
        let not_start = [0x80, 0x80, 0x42, 0x00, 0x9D];
        assert!(!vp8_is_keyframe(&not_start));
    }

    #[test]
    fn h264_keyframe_detection() {
        assert!(h264_is_keyframe(&[0x65, 0x88, 0x84])); // IDR
        assert!(!h264_is_keyframe(&[0x61, 0x9A])); // non-IDR slice
        // STAP-A wrapping SPS + IDR.
        let stap = [0x78, 0x00, 0x01, 0x67, 0x00, 0x02, 0x65, 0x88];
        assert!(h264_is_keyframe(&stap));
        let stap_no_idr = [0x78, 0x00, 0x01, 0x67, 0x00, 0x01, 0x61];
        assert!(!h264_is_keyframe(&stap_no_idr));
    }

    #[test]
    fn keyframe_dispatch_by_mime() {
        assert!(is_keyframe("video/VP8", VP8_KEYFRAME));
        assert!(is_keyframe("video/H264", &[0x65]));
        assert!(!is_keyframe("audio/opus", VP8_KEYFRAME));
    }

    #[test]
    fn packet_classification() {
        let audio = classify_packet(TrackClass::Audio, "audio/opus", &[0xFF]);
        assert_eq!(audio, PacketClass::Audio);

        let key = classify_packet(
            TrackClass::Video(QualityLabel::Low),
            "video/VP8",
            VP8_KEYFRAME,
        );
        assert_eq!(key, PacketClass::VideoKeyframe);

        let low = classify_packet(
            TrackClass::Video(QualityLabel::Low),
            "video/VP8",
            VP8_INTERFRAME,
        );
        assert_eq!(low, PacketClass::VideoLow);

        let normal = classify_packet(
            TrackClass::Video(QualityLabel::High),
            "video/VP8",
            VP8_INTERFRAME,
        );
        assert_eq!(normal, PacketClass::VideoNormal);
    }

    #[test]
    fn admission_rule_tiers() {
        // Below 70 %: everything goes through.
        for class in [
            PacketClass::Audio,
            PacketClass::VideoKeyframe,
            PacketClass::VideoNormal,
            PacketClass::VideoLow,
        ] {
            assert!(admit(69, class));
        }

        // 70–89 %: video-low is shed.
        assert!(admit(85, PacketClass::Audio));
        assert!(admit(85, PacketClass::VideoKeyframe));
        assert!(admit(85, PacketClass::VideoNormal));
        assert!(!admit(85, PacketClass::VideoLow));

        // 90 %+: only audio and keyframes.
        assert!(admit(95, PacketClass::Audio));
        assert!(admit(95, PacketClass::VideoKeyframe));
        assert!(!admit(95, PacketClass::VideoNormal));
        assert!(!admit(95, PacketClass::VideoLow));
    }

    #[test]
    fn forwarder_identity_and_bookkeeping() {
        let audio = TrackForwarder::new("pub-1", "s-1", TrackClass::Audio);
        assert_eq!(audio.id, "pub-1-audio");
        assert_eq!(audio.mime(), MIME_TYPE_OPUS);

        let video = TrackForwarder::new("pub-1", "s-1", TrackClass::Video(QualityLabel::High));
        assert_eq!(video.id, "pub-1-video-high");
        assert_eq!(video.mime(), MIME_TYPE_VP8);
        assert_eq!(video.subscriber_count(), 0);
        assert!(video.subscriber_ids().is_empty());

        video.remove_subscriber("nobody"); // no-op
        assert_eq!(video.subscriber_count(), 0);
    }

    #[test]
    fn rtcp_receiver_report_folds_to_metrics() {
        let rr = ReceiverReport {
            reports: vec![
                webrtc::rtcp::reception_report::ReceptionReport {
                    fraction_lost: 64, // 25 %
                    jitter: 900,       // 10 ms at 90 kHz
                    ..Default::default()
                },
                webrtc::rtcp::reception_report::ReceptionReport {
                    fraction_lost: 0,
                    jitter: 1800, // 20 ms
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let packets: Vec<Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>> =
            vec![Box::new(rr)];

        let summary = process_rtcp(&packets);
        assert_eq!(summary.fraction_lost.len(), 2);
        assert_eq!(summary.jitter_ms, vec![10.0, 20.0]);

        let prev = NetworkMetrics {
            bandwidth_down_kbps: 2000.0,
            packet_loss: 0.0,
            jitter_ms: 0.0,
            timestamp: 1,
            ..NetworkMetrics::default()
        };
        let next = summary.apply_to(&prev);
        assert!((next.packet_loss - 0.125).abs() < 1e-9);
        assert!((next.jitter_ms - 15.0).abs() < 1e-9);
        // Bandwidth is carried over, timestamp advances.
        assert_eq!(next.bandwidth_down_kbps, 2000.0);
        assert!(next.timestamp > prev.timestamp);
    }

    #[test]
    fn rtcp_nack_and_pli_counting() {
        let nack = TransportLayerNack {
            nacks: vec![webrtc::rtcp::transport_feedbacks::transport_layer_nack::NackPair {
                packet_id: 10,
                lost_packets: 0b101, // two lost packets beyond the pid
            }],
            ..Default::default()
        };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: 1234,
        };
        let packets: Vec<Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>> =
            vec![Box::new(nack), Box::new(pli)];

        let summary = process_rtcp(&packets);
        assert!(summary.nack_count >= 1);
        assert_eq!(summary.pli_count, 1);
        assert!(!summary.is_empty());
    }

    #[test]
    fn rtcp_sender_report_counters() {
        let sr = SenderReport {
            octet_count: 4096,
            packet_count: 32,
            ..Default::default()
        };
        let packets: Vec<Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>> =
            vec![Box::new(sr)];
        let summary = process_rtcp(&packets);
        assert_eq!(summary.sender_octets, 4096);
        assert_eq!(summary.sender_packets, 32);
    }

    // ── Disconnect cleanup ──────────────────────────────────────────────

    use crate::events::EventBus;
    use crate::store::MemoryStore;

    fn test_sfu() -> Arc<SfuServer> {
        let config = Arc::new(Config::default());
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        SfuServer::new(
            config,
            store,
            EventBus::new(),
            Arc::new(crate::metrics::MetricsRegistry::new()),
        )
    }

    /// Build a publisher session without negotiating (no network involved).
    async fn install_publisher(sfu: &Arc<SfuServer>, peer_id: &str, stream_id: &str) {
        let pc = sfu.create_peer_connection().await.unwrap();

        let audio = Arc::new(TrackForwarder::new(peer_id, stream_id, TrackClass::Audio));
        let mut video = HashMap::new();
        for label in QualityLabel::descending() {
            video.insert(
                label,
                Arc::new(TrackForwarder::new(
                    peer_id,
                    stream_id,
                    TrackClass::Video(label),
                )),
            );
        }
        let mut tracks: HashMap<String, Arc<TrackForwarder>> = HashMap::new();
        tracks.insert(audio.id.clone(), audio.clone());
        for fwd in video.values() {
            tracks.insert(fwd.id.clone(), fwd.clone());
        }

        let session = Arc::new(PublisherSession {
            peer_id: peer_id.to_string(),
            stream_id: stream_id.to_string(),
            pc,
            audio,
            video,
            tracks,
            video_ssrc: AtomicU64::new(0),
            next_layer: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let mut st = sfu.state.lock().unwrap();
        st.publishers.insert(peer_id.to_string(), session.clone());
        for fwd in session.tracks.values() {
            st.forwarders.insert(fwd.id.clone(), fwd.clone());
        }
        drop(st);
        sfu.metrics.inc_publishers(stream_id);
    }

    async fn install_subscriber(sfu: &Arc<SfuServer>, peer_id: &str, stream_id: &str, source: &str) {
        let pc = sfu.create_peer_connection().await.unwrap();
        for fwd in sfu.forwarders_of_publisher(source) {
            fwd.add_subscriber(peer_id, pc.clone());
        }
        let session = Arc::new(SubscriberSession {
            peer_id: peer_id.to_string(),
            stream_id: stream_id.to_string(),
            pc,
            sources: vec![source.to_string()],
            current_quality: Mutex::new(QualityLabel::Medium),
            video_senders: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        sfu.state
            .lock()
            .unwrap()
            .subscribers
            .insert(peer_id.to_string(), session);
        sfu.metrics.inc_subscribers(stream_id);
    }

    #[tokio::test]
    async fn publisher_disconnect_cleanup() {
        let sfu = test_sfu();
        install_publisher(&sfu, "pub-1", "s-1").await;
        install_subscriber(&sfu, "sub-1", "s-1", "pub-1").await;
        install_subscriber(&sfu, "sub-2", "s-1", "pub-1").await;

        sfu.set_load_percent(85);
        assert_eq!(sfu.load_percent(), 85);

        let audio_id = "pub-1-audio".to_string();
        assert!(sfu.forwarder(&audio_id).is_some());
        assert_eq!(sfu.forwarder(&audio_id).unwrap().subscriber_count(), 2);
        assert_eq!(sfu.metrics.stream_counts("s-1"), (1, 2));

        sfu.cleanup_peer("pub-1").await;

        // Publisher map and forwarder map no longer know the peer.
        assert!(sfu.publisher("pub-1").is_none());
        assert!(sfu.forwarder(&audio_id).is_none());
        let (pubs, _, forwarders) = sfu.session_counts();
        assert_eq!(pubs, 0);
        assert_eq!(forwarders, 0);

        // publisherCount decreased by exactly one, and a second cleanup
        // (callback racing the explicit path) is a no-op.
        assert_eq!(sfu.metrics.stream_counts("s-1").0, 0);
        sfu.cleanup_peer("pub-1").await;
        assert_eq!(sfu.metrics.stream_counts("s-1").0, 0);
    }

    #[tokio::test]
    async fn subscriber_disconnect_leaves_forwarder_sets() {
        let sfu = test_sfu();
        install_publisher(&sfu, "pub-1", "s-1").await;
        install_subscriber(&sfu, "sub-1", "s-1", "pub-1").await;

        sfu.cleanup_peer("sub-1").await;

        assert!(sfu.subscriber("sub-1").is_none());
        for fwd in sfu.forwarders_of_publisher("pub-1") {
            assert!(
                !fwd.subscriber_ids().contains(&"sub-1".to_string()),
                "subscriber must be purged from every forwarder set"
            );
        }
        assert_eq!(sfu.metrics.stream_counts("s-1"), (1, 0));
    }

    #[test]
    fn empty_rtcp_batch_is_empty() {
        let summary = process_rtcp(&[]);
        assert!(summary.is_empty());
        let prev = NetworkMetrics::default();
        // Applying an empty summary only refreshes the timestamp.
        let next = summary.apply_to(&prev);
        assert_eq!(next.packet_loss, prev.packet_loss);
        assert_eq!(next.jitter_ms, prev.jitter_ms);
    }
}
