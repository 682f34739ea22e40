// src/mesh.rs
//
// Mesh overlay engine.
//
// Builds and continuously rebalances a k-regular viewer-to-viewer overlay
// per stream: candidate peers are scored, each subscriber is wired to its
// best k sources, and a periodic pass replaces clearly-worse edges.  All
// stream-scoped rebalance work serialises on the store's stream lock, and
// per-edge write failures are logged and skipped — they never abort a
// rebalance.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MeshSettings;
use crate::domain::{NetworkMetrics, Peer, PeerEdge};
use crate::error::Error;
use crate::events::{EventBus, MeshcastEvent};
use crate::store::Store;

// ─── Engine ─────────────────────────────────────────────────────────────────

pub struct MeshEngine {
    store: Arc<Store>,
    cfg: MeshSettings,
    bus: EventBus,
}

impl MeshEngine {
    pub fn new(store: Arc<Store>, cfg: MeshSettings, bus: EventBus) -> Arc<Self> {
        Arc::new(Self { store, cfg, bus })
    }

    /// The single bandwidth figure used for scoring and edge bitrates.
    fn bandwidth(peer: &Peer) -> f64 {
        peer.metrics.bandwidth_down_kbps
    }

    // ── Scoring ─────────────────────────────────────────────────────────

    /// Score a candidate source.  Higher is better.
    ///
    /// Terms: latency `clamp(1 − ms/200, 0, 1)·w·100`, bandwidth
    /// `min(bw/10000, 1)·w·100`, reliability `max(1 − loss, 0)·w·100`,
    /// +20 publisher bonus, +10 relay bonus, CPU penalty −15 above 80 %
    /// or −5 above 60 %.
    pub fn score(&self, candidate: &Peer) -> f64 {
        let m = &candidate.metrics;

        let latency_term = (1.0 - m.latency_ms / 200.0).clamp(0.0, 1.0) * self.cfg.w_latency * 100.0;
        let bandwidth_term = (Self::bandwidth(candidate) / 10_000.0).min(1.0) * self.cfg.w_bandwidth * 100.0;
        let reliability_term = (1.0 - m.packet_loss).max(0.0) * self.cfg.w_reliability * 100.0;

        let mut score = latency_term + bandwidth_term + reliability_term;

        if candidate.capabilities.is_publisher {
            score += 20.0;
        }
        if candidate.capabilities.can_relay {
            score += 10.0;
        }

        if m.cpu_percent > 80.0 {
            score -= 15.0;
        } else if m.cpu_percent > 60.0 {
            score -= 5.0;
        }

        score
    }

    // ── Source selection ────────────────────────────────────────────────

    /// Top-scoring candidates for `target`: not the target itself,
    /// publisher or relay-capable, positive bandwidth, not saturated at
    /// `max_connections_per_peer`, and not already connected to the target.
    pub async fn find_optimal_sources(
        &self,
        stream_id: &str,
        target_id: &str,
        n: usize,
    ) -> Result<Vec<Peer>, Error> {
        let peers = self.store.find_by_stream(stream_id).await?;

        let mut scored: Vec<(f64, Peer)> = Vec::new();
        for peer in peers {
            if peer.id == target_id {
                continue;
            }
            if !peer.capabilities.is_publisher && !peer.capabilities.can_relay {
                continue;
            }
            if Self::bandwidth(&peer) <= 0.0 {
                continue;
            }
            let edges = self.store.edges_for_peer(&peer.id).await?;
            if edges.len() >= self.cfg.max_connections_per_peer {
                continue;
            }
            if edges.iter().any(|e| e.touches(target_id)) {
                continue;
            }
            scored.push((self.score(&peer), peer));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(n).map(|(_, p)| p).collect())
    }

    // ── Mesh construction ───────────────────────────────────────────────

    /// Build or repair the overlay for one stream.
    ///
    /// Serialises on the stream lock; concurrent rebalances of the same
    /// stream queue behind each other.
    pub async fn build_optimal_mesh(&self, stream_id: &str) -> Result<(), Error> {
        let lock = self.store.lock_stream(stream_id).await?;
        let result = self.build_locked(stream_id).await;
        self.store.unlock_stream(lock).await;
        result
    }

    async fn build_locked(&self, stream_id: &str) -> Result<(), Error> {
        let peers = self.store.find_by_stream(stream_id).await?;
        let by_id: HashMap<String, Peer> =
            peers.iter().map(|p| (p.id.clone(), p.clone())).collect();

        let subscribers: Vec<&Peer> = peers
            .iter()
            .filter(|p| !p.capabilities.is_publisher)
            .collect();

        for subscriber in subscribers {
            let current = self.store.edges_for_peer(&subscriber.id).await?;
            let degree = current.len();
            let target_degree = if degree < self.cfg.min_connections {
                self.cfg.min_connections
            } else {
                self.cfg.max_connections
            };

            if degree < target_degree {
                self.grow(stream_id, subscriber, target_degree - degree)
                    .await?;
            } else {
                self.optimise(stream_id, subscriber, &current, &by_id).await?;
            }
        }
        Ok(())
    }

    /// Add `want` new edges from the best unconnected sources.
    async fn grow(&self, stream_id: &str, subscriber: &Peer, want: usize) -> Result<(), Error> {
        let sources = self
            .find_optimal_sources(stream_id, &subscriber.id, want)
            .await?;
        for source in sources {
            let edge = match PeerEdge::new(&source.id, &subscriber.id, Self::bandwidth(&source)) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "edge construction rejected");
                    continue;
                }
            };
            if let Err(e) = self.store.add_edge(&edge).await {
                // Per-edge failures never abort the rebalance.
                warn!(
                    from = %edge.from,
                    to = %edge.to,
                    error = %e,
                    "edge write failed, continuing"
                );
                continue;
            }
            debug!(from = %edge.from, to = %edge.to, "overlay edge added");
        }
        Ok(())
    }

    /// Replace up to 25 % of a saturated subscriber's edges when an
    /// unconnected candidate strictly beats the current neighbour's score.
    async fn optimise(
        &self,
        stream_id: &str,
        subscriber: &Peer,
        current: &[PeerEdge],
        by_id: &HashMap<String, Peer>,
    ) -> Result<(), Error> {
        let max_replace = current.len() / 4;
        if max_replace == 0 {
            return Ok(());
        }

        // Score current neighbours, worst first.
        let mut neighbours: Vec<(f64, PeerEdge)> = current
            .iter()
            .filter_map(|e| {
                let other = if e.from == subscriber.id { &e.to } else { &e.from };
                by_id.get(other).map(|p| (self.score(p), e.clone()))
            })
            .collect();
        neighbours.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let candidates = self
            .find_optimal_sources(stream_id, &subscriber.id, max_replace)
            .await?;

        for ((old_score, old_edge), candidate) in neighbours.iter().take(max_replace).zip(candidates)
        {
            let new_score = self.score(&candidate);
            if new_score <= *old_score {
                continue;
            }

            // Remove old, then add new; failures skip to the next pair.
            if let Err(e) = self.store.remove_edge(&old_edge.from, &old_edge.to).await {
                warn!(error = %e, "edge removal failed during optimisation");
                continue;
            }
            let edge = match PeerEdge::new(&candidate.id, &subscriber.id, Self::bandwidth(&candidate))
            {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "replacement edge rejected");
                    continue;
                }
            };
            if let Err(e) = self.store.add_edge(&edge).await {
                warn!(error = %e, "replacement edge write failed");
                continue;
            }
            debug!(
                subscriber = %subscriber.id,
                old = %old_edge.from,
                new = %edge.from,
                old_score,
                new_score,
                "overlay edge replaced"
            );
        }
        Ok(())
    }

    // ── Peer lifecycle ──────────────────────────────────────────────────

    /// Persist a joining peer and schedule an asynchronous rebalance.
    pub async fn add_peer(self: &Arc<Self>, peer: Peer) -> Result<(), Error> {
        let stream_id = peer.stream_id.clone();
        let is_publisher = peer.capabilities.is_publisher;
        let peer_id = peer.id.clone();

        self.store.add_peer(&peer).await?;
        self.bus
            .emit(MeshcastEvent::peer_joined(&stream_id, &peer_id, is_publisher));
        self.schedule_rebalance(&stream_id);
        Ok(())
    }

    /// Drop all edges touching the peer, remove it, and rebalance.
    ///
    /// Returns `Ok(None)` when the peer was already gone — removal is
    /// idempotent from the callers' perspective (signaling close races
    /// against SFU disconnect cleanup).
    pub async fn remove_peer(self: &Arc<Self>, peer_id: &str) -> Result<Option<Peer>, Error> {
        self.store.remove_edges_touching(peer_id).await?;
        let peer = match self.store.remove_peer(peer_id).await {
            Ok(p) => p,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.bus.emit(MeshcastEvent::peer_left(
            &peer.stream_id,
            &peer.id,
            peer.capabilities.is_publisher,
        ));
        self.schedule_rebalance(&peer.stream_id);
        Ok(Some(peer))
    }

    /// Apply a metrics update coming from signaling or the SFU RTCP loop.
    pub async fn update_peer_metrics(
        &self,
        peer_id: &str,
        metrics: NetworkMetrics,
    ) -> Result<(), Error> {
        self.store.update_metrics(peer_id, metrics).await
    }

    fn schedule_rebalance(self: &Arc<Self>, stream_id: &str) {
        let engine = self.clone();
        let stream_id = stream_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.build_optimal_mesh(&stream_id).await {
                warn!(stream_id = %stream_id, error = %e, "scheduled rebalance failed");
            }
        });
    }

    // ── Path query ──────────────────────────────────────────────────────

    /// Shortest relay path between two peers of the same stream, breadth-
    /// first over the undirected view of the overlay.
    pub async fn get_optimal_path(&self, src: &str, dst: &str) -> Result<Vec<String>, Error> {
        let src_peer = self.store.get_peer(src).await?;
        let dst_peer = self.store.get_peer(dst).await?;
        if src_peer.stream_id != dst_peer.stream_id {
            return Err(Error::InvalidInput(format!(
                "peers '{src}' and '{dst}' are not in the same stream"
            )));
        }
        if src == dst {
            return Ok(vec![src.to_string()]);
        }

        let members: HashSet<String> = self
            .store
            .find_by_stream(&src_peer.stream_id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        // Undirected adjacency restricted to stream members.
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for member in &members {
            for edge in self.store.edges_for_peer(member).await? {
                let other = if &edge.from == member { &edge.to } else { &edge.from };
                if members.contains(other) {
                    adjacency
                        .entry(member.clone())
                        .or_default()
                        .push(other.clone());
                }
            }
        }

        let mut parent: HashMap<String, String> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        visited.insert(src.to_string());
        queue.push_back(src.to_string());

        while let Some(node) = queue.pop_front() {
            if node == dst {
                let mut path = vec![dst.to_string()];
                let mut cursor = dst.to_string();
                while let Some(prev) = parent.get(&cursor) {
                    path.push(prev.clone());
                    cursor = prev.clone();
                }
                path.reverse();
                return Ok(path);
            }
            for next in adjacency.get(&node).into_iter().flatten() {
                if visited.insert(next.clone()) {
                    parent.insert(next.clone(), node.clone());
                    queue.push_back(next.clone());
                }
            }
        }

        Err(Error::NotFound(format!("no path from '{src}' to '{dst}'")))
    }

    // ── Periodic rebalance ──────────────────────────────────────────────

    /// Spawn the instance-wide periodic rebalance task.
    pub fn spawn_periodic_rebalance(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let interval = Duration::from_secs(self.cfg.rebalance_interval_secs);
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                "periodic mesh rebalance started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("periodic mesh rebalance stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let streams = match engine.store.list_active_streams().await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "rebalance could not list streams");
                                continue;
                            }
                        };
                        for stream in streams {
                            if let Err(e) = engine.build_optimal_mesh(&stream.id).await {
                                warn!(
                                    stream_id = %stream.id,
                                    error = %e,
                                    "periodic rebalance failed for stream"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PeerCapabilities;
    use crate::store::MemoryStore;

    fn engine_with_store() -> (Arc<MeshEngine>, Arc<Store>) {
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let engine = MeshEngine::new(store.clone(), MeshSettings::default(), EventBus::new());
        (engine, store)
    }

    fn peer(
        id: &str,
        stream: &str,
        is_publisher: bool,
        can_relay: bool,
        bw: f64,
        latency: f64,
        loss: f64,
    ) -> Peer {
        let mut p = Peer::new(
            id,
            stream,
            PeerCapabilities {
                max_bitrate_kbps: bw as u32,
                codecs: vec!["VP8".into(), "opus".into()],
                is_publisher,
                can_relay,
            },
        )
        .unwrap();
        p.metrics = NetworkMetrics {
            bandwidth_down_kbps: bw,
            bandwidth_up_kbps: bw / 2.0,
            packet_loss: loss,
            latency_ms: latency,
            jitter_ms: 5.0,
            available_bitrate_kbps: bw,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            timestamp: 1,
        };
        p
    }

    #[test]
    fn score_terms() {
        let (engine, _) = engine_with_store();

        let publisher = peer("pub", "s", true, false, 3000.0, 50.0, 0.01);
        // 0.75·40 + 0.3·40 + 0.99·20 + 20 = 30 + 12 + 19.8 + 20
        assert!((engine.score(&publisher) - 81.8).abs() < 1e-9);

        let relay = peer("rel", "s", false, true, 2000.0, 100.0, 0.02);
        // 0.5·40 + 0.2·40 + 0.98·20 + 10 = 20 + 8 + 19.6 + 10
        assert!((engine.score(&relay) - 57.6).abs() < 1e-9);
    }

    #[test]
    fn score_cpu_penalties() {
        let (engine, _) = engine_with_store();
        let base = peer("p", "s", false, true, 2000.0, 100.0, 0.02);

        let mut busy = base.clone();
        busy.metrics.cpu_percent = 65.0;
        assert!((engine.score(&base) - engine.score(&busy) - 5.0).abs() < 1e-9);

        let mut overloaded = base.clone();
        overloaded.metrics.cpu_percent = 85.0;
        assert!((engine.score(&base) - engine.score(&overloaded) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn score_clamps_extreme_latency_and_bandwidth() {
        let (engine, _) = engine_with_store();
        let slow = peer("p", "s", false, true, 50_000.0, 1_000.0, 0.0);
        // Latency term floors at 0, bandwidth term caps at w·100.
        assert!((engine.score(&slow) - (40.0 + 20.0 + 10.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn optimal_sources_ranks_publisher_first() {
        // Overlay selection scenario: P beats both subscribers.
        let (engine, store) = engine_with_store();
        store
            .add_peer(&peer("P", "s", true, false, 3000.0, 50.0, 0.01))
            .await
            .unwrap();
        store
            .add_peer(&peer("S1", "s", false, true, 2000.0, 100.0, 0.02))
            .await
            .unwrap();
        store
            .add_peer(&peer("S2", "s", false, true, 1500.0, 150.0, 0.05))
            .await
            .unwrap();

        let sources = engine.find_optimal_sources("s", "S2", 2).await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].id, "P");
        assert_eq!(sources[1].id, "S1");
    }

    #[tokio::test]
    async fn optimal_sources_filters() {
        let (engine, store) = engine_with_store();
        store
            .add_peer(&peer("P", "s", true, false, 3000.0, 50.0, 0.01))
            .await
            .unwrap();
        // Neither publisher nor relay-capable: excluded.
        store
            .add_peer(&peer("plain", "s", false, false, 9000.0, 10.0, 0.0))
            .await
            .unwrap();
        // Zero bandwidth: excluded.
        store
            .add_peer(&peer("dry", "s", false, true, 0.0, 10.0, 0.0))
            .await
            .unwrap();
        // Already connected to the target: excluded.
        store
            .add_peer(&peer("linked", "s", false, true, 4000.0, 10.0, 0.0))
            .await
            .unwrap();
        store
            .add_edge(&PeerEdge::new("linked", "T", 4000.0).unwrap())
            .await
            .unwrap();
        store
            .add_peer(&peer("T", "s", false, false, 1000.0, 100.0, 0.02))
            .await
            .unwrap();

        let sources = engine.find_optimal_sources("s", "T", 10).await.unwrap();
        let ids: Vec<&str> = sources.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["P"]);
    }

    #[tokio::test]
    async fn optimal_sources_respects_saturation() {
        let cfg = MeshSettings {
            max_connections_per_peer: 2,
            ..MeshSettings::default()
        };
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let engine = MeshEngine::new(store.clone(), cfg, EventBus::new());

        store
            .add_peer(&peer("P", "s", true, false, 3000.0, 50.0, 0.01))
            .await
            .unwrap();
        store
            .add_peer(&peer("a", "s", false, false, 1000.0, 100.0, 0.0))
            .await
            .unwrap();
        store
            .add_peer(&peer("b", "s", false, false, 1000.0, 100.0, 0.0))
            .await
            .unwrap();
        store
            .add_peer(&peer("T", "s", false, false, 1000.0, 100.0, 0.0))
            .await
            .unwrap();
        store
            .add_edge(&PeerEdge::new("P", "a", 3000.0).unwrap())
            .await
            .unwrap();
        store
            .add_edge(&PeerEdge::new("P", "b", 3000.0).unwrap())
            .await
            .unwrap();

        // P sits at max_connections_per_peer and may not take more.
        let sources = engine.find_optimal_sources("s", "T", 5).await.unwrap();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn mesh_build_wires_subscribers_to_min_degree() {
        let (engine, store) = engine_with_store();
        store
            .add_peer(&peer("P", "s", true, false, 3000.0, 50.0, 0.01))
            .await
            .unwrap();
        store
            .add_peer(&peer("R", "s", false, true, 2500.0, 60.0, 0.01))
            .await
            .unwrap();
        store
            .add_peer(&peer("V", "s", false, false, 1500.0, 120.0, 0.03))
            .await
            .unwrap();

        engine.build_optimal_mesh("s").await.unwrap();

        let edges = store.edges_for_peer("V").await.unwrap();
        assert_eq!(edges.len(), MeshSettings::default().min_connections);
        assert!(edges.iter().all(|e| e.to == "V"));
        assert!(edges.iter().all(|e| e.quality == "auto"));
    }

    #[tokio::test]
    async fn rebalance_is_incremental() {
        let (engine, store) = engine_with_store();
        store
            .add_peer(&peer("P", "s", true, false, 3000.0, 50.0, 0.01))
            .await
            .unwrap();
        store
            .add_peer(&peer("V", "s", false, false, 1500.0, 120.0, 0.03))
            .await
            .unwrap();
        store
            .add_edge(&PeerEdge::new("P", "V", 3000.0).unwrap())
            .await
            .unwrap();

        // One edge exists, min is two, only one candidate remains: the
        // build must not duplicate the existing edge.
        engine.build_optimal_mesh("s").await.unwrap();
        assert_eq!(store.edges_for_peer("V").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn optimisation_replaces_strictly_worse_edge() {
        let cfg = MeshSettings {
            min_connections: 2,
            max_connections: 4,
            ..MeshSettings::default()
        };
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let engine = MeshEngine::new(store.clone(), cfg, EventBus::new());

        store
            .add_peer(&peer("V", "s", false, false, 1500.0, 120.0, 0.03))
            .await
            .unwrap();
        // Four mediocre connected relays, one excellent unconnected one.
        for id in ["a", "b", "c", "d"] {
            store
                .add_peer(&peer(id, "s", false, true, 500.0, 190.0, 0.09))
                .await
                .unwrap();
            store
                .add_edge(&PeerEdge::new(id, "V", 500.0).unwrap())
                .await
                .unwrap();
        }
        store
            .add_peer(&peer("best", "s", true, true, 9000.0, 10.0, 0.0))
            .await
            .unwrap();

        engine.build_optimal_mesh("s").await.unwrap();

        let edges = store.edges_for_peer("V").await.unwrap();
        assert_eq!(edges.len(), 4);
        assert!(
            edges.iter().any(|e| e.from == "best"),
            "best candidate should have displaced a weak neighbour"
        );
    }

    #[tokio::test]
    async fn add_and_remove_peer_lifecycle() {
        let (engine, store) = engine_with_store();
        engine
            .add_peer(peer("P", "s", true, false, 3000.0, 50.0, 0.01))
            .await
            .unwrap();
        engine
            .add_peer(peer("V", "s", false, false, 1500.0, 120.0, 0.03))
            .await
            .unwrap();
        engine.build_optimal_mesh("s").await.unwrap();

        let removed = engine.remove_peer("P").await.unwrap();
        assert_eq!(removed.unwrap().id, "P");
        assert!(store.edges_for_peer("V").await.unwrap().is_empty());

        // Removal is idempotent.
        assert!(engine.remove_peer("P").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn path_query_finds_shortest_route() {
        let (engine, store) = engine_with_store();
        for id in ["a", "b", "c", "d"] {
            store
                .add_peer(&peer(id, "s", false, true, 1000.0, 50.0, 0.0))
                .await
                .unwrap();
        }
        // a—b—c—d plus shortcut a—c.
        for (f, t) in [("a", "b"), ("b", "c"), ("c", "d"), ("a", "c")] {
            store
                .add_edge(&PeerEdge::new(f, t, 1000.0).unwrap())
                .await
                .unwrap();
        }

        let path = engine.get_optimal_path("a", "d").await.unwrap();
        assert_eq!(path, vec!["a", "c", "d"]);

        let trivial = engine.get_optimal_path("a", "a").await.unwrap();
        assert_eq!(trivial, vec!["a"]);
    }

    #[tokio::test]
    async fn path_query_reports_no_path() {
        let (engine, store) = engine_with_store();
        store
            .add_peer(&peer("a", "s", false, true, 1000.0, 50.0, 0.0))
            .await
            .unwrap();
        store
            .add_peer(&peer("b", "s", false, true, 1000.0, 50.0, 0.0))
            .await
            .unwrap();

        assert!(matches!(
            engine.get_optimal_path("a", "b").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn path_query_rejects_cross_stream() {
        let (engine, store) = engine_with_store();
        store
            .add_peer(&peer("a", "s1", false, true, 1000.0, 50.0, 0.0))
            .await
            .unwrap();
        store
            .add_peer(&peer("b", "s2", false, true, 1000.0, 50.0, 0.0))
            .await
            .unwrap();

        assert!(matches!(
            engine.get_optimal_path("a", "b").await,
            Err(Error::InvalidInput(_))
        ));
    }
}
