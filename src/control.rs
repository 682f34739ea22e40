// src/control.rs
//
// Control facade: the thin stream-lifecycle API the HTTP layer calls.
// Orchestrates the store, the mesh engine, the ABR controller and the SFU.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{Peer, PeerCapabilities, Stream};
use crate::error::Error;
use crate::events::{EventBus, MeshcastEvent};
use crate::mesh::MeshEngine;
use crate::metrics::MetricsRegistry;
use crate::quality::AbrController;
use crate::reliability::{guarded, PeerBreakers, RetryPolicy};
use crate::sfu::SfuServer;
use crate::store::Store;

// ─── Stats ──────────────────────────────────────────────────────────────────

/// Aggregate view of one stream, computed from the peer store.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamStats {
    pub active_publishers: usize,
    pub active_subscribers: usize,
    pub total_bitrate_kbps: f64,
    pub average_latency_ms: f64,
    /// 0..=100.
    pub health_score: u32,
}

// ─── Facade ─────────────────────────────────────────────────────────────────

pub struct StreamService {
    config: Arc<Config>,
    store: Arc<Store>,
    mesh: Arc<MeshEngine>,
    abr: Arc<AbrController>,
    sfu: Arc<SfuServer>,
    metrics: Arc<MetricsRegistry>,
    bus: EventBus,
    retry: RetryPolicy,
    breakers: PeerBreakers,
}

impl StreamService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        mesh: Arc<MeshEngine>,
        abr: Arc<AbrController>,
        sfu: Arc<SfuServer>,
        metrics: Arc<MetricsRegistry>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            mesh,
            abr,
            sfu,
            metrics,
            bus,
            retry: RetryPolicy::default(),
            breakers: PeerBreakers::new(),
        })
    }

    // ── Stream lifecycle ────────────────────────────────────────────────

    /// Create a stream with a generated id and the default quality ladder.
    pub async fn create_stream(
        &self,
        name: &str,
        owner_peer_id: &str,
        owner_user_id: &str,
        max_peers: Option<usize>,
    ) -> Result<Stream, Error> {
        let active = self.store.list_active_streams().await?;
        if active.len() >= self.config.max_streams {
            return Err(Error::Conflict(format!(
                "stream limit reached ({})",
                self.config.max_streams
            )));
        }

        let stream = Stream::new(
            name,
            owner_peer_id,
            owner_user_id,
            max_peers.unwrap_or(self.config.default_max_peers),
        )?;
        self.store.create_stream(&stream).await?;
        self.bus.emit(MeshcastEvent::stream_created(&stream.id));
        info!(stream_id = %stream.id, name, "stream created");
        Ok(stream)
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<Stream, Error> {
        self.store.get_stream(stream_id).await
    }

    pub async fn list_streams(&self) -> Result<Vec<Stream>, Error> {
        self.store.list_active_streams().await
    }

    /// Tear a stream down: every peer leaves, the record is deleted.
    pub async fn delete_stream(&self, stream_id: &str) -> Result<(), Error> {
        let mut stream = self.store.get_stream(stream_id).await?;
        stream.active = false;
        self.store.update_stream(&stream).await?;

        let peers = self.store.find_by_stream(stream_id).await?;
        for peer in peers {
            if let Err(e) = self.leave(stream_id, &peer.id).await {
                warn!(peer_id = %peer.id, error = %e, "teardown leave failed");
            }
        }

        self.store.delete_stream(stream_id).await?;
        self.metrics.remove_stream(stream_id);
        self.bus.emit(MeshcastEvent::stream_ended(stream_id));
        info!(stream_id, "stream deleted");
        Ok(())
    }

    // ── Peer lifecycle ──────────────────────────────────────────────────

    /// Admit a peer into a stream: capacity check, persist, wire the
    /// overlay, start ABR monitoring.
    pub async fn join(
        &self,
        stream_id: &str,
        peer_id: &str,
        capabilities: PeerCapabilities,
    ) -> Result<Peer, Error> {
        let stream = self.store.get_stream(stream_id).await?;
        if !stream.active {
            return Err(Error::Conflict(format!(
                "stream '{stream_id}' is not active"
            )));
        }
        if self.store.count_peers(stream_id).await? >= stream.max_peers {
            return Err(Error::Conflict(format!("stream '{stream_id}' is full")));
        }

        let peer = Peer::new(peer_id, stream_id, capabilities)?;
        // add_peer persists the record and schedules the rebalance; store
        // hiccups retry under the peer's circuit breaker.
        let breaker = self.breakers.for_peer(peer_id);
        guarded(&breaker, &self.retry, "join", || {
            let mesh = self.mesh.clone();
            let peer = peer.clone();
            async move { mesh.add_peer(peer).await }
        })
        .await?;
        self.abr.start_monitoring(peer_id, Arc::clone(&self.store));
        info!(stream_id, peer_id, "peer joined");
        Ok(peer)
    }

    /// Remove a peer: SFU sessions first, then overlay state and ABR.
    pub async fn leave(&self, stream_id: &str, peer_id: &str) -> Result<(), Error> {
        let peer = self.store.get_peer(peer_id).await?;
        if peer.stream_id != stream_id {
            return Err(Error::InvalidInput(format!(
                "peer '{peer_id}' is not in stream '{stream_id}'"
            )));
        }

        self.sfu.disconnect(peer_id).await;
        let breaker = self.breakers.for_peer(peer_id);
        guarded(&breaker, &self.retry, "leave", || {
            let mesh = self.mesh.clone();
            let peer_id = peer_id.to_string();
            async move { mesh.remove_peer(&peer_id).await }
        })
        .await?;
        self.abr.stop_monitoring(peer_id);
        self.breakers.remove(peer_id);
        info!(stream_id, peer_id, "peer left");
        Ok(())
    }

    // ── Stats ───────────────────────────────────────────────────────────

    /// Compute the aggregate stream view from the peer store.
    pub async fn get_stats(&self, stream_id: &str) -> Result<StreamStats, Error> {
        self.store.get_stream(stream_id).await?;
        let peers = self.store.find_by_stream(stream_id).await?;

        let active_publishers = peers
            .iter()
            .filter(|p| p.capabilities.is_publisher)
            .count();
        let active_subscribers = peers.len() - active_publishers;

        let total_bitrate_kbps: f64 = peers
            .iter()
            .map(|p| {
                if p.metrics.available_bitrate_kbps > 0.0 {
                    p.metrics.available_bitrate_kbps
                } else {
                    p.capabilities.max_bitrate_kbps as f64
                }
            })
            .sum();

        let average_latency_ms = if peers.is_empty() {
            0.0
        } else {
            peers.iter().map(|p| p.metrics.latency_ms).sum::<f64>() / peers.len() as f64
        };

        Ok(StreamStats {
            active_publishers,
            active_subscribers,
            total_bitrate_kbps,
            average_latency_ms,
            health_score: health_score(
                active_publishers,
                active_subscribers,
                total_bitrate_kbps,
                average_latency_ms,
            ),
        })
    }
}

/// Health score: publisher presence, audience size, bitrate (÷100) and a
/// latency tier bonus, clipped to 100.
fn health_score(publishers: usize, subscribers: usize, bitrate_kbps: f64, latency_ms: f64) -> u32 {
    if publishers == 0 && subscribers == 0 {
        return 0;
    }

    let mut score = 0.0;
    if publishers > 0 {
        score += 30.0;
    }
    score += (subscribers as f64 * 5.0).min(30.0);
    score += (bitrate_kbps / 100.0).min(30.0);

    score += if latency_ms < 100.0 {
        30.0
    } else if latency_ms < 300.0 {
        20.0
    } else if latency_ms < 500.0 {
        10.0
    } else {
        0.0
    };

    (score as u32).min(100)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> Arc<StreamService> {
        let config = Arc::new(Config::default());
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let bus = EventBus::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let mesh = MeshEngine::new(store.clone(), config.mesh.clone(), bus.clone());
        let abr = Arc::new(AbrController::new(config.abr.clone(), bus.clone()));
        let sfu = SfuServer::new(config.clone(), store.clone(), bus.clone(), metrics.clone());
        StreamService::new(config, store, mesh, abr, sfu, metrics, bus)
    }

    fn caps(is_publisher: bool, max_bitrate: u32) -> PeerCapabilities {
        PeerCapabilities {
            max_bitrate_kbps: max_bitrate,
            is_publisher,
            ..PeerCapabilities::default()
        }
    }

    #[tokio::test]
    async fn full_join_lifecycle() {
        let svc = service();
        let stream = svc.create_stream("t", "o-1", "u-1", Some(50)).await.unwrap();
        assert_eq!(stream.max_peers, 50);
        assert!(stream.id.starts_with("stream_"));

        svc.join(&stream.id, "pub-1", caps(true, 2500)).await.unwrap();
        svc.join(&stream.id, "sub-1", caps(false, 1000)).await.unwrap();
        svc.join(&stream.id, "sub-2", caps(false, 1500)).await.unwrap();

        let stats = svc.get_stats(&stream.id).await.unwrap();
        assert_eq!(stats.active_publishers, 1);
        assert_eq!(stats.active_subscribers, 2);
        assert!(stats.health_score > 0);

        svc.leave(&stream.id, "pub-1").await.unwrap();
        svc.leave(&stream.id, "sub-1").await.unwrap();
        svc.leave(&stream.id, "sub-2").await.unwrap();

        let stats = svc.get_stats(&stream.id).await.unwrap();
        assert_eq!(stats.active_publishers, 0);
        assert_eq!(stats.active_subscribers, 0);
    }

    #[tokio::test]
    async fn join_enforces_capacity() {
        let svc = service();
        let stream = svc.create_stream("small", "o", "u", Some(2)).await.unwrap();

        svc.join(&stream.id, "a", caps(true, 100)).await.unwrap();
        svc.join(&stream.id, "b", caps(false, 100)).await.unwrap();

        let full = svc.join(&stream.id, "c", caps(false, 100)).await;
        assert!(matches!(full, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn join_requires_active_stream() {
        let svc = service();
        let stream = svc.create_stream("t", "o", "u", None).await.unwrap();

        let mut inactive = stream.clone();
        inactive.active = false;
        svc.store.update_stream(&inactive).await.unwrap();

        assert!(matches!(
            svc.join(&stream.id, "p", caps(false, 100)).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn join_unknown_stream_fails() {
        let svc = service();
        assert!(matches!(
            svc.join("ghost", "p", caps(false, 100)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn leave_validates_membership() {
        let svc = service();
        let s1 = svc.create_stream("one", "o", "u", None).await.unwrap();
        let s2 = svc.create_stream("two", "o", "u", None).await.unwrap();
        svc.join(&s1.id, "p", caps(false, 100)).await.unwrap();

        assert!(matches!(
            svc.leave(&s2.id, "p").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            svc.leave(&s1.id, "ghost").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_stream_tears_down_peers() {
        let svc = service();
        let stream = svc.create_stream("t", "o", "u", None).await.unwrap();
        svc.join(&stream.id, "a", caps(true, 100)).await.unwrap();
        svc.join(&stream.id, "b", caps(false, 100)).await.unwrap();

        svc.delete_stream(&stream.id).await.unwrap();

        assert!(matches!(
            svc.get_stream(&stream.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            svc.store.get_peer("a").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            svc.store.get_peer("b").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stream_limit_is_enforced() {
        let config = Config {
            max_streams: 1,
            ..Config::default()
        };
        let config = Arc::new(config);
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let bus = EventBus::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let mesh = MeshEngine::new(store.clone(), config.mesh.clone(), bus.clone());
        let abr = Arc::new(AbrController::new(config.abr.clone(), bus.clone()));
        let sfu = SfuServer::new(config.clone(), store.clone(), bus.clone(), metrics.clone());
        let svc = StreamService::new(config, store, mesh, abr, sfu, metrics, bus);

        svc.create_stream("one", "o", "u", None).await.unwrap();
        assert!(matches!(
            svc.create_stream("two", "o", "u", None).await,
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn health_score_tiers() {
        assert_eq!(health_score(0, 0, 0.0, 0.0), 0);
        // Publisher + two subscribers + 5000 kbps + sub-100ms latency.
        assert_eq!(health_score(1, 2, 5000.0, 0.0), 100);
        // Latency tiers step the bonus down.
        let fast = health_score(1, 0, 0.0, 50.0);
        let mid = health_score(1, 0, 0.0, 200.0);
        let slow = health_score(1, 0, 0.0, 400.0);
        let bad = health_score(1, 0, 0.0, 900.0);
        assert!(fast > mid && mid > slow && slow > bad);
        assert_eq!(bad, 30);
    }
}
