// src/store.rs
//
// Peer / Stream / Edge store.
//
// Two concrete variants behind one enum, chosen by a factory at startup:
//
//   Store::Memory — RwLock'd maps, the default and the fallback.
//   Store::Redis  — shared backing for streams, peers and membership sets,
//                   with per-peer TTLs, per-instance registration sets and
//                   fenced distributed locks. Overlay edges stay in-process
//                   (they describe transport links owned by this instance
//                   and have no persistence layout).
//
// All operations are linearisable per key; `add` fails with Conflict when
// the key is present, `get`/`remove` fail with NotFound otherwise, and
// `find_by_stream` returns an owned snapshot.  No internal lock is ever
// held across network I/O.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{NetworkMetrics, Peer, PeerEdge, Stream};
use crate::error::Error;

/// TTL of a shared peer record; refreshed on heartbeat.
const PEER_TTL_SECS: u64 = 300;
/// TTL of an instance's peer-registration set.
const INSTANCE_TTL_SECS: i64 = 600;
/// TTL of a stream-scoped distributed lock.
const LOCK_TTL_SECS: u64 = 10;
/// How many times a fenced lock acquisition polls before giving up.
const LOCK_ATTEMPTS: u32 = 100;
const LOCK_POLL: Duration = Duration::from_millis(50);

// ─── Store facade ───────────────────────────────────────────────────────────

pub enum Store {
    Memory(MemoryStore),
    Redis(RedisStore),
}

/// Guard for a stream-scoped critical section (rebalances serialise on it).
pub enum StreamLock {
    Local(tokio::sync::OwnedMutexGuard<()>),
    Fenced { key: String, token: String },
}

impl Store {
    /// Factory: Redis when configured and reachable, memory otherwise.
    pub async fn connect(config: &Config) -> Store {
        if let Some(url) = &config.redis_url {
            match RedisStore::connect(url, &config.instance_id).await {
                Ok(store) => {
                    info!(url = %url, "store backend: redis");
                    return Store::Redis(store);
                }
                Err(e) => {
                    warn!(error = %e, "redis unreachable, falling back to in-memory store");
                }
            }
        }
        info!("store backend: memory");
        Store::Memory(MemoryStore::new())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            Store::Redis(_) => "redis",
        }
    }

    /// Liveness probe for `/ready`.
    pub async fn is_healthy(&self) -> bool {
        match self {
            Store::Memory(_) => true,
            Store::Redis(r) => r.ping().await.is_ok(),
        }
    }

    // ── Streams ─────────────────────────────────────────────────────────

    pub async fn create_stream(&self, stream: &Stream) -> Result<(), Error> {
        match self {
            Store::Memory(m) => m.create_stream(stream),
            Store::Redis(r) => r.create_stream(stream).await,
        }
    }

    pub async fn get_stream(&self, id: &str) -> Result<Stream, Error> {
        match self {
            Store::Memory(m) => m.get_stream(id),
            Store::Redis(r) => r.get_stream(id).await,
        }
    }

    pub async fn update_stream(&self, stream: &Stream) -> Result<(), Error> {
        match self {
            Store::Memory(m) => m.update_stream(stream),
            Store::Redis(r) => r.update_stream(stream).await,
        }
    }

    pub async fn delete_stream(&self, id: &str) -> Result<(), Error> {
        match self {
            Store::Memory(m) => m.delete_stream(id),
            Store::Redis(r) => r.delete_stream(id).await,
        }
    }

    pub async fn list_active_streams(&self) -> Result<Vec<Stream>, Error> {
        match self {
            Store::Memory(m) => Ok(m.list_active_streams()),
            Store::Redis(r) => r.list_active_streams().await,
        }
    }

    // ── Peers ───────────────────────────────────────────────────────────

    pub async fn add_peer(&self, peer: &Peer) -> Result<(), Error> {
        match self {
            Store::Memory(m) => m.add_peer(peer),
            Store::Redis(r) => r.add_peer(peer).await,
        }
    }

    pub async fn get_peer(&self, id: &str) -> Result<Peer, Error> {
        match self {
            Store::Memory(m) => m.get_peer(id),
            Store::Redis(r) => r.get_peer(id).await,
        }
    }

    pub async fn update_peer(&self, peer: &Peer) -> Result<(), Error> {
        match self {
            Store::Memory(m) => m.update_peer(peer),
            Store::Redis(r) => r.update_peer(peer).await,
        }
    }

    /// Remove a peer and, first, every edge touching it.
    pub async fn remove_peer(&self, id: &str) -> Result<Peer, Error> {
        match self {
            Store::Memory(m) => m.remove_peer(id),
            Store::Redis(r) => r.remove_peer(id).await,
        }
    }

    pub async fn find_by_stream(&self, stream_id: &str) -> Result<Vec<Peer>, Error> {
        match self {
            Store::Memory(m) => m.find_by_stream(stream_id),
            Store::Redis(r) => r.find_by_stream(stream_id).await,
        }
    }

    pub async fn count_peers(&self, stream_id: &str) -> Result<usize, Error> {
        match self {
            Store::Memory(m) => m.count_peers(stream_id),
            Store::Redis(r) => r.count_peers(stream_id).await,
        }
    }

    /// Apply a metrics sample.  Samples older than the stored one are
    /// dropped so repository state advances in monotonic timestamp order.
    pub async fn update_metrics(&self, peer_id: &str, m: NetworkMetrics) -> Result<(), Error> {
        match self {
            Store::Memory(s) => s.update_metrics(peer_id, m),
            Store::Redis(r) => r.update_metrics(peer_id, m).await,
        }
    }

    /// Refresh `last_seen` (and, on the shared store, the record TTL).
    pub async fn heartbeat(&self, peer_id: &str) -> Result<(), Error> {
        match self {
            Store::Memory(m) => m.heartbeat(peer_id),
            Store::Redis(r) => r.heartbeat(peer_id).await,
        }
    }

    // ── Edges ───────────────────────────────────────────────────────────

    pub async fn add_edge(&self, edge: &PeerEdge) -> Result<(), Error> {
        match self {
            Store::Memory(m) => m.edges.add(edge),
            Store::Redis(r) => r.edges.add(edge),
        }
    }

    pub async fn get_edge(&self, from: &str, to: &str) -> Result<PeerEdge, Error> {
        match self {
            Store::Memory(m) => m.edges.get(from, to),
            Store::Redis(r) => r.edges.get(from, to),
        }
    }

    pub async fn remove_edge(&self, from: &str, to: &str) -> Result<(), Error> {
        match self {
            Store::Memory(m) => m.edges.remove(from, to),
            Store::Redis(r) => r.edges.remove(from, to),
        }
    }

    pub async fn edges_for_peer(&self, peer_id: &str) -> Result<Vec<PeerEdge>, Error> {
        match self {
            Store::Memory(m) => Ok(m.edges.touching(peer_id)),
            Store::Redis(r) => Ok(r.edges.touching(peer_id)),
        }
    }

    /// Remove every edge touching the peer, returning what was removed.
    pub async fn remove_edges_touching(&self, peer_id: &str) -> Result<Vec<PeerEdge>, Error> {
        match self {
            Store::Memory(m) => Ok(m.edges.remove_touching(peer_id)),
            Store::Redis(r) => Ok(r.edges.remove_touching(peer_id)),
        }
    }

    // ── Locks ───────────────────────────────────────────────────────────

    /// Acquire the stream-scoped lock used to serialise rebalances.
    pub async fn lock_stream(&self, stream_id: &str) -> Result<StreamLock, Error> {
        match self {
            Store::Memory(m) => Ok(StreamLock::Local(m.local_lock(stream_id).await)),
            Store::Redis(r) => r.acquire_fenced_lock(&format!("stream:{stream_id}")).await,
        }
    }

    pub async fn unlock_stream(&self, lock: StreamLock) {
        match (self, lock) {
            (_, StreamLock::Local(guard)) => drop(guard),
            (Store::Redis(r), StreamLock::Fenced { key, token }) => {
                r.release_fenced_lock(&key, &token).await;
            }
            // A fenced lock can only have come from the redis variant.
            (Store::Memory(_), StreamLock::Fenced { .. }) => {}
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Unregister every peer attributed to this instance.
    pub async fn shutdown_cleanup(&self) {
        if let Store::Redis(r) = self {
            r.shutdown_cleanup().await;
        }
    }
}

// ─── Edge set (shared by both variants) ─────────────────────────────────────

/// In-process edge set keyed by the ordered pair `(from, to)`.
#[derive(Default)]
pub struct EdgeSet {
    inner: RwLock<HashMap<(String, String), PeerEdge>>,
}

impl EdgeSet {
    fn add(&self, edge: &PeerEdge) -> Result<(), Error> {
        if edge.from == edge.to {
            return Err(Error::Fatal(format!("self-edge on peer '{}'", edge.from)));
        }
        let mut map = self.inner.write().unwrap();
        let key = edge.key();
        if map.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "edge {} -> {} already exists",
                edge.from, edge.to
            )));
        }
        map.insert(key, edge.clone());
        Ok(())
    }

    fn get(&self, from: &str, to: &str) -> Result<PeerEdge, Error> {
        self.inner
            .read()
            .unwrap()
            .get(&(from.to_string(), to.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("edge {from} -> {to}")))
    }

    fn remove(&self, from: &str, to: &str) -> Result<(), Error> {
        self.inner
            .write()
            .unwrap()
            .remove(&(from.to_string(), to.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("edge {from} -> {to}")))
    }

    fn touching(&self, peer_id: &str) -> Vec<PeerEdge> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|e| e.touches(peer_id))
            .cloned()
            .collect()
    }

    fn remove_touching(&self, peer_id: &str) -> Vec<PeerEdge> {
        let mut map = self.inner.write().unwrap();
        let keys: Vec<(String, String)> = map
            .values()
            .filter(|e| e.touches(peer_id))
            .map(PeerEdge::key)
            .collect();
        keys.iter().filter_map(|k| map.remove(k)).collect()
    }
}

// ─── In-memory variant ──────────────────────────────────────────────────────

pub struct MemoryStore {
    streams: RwLock<HashMap<String, Stream>>,
    peers: RwLock<HashMap<String, Peer>>,
    /// stream id → membership set.
    members: RwLock<HashMap<String, HashSet<String>>>,
    edges: EdgeSet,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
            edges: EdgeSet::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn create_stream(&self, stream: &Stream) -> Result<(), Error> {
        let mut map = self.streams.write().unwrap();
        if map.contains_key(&stream.id) {
            return Err(Error::Conflict(format!(
                "stream '{}' already exists",
                stream.id
            )));
        }
        map.insert(stream.id.clone(), stream.clone());
        Ok(())
    }

    fn get_stream(&self, id: &str) -> Result<Stream, Error> {
        self.streams
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("stream '{id}'")))
    }

    fn update_stream(&self, stream: &Stream) -> Result<(), Error> {
        let mut map = self.streams.write().unwrap();
        if !map.contains_key(&stream.id) {
            return Err(Error::NotFound(format!("stream '{}'", stream.id)));
        }
        map.insert(stream.id.clone(), stream.clone());
        Ok(())
    }

    fn delete_stream(&self, id: &str) -> Result<(), Error> {
        let removed = self.streams.write().unwrap().remove(id);
        if removed.is_none() {
            return Err(Error::NotFound(format!("stream '{id}'")));
        }
        self.members.write().unwrap().remove(id);
        Ok(())
    }

    fn list_active_streams(&self) -> Vec<Stream> {
        self.streams
            .read()
            .unwrap()
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    fn add_peer(&self, peer: &Peer) -> Result<(), Error> {
        {
            let mut map = self.peers.write().unwrap();
            if map.contains_key(&peer.id) {
                return Err(Error::Conflict(format!("peer '{}' already exists", peer.id)));
            }
            map.insert(peer.id.clone(), peer.clone());
        }
        self.members
            .write()
            .unwrap()
            .entry(peer.stream_id.clone())
            .or_default()
            .insert(peer.id.clone());
        Ok(())
    }

    fn get_peer(&self, id: &str) -> Result<Peer, Error> {
        self.peers
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("peer '{id}'")))
    }

    fn update_peer(&self, peer: &Peer) -> Result<(), Error> {
        let mut map = self.peers.write().unwrap();
        if !map.contains_key(&peer.id) {
            return Err(Error::NotFound(format!("peer '{}'", peer.id)));
        }
        map.insert(peer.id.clone(), peer.clone());
        Ok(())
    }

    fn remove_peer(&self, id: &str) -> Result<Peer, Error> {
        // Edges first, peer second.
        self.edges.remove_touching(id);
        let peer = self
            .peers
            .write()
            .unwrap()
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("peer '{id}'")))?;
        if let Some(set) = self.members.write().unwrap().get_mut(&peer.stream_id) {
            set.remove(id);
        }
        Ok(peer)
    }

    fn find_by_stream(&self, stream_id: &str) -> Result<Vec<Peer>, Error> {
        let ids: Vec<String> = match self.members.read().unwrap().get(stream_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };
        let peers = self.peers.read().unwrap();
        Ok(ids.iter().filter_map(|id| peers.get(id).cloned()).collect())
    }

    fn count_peers(&self, stream_id: &str) -> Result<usize, Error> {
        Ok(self
            .members
            .read()
            .unwrap()
            .get(stream_id)
            .map(|s| s.len())
            .unwrap_or(0))
    }

    fn update_metrics(&self, peer_id: &str, m: NetworkMetrics) -> Result<(), Error> {
        let mut map = self.peers.write().unwrap();
        let peer = map
            .get_mut(peer_id)
            .ok_or_else(|| Error::NotFound(format!("peer '{peer_id}'")))?;
        if m.timestamp < peer.metrics.timestamp {
            debug!(peer_id, "stale metrics sample dropped");
            return Ok(());
        }
        peer.metrics = m;
        peer.last_seen = crate::domain::now_secs();
        Ok(())
    }

    fn heartbeat(&self, peer_id: &str) -> Result<(), Error> {
        let mut map = self.peers.write().unwrap();
        let peer = map
            .get_mut(peer_id)
            .ok_or_else(|| Error::NotFound(format!("peer '{peer_id}'")))?;
        peer.last_seen = crate::domain::now_secs();
        Ok(())
    }

    async fn local_lock(&self, stream_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(stream_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Redis variant ──────────────────────────────────────────────────────────

/// Shared peer record: the peer plus ownership metadata.
#[derive(Serialize, Deserialize)]
struct PeerRecord {
    peer: Peer,
    instance: String,
    registered_at: i64,
}

pub struct RedisStore {
    conn: ConnectionManager,
    instance_id: String,
    edges: EdgeSet,
}

impl RedisStore {
    pub async fn connect(url: &str, instance_id: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(Error::from)?;
        let conn = client.get_connection_manager().await.map_err(Error::from)?;
        Ok(Self {
            conn,
            instance_id: instance_id.to_string(),
            edges: EdgeSet::default(),
        })
    }

    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(Error::from)
    }

    fn stream_key(id: &str) -> String {
        format!("stream:{id}")
    }

    fn members_key(id: &str) -> String {
        format!("stream:{id}:peers")
    }

    fn peer_key(id: &str) -> String {
        format!("peer:{id}")
    }

    fn instance_key(&self) -> String {
        format!("instance:{}:peers", self.instance_id)
    }

    async fn create_stream(&self, stream: &Stream) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(stream)?;
        let created: bool = conn
            .set_nx(Self::stream_key(&stream.id), json)
            .await
            .map_err(Error::from)?;
        if !created {
            return Err(Error::Conflict(format!(
                "stream '{}' already exists",
                stream.id
            )));
        }
        Ok(())
    }

    async fn get_stream(&self, id: &str) -> Result<Stream, Error> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(Self::stream_key(id)).await.map_err(Error::from)?;
        let json = json.ok_or_else(|| Error::NotFound(format!("stream '{id}'")))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn update_stream(&self, stream: &Stream) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = Self::stream_key(&stream.id);
        let exists: bool = conn.exists(&key).await.map_err(Error::from)?;
        if !exists {
            return Err(Error::NotFound(format!("stream '{}'", stream.id)));
        }
        let json = serde_json::to_string(stream)?;
        let _: () = conn.set(key, json).await.map_err(Error::from)?;
        Ok(())
    }

    async fn delete_stream(&self, id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(Self::stream_key(id)).await.map_err(Error::from)?;
        if removed == 0 {
            return Err(Error::NotFound(format!("stream '{id}'")));
        }
        let _: i64 = conn.del(Self::members_key(id)).await.map_err(Error::from)?;
        Ok(())
    }

    async fn list_active_streams(&self) -> Result<Vec<Stream>, Error> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("stream:*").await.map_err(Error::from)?;
        let mut streams = Vec::new();
        for key in keys.into_iter().filter(|k| !k.ends_with(":peers")) {
            let json: Option<String> = conn.get(&key).await.map_err(Error::from)?;
            if let Some(json) = json {
                match serde_json::from_str::<Stream>(&json) {
                    Ok(s) if s.active => streams.push(s),
                    Ok(_) => {}
                    Err(e) => warn!(key = %key, error = %e, "undecodable stream record skipped"),
                }
            }
        }
        Ok(streams)
    }

    async fn add_peer(&self, peer: &Peer) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let record = PeerRecord {
            peer: peer.clone(),
            instance: self.instance_id.clone(),
            registered_at: crate::domain::now_secs(),
        };
        let json = serde_json::to_string(&record)?;

        let created: bool = redis::cmd("SET")
            .arg(Self::peer_key(&peer.id))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(PEER_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        if !created {
            return Err(Error::Conflict(format!("peer '{}' already exists", peer.id)));
        }

        let _: i64 = conn
            .sadd(Self::members_key(&peer.stream_id), &peer.id)
            .await
            .map_err(Error::from)?;
        let _: i64 = conn
            .sadd(self.instance_key(), &peer.id)
            .await
            .map_err(Error::from)?;
        let _: bool = conn
            .expire(self.instance_key(), INSTANCE_TTL_SECS)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<PeerRecord, Error> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(Self::peer_key(id)).await.map_err(Error::from)?;
        let json = json.ok_or_else(|| Error::NotFound(format!("peer '{id}'")))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn get_peer(&self, id: &str) -> Result<Peer, Error> {
        Ok(self.get_record(id).await?.peer)
    }

    async fn put_record(&self, record: &PeerRecord) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        let _: () = conn
            .set_ex(Self::peer_key(&record.peer.id), json, PEER_TTL_SECS)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn update_peer(&self, peer: &Peer) -> Result<(), Error> {
        let mut record = self.get_record(&peer.id).await?;
        record.peer = peer.clone();
        self.put_record(&record).await
    }

    async fn remove_peer(&self, id: &str) -> Result<Peer, Error> {
        // Edges first, peer second.
        self.edges.remove_touching(id);

        let record = self.get_record(id).await?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(Self::peer_key(id)).await.map_err(Error::from)?;
        let _: i64 = conn
            .srem(Self::members_key(&record.peer.stream_id), id)
            .await
            .map_err(Error::from)?;
        let _: i64 = conn
            .srem(self.instance_key(), id)
            .await
            .map_err(Error::from)?;
        Ok(record.peer)
    }

    async fn find_by_stream(&self, stream_id: &str) -> Result<Vec<Peer>, Error> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(Self::members_key(stream_id))
            .await
            .map_err(Error::from)?;
        let mut peers = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_peer(&id).await {
                Ok(p) => peers.push(p),
                Err(Error::NotFound(_)) => {
                    // TTL-expired record: prune the stale membership entry.
                    let _: i64 = conn
                        .srem(Self::members_key(stream_id), &id)
                        .await
                        .map_err(Error::from)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(peers)
    }

    async fn count_peers(&self, stream_id: &str) -> Result<usize, Error> {
        let mut conn = self.conn.clone();
        let n: usize = conn
            .scard(Self::members_key(stream_id))
            .await
            .map_err(Error::from)?;
        Ok(n)
    }

    async fn update_metrics(&self, peer_id: &str, m: NetworkMetrics) -> Result<(), Error> {
        let mut record = self.get_record(peer_id).await?;
        if m.timestamp < record.peer.metrics.timestamp {
            debug!(peer_id, "stale metrics sample dropped");
            return Ok(());
        }
        record.peer.metrics = m;
        record.peer.last_seen = crate::domain::now_secs();
        self.put_record(&record).await
    }

    async fn heartbeat(&self, peer_id: &str) -> Result<(), Error> {
        let mut record = self.get_record(peer_id).await?;
        record.peer.last_seen = crate::domain::now_secs();
        self.put_record(&record).await
    }

    // ── Fenced locks ────────────────────────────────────────────────────

    async fn acquire_fenced_lock(&self, scope: &str) -> Result<StreamLock, Error> {
        let key = format!("lock:{scope}");
        let token = uuid::Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        for _ in 0..LOCK_ATTEMPTS {
            let acquired: bool = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("EX")
                .arg(LOCK_TTL_SECS)
                .query_async(&mut conn)
                .await
                .map_err(Error::from)?;
            if acquired {
                return Ok(StreamLock::Fenced { key, token });
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
        Err(Error::Transient(format!("could not acquire lock '{key}'")))
    }

    async fn release_fenced_lock(&self, key: &str, token: &str) {
        // Compare-and-delete so an expired lock taken over by another
        // instance is never released from here.
        let script = redis::Script::new(
            r#"
            if redis.call('get', KEYS[1]) == ARGV[1] then
                return redis.call('del', KEYS[1])
            else
                return 0
            end
            "#,
        );
        let mut conn = self.conn.clone();
        if let Err(e) = script
            .key(key)
            .arg(token)
            .invoke_async::<_, i64>(&mut conn)
            .await
        {
            warn!(key, error = %e, "fenced lock release failed");
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    async fn shutdown_cleanup(&self) {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = match conn.smembers(self.instance_key()).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "shutdown cleanup could not list instance peers");
                return;
            }
        };
        info!(count = ids.len(), "unregistering instance peers");
        for id in ids {
            if let Err(e) = self.remove_peer(&id).await {
                debug!(peer_id = %id, error = %e, "shutdown peer cleanup skipped");
            }
        }
        let _: Result<i64, _> = conn.del(self.instance_key()).await;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
