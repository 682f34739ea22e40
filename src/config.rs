use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `MESHCAST_`.  Defaults are suitable for local development; production
/// deployments MUST override at least `jwt_secret` and the ICE settings.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address of the HTTP control-plane listener.
    pub server_addr: String,
    /// Address of the signaling (WebSocket) listener.
    pub signal_addr: String,
    /// Public hostname advertised in ICE candidates.
    pub public_host: String,

    // ── Auth ─────────────────────────────────────────────────────────────
    pub jwt_secret: String,
    /// When false, signaling still validates origin and peer_id but skips
    /// token verification.
    pub auth_enabled: bool,

    // ── Shared store ─────────────────────────────────────────────────────
    /// Redis URL; unset means the in-memory store.
    pub redis_url: Option<String>,
    /// Identifier for this process in the shared store's instance sets.
    pub instance_id: String,

    // ── ICE ──────────────────────────────────────────────────────────────
    /// STUN server URLs handed to every peer connection.
    pub stun_urls: Vec<String>,
    /// External TURN server URLs (relayed to clients, not used server-side).
    pub turn_urls: Vec<String>,
    pub turn_username: String,
    pub turn_password: String,

    // ── WebRTC UDP port range (for Docker) ─────────────────────────────
    /// Minimum UDP port for WebRTC ICE candidates (0 = OS picks).
    pub udp_port_min: u16,
    /// Maximum UDP port for WebRTC ICE candidates (0 = OS picks).
    pub udp_port_max: u16,

    // ── Limits ───────────────────────────────────────────────────────────
    /// Maximum number of streams that can exist simultaneously.
    pub max_streams: usize,
    /// Default `max_peers` for streams created without an explicit limit.
    pub default_max_peers: usize,

    // ── Subsystems ───────────────────────────────────────────────────────
    pub mesh: MeshSettings,
    pub abr: AbrSettings,
    pub signal: SignalSettings,

    // ── CORS ─────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
}

/// Overlay engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSettings {
    pub min_connections: usize,
    pub max_connections: usize,
    pub max_connections_per_peer: usize,
    pub w_latency: f64,
    pub w_bandwidth: f64,
    pub w_reliability: f64,
    pub rebalance_interval_secs: u64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 4,
            max_connections_per_peer: 8,
            w_latency: 0.4,
            w_bandwidth: 0.4,
            w_reliability: 0.2,
            rebalance_interval_secs: 30,
        }
    }
}

/// Adaptive bitrate controller parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbrSettings {
    pub tick_interval_secs: u64,
    pub dwell_secs: u64,
    pub hysteresis: f64,
    pub history_cap: usize,
}

impl Default for AbrSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            dwell_secs: 10,
            hysteresis: 0.15,
            history_cap: 100,
        }
    }
}

/// Signaling plane quotas. Zero disables the corresponding limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSettings {
    pub max_message_size_bytes: usize,
    pub messages_per_second: f64,
    pub burst: f64,
    pub connects_per_minute_per_ip: u32,
    pub max_connections: usize,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            max_message_size_bytes: 64 * 1024,
            messages_per_second: 20.0,
            burst: 40.0,
            connects_per_minute_per_ip: 30,
            max_connections: 10_000,
            ping_interval_secs: 20,
            pong_timeout_secs: 60,
            shutdown_grace_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let jwt_secret = match std::env::var("MESHCAST_JWT_SECRET") {
            Ok(s) if !s.is_empty() => {
                info!("JWT secret loaded from MESHCAST_JWT_SECRET");
                s
            }
            _ => {
                let secret = uuid::Uuid::new_v4().to_string();
                warn!(
                    "MESHCAST_JWT_SECRET not set — using random value (not suitable for production)"
                );
                secret
            }
        };

        let server_addr = env_or("MESHCAST_SERVER_ADDRESS", "0.0.0.0:8080");
        let signal_addr = env_or("MESHCAST_SIGNAL_ADDRESS", "0.0.0.0:8081");
        let public_host = env_or("MESHCAST_PUBLIC_HOST", "localhost");

        let auth_enabled = env_bool("MESHCAST_AUTH_ENABLED", false);

        let redis_url = std::env::var("MESHCAST_REDIS_URL")
            .ok()
            .filter(|s| !s.is_empty());
        let instance_id = env_or(
            "MESHCAST_INSTANCE_ID",
            &format!("instance_{}", uuid::Uuid::new_v4()),
        );

        let stun_urls = env_csv(
            "MESHCAST_STUN_URLS",
            &["stun:stun.l.google.com:19302"],
        );
        let turn_urls = env_csv("MESHCAST_TURN_URLS", &[]);
        let turn_username = env_or("MESHCAST_TURN_USERNAME", "meshcast");
        let turn_password = env_or("MESHCAST_TURN_PASSWORD", "meshcast-secret");

        let udp_port_min = env_u16("MESHCAST_UDP_PORT_MIN", 0);
        let udp_port_max = env_u16("MESHCAST_UDP_PORT_MAX", 0);

        let max_streams = env_usize("MESHCAST_MAX_STREAMS", 100);
        let default_max_peers = env_usize("MESHCAST_DEFAULT_MAX_PEERS", 100);

        let mesh = MeshSettings {
            min_connections: env_usize("MESHCAST_MESH_MIN_CONNECTIONS", 2),
            max_connections: env_usize("MESHCAST_MESH_MAX_CONNECTIONS", 4),
            max_connections_per_peer: env_usize("MESHCAST_MESH_MAX_CONNECTIONS_PER_PEER", 8),
            w_latency: env_f64("MESHCAST_MESH_W_LATENCY", 0.4),
            w_bandwidth: env_f64("MESHCAST_MESH_W_BANDWIDTH", 0.4),
            w_reliability: env_f64("MESHCAST_MESH_W_RELIABILITY", 0.2),
            rebalance_interval_secs: env_u64("MESHCAST_MESH_REBALANCE_SECS", 30),
        };

        let abr = AbrSettings {
            tick_interval_secs: env_u64("MESHCAST_ABR_TICK_SECS", 5),
            dwell_secs: env_u64("MESHCAST_ABR_DWELL_SECS", 10),
            hysteresis: env_f64("MESHCAST_ABR_HYSTERESIS", 0.15),
            history_cap: env_usize("MESHCAST_ABR_HISTORY_CAP", 100),
        };

        let signal = SignalSettings {
            max_message_size_bytes: env_usize("MESHCAST_SIGNAL_MAX_MESSAGE_BYTES", 64 * 1024),
            messages_per_second: env_f64("MESHCAST_SIGNAL_MESSAGES_PER_SECOND", 20.0),
            burst: env_f64("MESHCAST_SIGNAL_BURST", 40.0),
            connects_per_minute_per_ip: env_u64("MESHCAST_SIGNAL_CONNECTS_PER_MINUTE", 30) as u32,
            max_connections: env_usize("MESHCAST_SIGNAL_MAX_CONNECTIONS", 10_000),
            ping_interval_secs: env_u64("MESHCAST_SIGNAL_PING_SECS", 20),
            pong_timeout_secs: env_u64("MESHCAST_SIGNAL_PONG_TIMEOUT_SECS", 60),
            shutdown_grace_secs: env_u64("MESHCAST_SIGNAL_SHUTDOWN_GRACE_SECS", 10),
        };

        let allowed_origins = env_or("MESHCAST_ALLOWED_ORIGINS", "*");
        let log_level = env_or("MESHCAST_LOG_LEVEL", "info");

        let config = Config {
            server_addr,
            signal_addr,
            public_host,
            jwt_secret,
            auth_enabled,
            redis_url,
            instance_id,
            stun_urls,
            turn_urls,
            turn_username,
            turn_password,
            udp_port_min,
            udp_port_max,
            max_streams,
            default_max_peers,
            mesh,
            abr,
            signal,
            allowed_origins,
            log_level,
        };

        config.log_summary();
        config
    }

    /// Build the list of ICE servers the server-side WebRTC agent should
    /// use.  Only STUN: the SFU has a routable address and never needs a
    /// TURN relay for its own candidates.
    pub fn ice_servers_for_server(&self) -> Vec<IceServerConfig> {
        self.stun_urls
            .iter()
            .map(|url| IceServerConfig {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect()
    }

    /// Build the full ICE server list including TURN, for client-facing
    /// responses.
    pub fn ice_servers_for_client(&self) -> Vec<ClientIceServer> {
        let mut servers: Vec<ClientIceServer> = self
            .ice_servers_for_server()
            .into_iter()
            .map(|s| ClientIceServer {
                urls: s.urls,
                username: s.username,
                credential: s.credential,
            })
            .collect();

        for url in &self.turn_urls {
            servers.push(ClientIceServer {
                urls: vec![url.clone()],
                username: Some(self.turn_username.clone()),
                credential: Some(self.turn_password.clone()),
            });
        }

        servers
    }

    fn log_summary(&self) {
        info!("──── Meshcast Configuration ────");
        info!("  server_addr        : {}", self.server_addr);
        info!("  signal_addr        : {}", self.signal_addr);
        info!("  public_host        : {}", self.public_host);
        info!("  auth_enabled       : {}", self.auth_enabled);
        info!(
            "  store              : {}",
            if self.redis_url.is_some() { "redis" } else { "memory" }
        );
        info!("  instance_id        : {}", self.instance_id);
        info!("  stun_urls          : {:?}", self.stun_urls);
        info!("  turn_urls          : {:?}", self.turn_urls);
        info!("  max_streams        : {}", self.max_streams);
        info!("  default_max_peers  : {}", self.default_max_peers);
        info!(
            "  mesh               : min={} max={} per_peer={} rebalance={}s",
            self.mesh.min_connections,
            self.mesh.max_connections,
            self.mesh.max_connections_per_peer,
            self.mesh.rebalance_interval_secs
        );
        info!(
            "  abr                : tick={}s dwell={}s h={}",
            self.abr.tick_interval_secs, self.abr.dwell_secs, self.abr.hysteresis
        );
        info!(
            "  signal limits      : {}/s burst {} max_conns {}",
            self.signal.messages_per_second, self.signal.burst, self.signal.max_connections
        );
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level          : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

/// A configuration snapshot suitable for tests: fixed secret, no Redis,
/// permissive origins.
#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Config {
            server_addr: "127.0.0.1:0".into(),
            signal_addr: "127.0.0.1:0".into(),
            public_host: "localhost".into(),
            jwt_secret: "test-secret".into(),
            auth_enabled: false,
            redis_url: None,
            instance_id: "instance_test".into(),
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            turn_urls: vec![],
            turn_username: "meshcast".into(),
            turn_password: "meshcast-secret".into(),
            udp_port_min: 0,
            udp_port_max: 0,
            max_streams: 100,
            default_max_peers: 100,
            mesh: MeshSettings::default(),
            abr: AbrSettings::default(),
            signal: SignalSettings::default(),
            allowed_origins: "*".into(),
            log_level: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ICE server configuration types
// ---------------------------------------------------------------------------

/// Internal ICE server representation.
#[derive(Debug, Clone)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// JSON-serialisable ICE server config sent to browser clients.
///
/// Matches the W3C `RTCIceServer` dictionary shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_csv(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
