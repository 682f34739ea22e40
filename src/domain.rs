use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Maximum length of stream and peer identifiers.
pub const MAX_ID_LEN: usize = 100;

/// Validate a stream or peer identifier: 1..=100 characters drawn from
/// `[A-Za-z0-9_-]`.
pub fn validate_id(id: &str) -> Result<(), Error> {
    if id.is_empty() {
        return Err(Error::InvalidInput("identifier is empty".into()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "identifier exceeds {MAX_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::InvalidInput(format!(
            "identifier '{id}' contains characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos()
}

/// Generate an opaque stream identifier (`stream_<unix-ns>`).
pub fn generate_stream_id() -> String {
    format!("stream_{}", unix_nanos())
}

/// Generate an opaque session identifier (`session_<unix-ns>`).
pub fn generate_session_id() -> String {
    format!("session_{}", unix_nanos())
}

/// Current unix timestamp in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Quality labels
// ---------------------------------------------------------------------------

/// The three simulcast rungs. Ordering is meaningful: `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Low,
    Medium,
    High,
}

impl QualityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// The next rung up, if any.
    pub fn next_up(&self) -> Option<QualityLabel> {
        match self {
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => None,
        }
    }

    /// The next rung down, if any.
    pub fn next_down(&self) -> Option<QualityLabel> {
        match self {
            Self::High => Some(Self::Medium),
            Self::Medium => Some(Self::Low),
            Self::Low => None,
        }
    }

    /// All labels, best first.
    pub fn descending() -> [QualityLabel; 3] {
        [Self::High, Self::Medium, Self::Low]
    }
}

impl std::fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QualityLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(Error::InvalidInput(format!(
                "'{other}' is not a quality label"
            ))),
        }
    }
}

/// One row of a stream's quality ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityLevel {
    pub label: QualityLabel,
    pub bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
    pub codec: String,
}

/// The default three-rung ladder every stream is created with.
pub fn default_quality_levels() -> Vec<QualityLevel> {
    vec![
        QualityLevel {
            label: QualityLabel::High,
            bitrate_kbps: 2500,
            width: 1280,
            height: 720,
            codec: "VP8".to_string(),
        },
        QualityLevel {
            label: QualityLabel::Medium,
            bitrate_kbps: 1000,
            width: 854,
            height: 480,
            codec: "VP8".to_string(),
        },
        QualityLevel {
            label: QualityLabel::Low,
            bitrate_kbps: 500,
            width: 640,
            height: 360,
            codec: "VP8".to_string(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionRole {
    Owner,
    Moderator,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPermission {
    pub user_id: String,
    pub role: PermissionRole,
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// A live stream: one publisher feeding N viewers over the SFU + mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub name: String,
    pub owner_peer_id: String,
    pub owner_user_id: String,
    pub active: bool,
    /// Unix seconds.
    pub created_at: i64,
    /// 1..=1000.
    pub max_peers: usize,
    pub quality_levels: Vec<QualityLevel>,
    pub permissions: Vec<StreamPermission>,
}

impl Stream {
    /// Create a stream with a generated id, the default quality ladder, and
    /// an owner permission entry.
    pub fn new(
        name: impl Into<String>,
        owner_peer_id: impl Into<String>,
        owner_user_id: impl Into<String>,
        max_peers: usize,
    ) -> Result<Self, Error> {
        if !(1..=1000).contains(&max_peers) {
            return Err(Error::InvalidInput(format!(
                "max_peers must be in 1..=1000, got {max_peers}"
            )));
        }
        let owner_peer_id = owner_peer_id.into();
        validate_id(&owner_peer_id)?;
        let owner_user_id = owner_user_id.into();

        Ok(Stream {
            id: generate_stream_id(),
            name: name.into(),
            owner_peer_id,
            owner_user_id: owner_user_id.clone(),
            active: true,
            created_at: now_secs(),
            max_peers,
            quality_levels: default_quality_levels(),
            permissions: vec![StreamPermission {
                user_id: owner_user_id,
                role: PermissionRole::Owner,
            }],
        })
    }

    /// The ladder row for a given label, if present.
    pub fn quality_level(&self, label: QualityLabel) -> Option<&QualityLevel> {
        self.quality_levels.iter().find(|q| q.label == label)
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// What a peer advertises about itself at join time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    pub max_bitrate_kbps: u32,
    pub codecs: Vec<String>,
    pub is_publisher: bool,
    pub can_relay: bool,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            max_bitrate_kbps: 0,
            codecs: vec!["VP8".to_string(), "opus".to_string()],
            is_publisher: false,
            can_relay: false,
        }
    }
}

/// A timestamped, immutable network measurement for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub bandwidth_down_kbps: f64,
    pub bandwidth_up_kbps: f64,
    /// Fraction in `[0, 1]`.
    pub packet_loss: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub available_bitrate_kbps: f64,
    /// Optional telemetry; 0 when unreported.
    #[serde(default)]
    pub cpu_percent: f64,
    /// Optional telemetry; 0 when unreported.
    #[serde(default)]
    pub memory_percent: f64,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            bandwidth_down_kbps: 0.0,
            bandwidth_up_kbps: 0.0,
            packet_loss: 0.0,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            available_bitrate_kbps: 0.0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            timestamp: 0,
        }
    }
}

/// A participant in exactly one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub session_id: String,
    pub stream_id: String,
    pub capabilities: PeerCapabilities,
    pub metrics: NetworkMetrics,
    /// Unix seconds.
    pub last_seen: i64,
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        stream_id: impl Into<String>,
        capabilities: PeerCapabilities,
    ) -> Result<Self, Error> {
        let id = id.into();
        validate_id(&id)?;
        let stream_id = stream_id.into();
        validate_id(&stream_id)?;
        Ok(Peer {
            id,
            session_id: generate_session_id(),
            stream_id,
            capabilities,
            metrics: NetworkMetrics::default(),
            last_seen: now_secs(),
        })
    }
}

// ---------------------------------------------------------------------------
// Overlay edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDirection {
    Inbound,
    Outbound,
}

/// A directed transport link in the per-stream overlay.
///
/// Keyed uniquely by the ordered pair `(from, to)`. Self-edges are an
/// invariant violation and are rejected at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEdge {
    pub from: String,
    pub to: String,
    pub direction: EdgeDirection,
    /// Quality descriptor label; `"auto"` until the ABR picks one.
    pub quality: String,
    /// Unix seconds.
    pub opened_at: i64,
    pub bitrate_kbps: f64,
}

impl PeerEdge {
    /// Build an engine-initialised edge: `direction = outbound`,
    /// `quality = auto`, bitrate from the source's advertised bandwidth.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        bitrate_kbps: f64,
    ) -> Result<Self, Error> {
        let from = from.into();
        let to = to.into();
        if from == to {
            return Err(Error::Fatal(format!("self-edge on peer '{from}'")));
        }
        validate_id(&from)?;
        validate_id(&to)?;
        Ok(PeerEdge {
            from,
            to,
            direction: EdgeDirection::Outbound,
            quality: "auto".to_string(),
            opened_at: now_secs(),
            bitrate_kbps,
        })
    }

    /// The unique map key for this edge.
    pub fn key(&self) -> (String, String) {
        (self.from.clone(), self.to.clone())
    }

    /// Whether this edge touches the given peer on either end.
    pub fn touches(&self, peer_id: &str) -> bool {
        self.from == peer_id || self.to == peer_id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
