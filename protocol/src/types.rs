use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique peer identifier: hex sha256 of the peer's public key, truncated.
pub type PeerId = String;

/// Task identifier assigned by the ledger contract.
pub type TaskId = u64;

/// The well-known discovery topic every node joins at startup.
pub const DISCOVERY_TOPIC: &str = "fed-learn";

/// The role a node declares to the network. One role per node lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Bootstrap,
    Client,
    Trainer,
    /// Connected but not yet announced.
    Unknown,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Bootstrap => write!(f, "bootstrap"),
            Role::Client => write!(f, "client"),
            Role::Trainer => write!(f, "trainer"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// Announcement of a peer's existence, role and topic memberships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: PeerId,
    /// The address where this peer's overlay endpoint lives.
    pub address: String,
    pub role: Role,
    /// Topics the peer is currently subscribed to.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Ledger account address the peer submits transactions from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// An overlay envelope exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// "Here are the peers I know about"
    PeerSync {
        sender: PeerId,
        peers: Vec<PeerAnnouncement>,
    },
    /// "This is who I am and what I'm subscribed to"
    AnnounceRole {
        sender: PeerId,
        role: Role,
        topics: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<String>,
    },
    /// Topic-scoped application payload. Opaque to the overlay.
    Publish {
        sender: PeerId,
        topic: String,
        payload: String,
    },
    /// Liveness probe sent every heartbeat; the signed transport
    /// acknowledgement is the reply.
    Ping { sender: PeerId, nonce: u64 },
}

impl Envelope {
    pub fn sender(&self) -> &PeerId {
        match self {
            Envelope::PeerSync { sender, .. }
            | Envelope::AnnounceRole { sender, .. }
            | Envelope::Publish { sender, .. }
            | Envelope::Ping { sender, .. } => sender,
        }
    }
}

/// Response to an overlay envelope: the responder's view of the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayAck {
    pub peer_id: PeerId,
    pub peers: Vec<PeerAnnouncement>,
}

/// A single chunk assignment within a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAssignment {
    pub chunk_idx: u32,
    pub trainer: PeerId,
}

/// Application messages carried on top of `Envelope::Publish`.
///
/// Receivers key round messages on `(type, task_id, chunk_idx?, trainer?)`
/// and process each key at most once; unknown tags fail to parse and are
/// dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoundMessage {
    /// A client opened the round topic for a funded task.
    Advertise { task_id: TaskId },
    /// The full work distribution for a round. The only message whose
    /// absence stalls the round; retransmissions carry identical contents.
    Assign {
        task_id: TaskId,
        model_url: String,
        manifest_url: String,
        session_pub_key: String,
        assignments: Vec<ChunkAssignment>,
    },
    /// Client echo of an observed on-chain weights submission.
    SubmitAck {
        task_id: TaskId,
        chunk_idx: u32,
        trainer: PeerId,
        weights_hash: String,
    },
    /// Operator observability; also mirrored to the external log topic.
    Log { text: String },
}

/// Configuration for an overlay node.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub peer_id: PeerId,
    /// Address this node listens on for overlay traffic (e.g. "0.0.0.0:7400").
    pub listen_addr: String,
    /// Address other nodes can reach us at (e.g. "203.0.113.9:7400").
    pub public_addr: String,
    pub role: Role,
    /// Ledger account address included in announcements, if the role has one.
    pub account: Option<String>,
    /// Bootstrap overlay address; `None` only for the bootstrap itself.
    pub bootstrap_addr: Option<String>,
    /// How often to heartbeat (probe peers, evict, refresh the directory).
    pub heartbeat_interval_secs: u64,
    /// Staleness backstop: a peer not seen within this window is evicted
    /// even if it was never probed. One heartbeat interval, so a dead
    /// peer leaves every mesh view within a single heartbeat.
    pub peer_timeout_secs: u64,
    /// Dial retry backoff: base, factor 2, capped.
    pub dial_backoff_base_secs: u64,
    pub dial_backoff_cap_secs: u64,
    /// Attempts before the startup dial of the bootstrap is declared fatal.
    pub startup_dial_attempts: u32,
    /// Timeout applied to every outbound overlay request.
    pub request_timeout_secs: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            listen_addr: "0.0.0.0:7400".into(),
            public_addr: "127.0.0.1:7400".into(),
            role: Role::Unknown,
            account: None,
            bootstrap_addr: None,
            heartbeat_interval_secs: 10,
            peer_timeout_secs: 10,
            dial_backoff_base_secs: 1,
            dial_backoff_cap_secs: 30,
            startup_dial_attempts: 5,
            request_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_message_tags_round_trip() {
        let msg = RoundMessage::Assign {
            task_id: 7,
            model_url: "https://store/model".into(),
            manifest_url: "https://store/manifest".into(),
            session_pub_key: "00ff".into(),
            assignments: vec![ChunkAssignment { chunk_idx: 0, trainer: "abc".into() }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Assign\""));
        let back: RoundMessage = serde_json::from_str(&json).unwrap();
        match back {
            RoundMessage::Assign { task_id, assignments, .. } => {
                assert_eq!(task_id, 7);
                assert_eq!(assignments.len(), 1);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = r#"{"type":"Gradient","task_id":1}"#;
        assert!(serde_json::from_str::<RoundMessage>(raw).is_err());
    }

    #[test]
    fn envelope_sender_is_uniform() {
        let env = Envelope::Ping { sender: "p1".into(), nonce: 9 };
        assert_eq!(env.sender(), "p1");
    }
}
