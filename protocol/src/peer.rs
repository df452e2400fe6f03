use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{PeerAnnouncement, PeerId, Role};

/// Consecutive missed probes before a peer is evicted. One, so a dead
/// peer disappears from every mesh view in the heartbeat that probes it.
const MAX_MISSED_PROBES: u32 = 1;

/// A member of the coordination mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub address: String,
    pub role: Role,
    /// Round topics (plus the discovery topic) the peer is subscribed to.
    pub topics: HashSet<String>,
    /// Ledger account the peer submits from; how on-chain submissions
    /// are attributed back to a mesh member.
    pub account: Option<String>,
    pub last_seen: DateTime<Utc>,
    /// Consecutive probe failures since the peer last answered.
    pub missed_probes: u32,
}

impl PeerInfo {
    pub fn to_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: self.peer_id.clone(),
            address: self.address.clone(),
            role: self.role,
            topics: self.topics.iter().cloned().collect(),
            account: self.account.clone(),
            last_seen: self.last_seen,
        }
    }

    /// Round topics this peer participates in, discovery excluded.
    /// What a client loses when the peer is evicted mid-round.
    pub fn round_topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter(|t| *t != crate::types::DISCOVERY_TOPIC)
            .cloned()
            .collect()
    }
}

fn is_stale(last_seen: DateTime<Utc>, window_secs: u64) -> bool {
    Utc::now().signed_duration_since(last_seen).num_seconds() >= window_secs as i64
}

/// The mesh directory: who is here, what role they declared, and which
/// round topics they joined. Membership is probe-driven — the heartbeat
/// marks peers responsive or not, and `evict_unresponsive` removes the
/// casualties in the same pass — so readers never re-check liveness.
///
/// Single writer (the overlay), many readers.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerId, PeerInfo>>>,
    self_id: PeerId,
    staleness_window_secs: u64,
}

impl PeerRegistry {
    pub fn new(self_id: PeerId, staleness_window_secs: u64) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            self_id,
            staleness_window_secs,
        }
    }

    /// Record an announcement. Announcements about ourselves and stale
    /// gossip (older than the staleness window) are rejected, so an
    /// evicted peer cannot be resurrected by a third party relaying its
    /// last words. Returns true when the peer was previously unknown.
    pub async fn merge_peer(&self, announcement: &PeerAnnouncement) -> bool {
        if announcement.peer_id == self.self_id {
            return false;
        }
        if is_stale(announcement.last_seen, self.staleness_window_secs) {
            tracing::debug!(peer = %announcement.peer_id, "Rejecting stale announcement");
            return false;
        }

        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(&announcement.peer_id) {
            // Older than what we already know carries nothing to learn.
            if announcement.last_seen >= entry.last_seen {
                entry.last_seen = announcement.last_seen;
                entry.address = announcement.address.clone();
                entry.topics = announcement.topics.iter().cloned().collect();
                if announcement.role != Role::Unknown {
                    entry.role = announcement.role;
                }
                if announcement.account.is_some() {
                    entry.account = announcement.account.clone();
                }
            }
            return false;
        }

        tracing::info!(
            peer = %announcement.peer_id,
            addr = %announcement.address,
            role = %announcement.role,
            "🌐 Peer joined the coordination mesh"
        );
        peers.insert(
            announcement.peer_id.clone(),
            PeerInfo {
                peer_id: announcement.peer_id.clone(),
                address: announcement.address.clone(),
                role: announcement.role,
                topics: announcement.topics.iter().cloned().collect(),
                account: announcement.account.clone(),
                last_seen: announcement.last_seen,
                missed_probes: 0,
            },
        );
        true
    }

    /// Merge a directory exchange; returns how many peers were new.
    pub async fn merge_peers(&self, announcements: &[PeerAnnouncement]) -> usize {
        let mut discovered = 0;
        for ann in announcements {
            if self.merge_peer(ann).await {
                discovered += 1;
            }
        }
        discovered
    }

    /// Record a direct role announcement from a connected peer.
    pub async fn set_role(
        &self,
        peer_id: &str,
        role: Role,
        topics: &[String],
        account: Option<String>,
    ) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.role = role;
            peer.topics = topics.iter().cloned().collect();
            if account.is_some() {
                peer.account = account;
            }
            peer.last_seen = Utc::now();
            peer.missed_probes = 0;
        }
    }

    /// The peer answered a probe (or sent us anything signed).
    pub async fn mark_responsive(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.last_seen = Utc::now();
            peer.missed_probes = 0;
        }
    }

    /// The peer failed a probe or a delivery; returns the consecutive
    /// miss count feeding the next eviction pass.
    pub async fn mark_unresponsive(&self, peer_id: &str) -> u32 {
        let mut peers = self.peers.write().await;
        match peers.get_mut(peer_id) {
            Some(peer) => {
                peer.missed_probes += 1;
                peer.missed_probes
            }
            None => 0,
        }
    }

    /// Drop every peer that missed a probe or fell past the staleness
    /// window, and hand them back so the caller can report which round
    /// topics just lost a member.
    pub async fn evict_unresponsive(&self) -> Vec<PeerInfo> {
        let mut peers = self.peers.write().await;
        let window = self.staleness_window_secs;
        let casualties: Vec<PeerId> = peers
            .values()
            .filter(|p| p.missed_probes >= MAX_MISSED_PROBES || is_stale(p.last_seen, window))
            .map(|p| p.peer_id.clone())
            .collect();
        casualties
            .iter()
            .filter_map(|id| peers.remove(id))
            .collect()
    }

    /// Every current mesh member. Liveness is already settled by the
    /// eviction pass, so this is just the directory.
    pub async fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// The local mesh view of one topic.
    pub async fn mesh(&self, topic: &str) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.topics.contains(topic))
            .cloned()
            .collect()
    }

    /// The candidate set for a round: declared trainers subscribed to its
    /// topic, in ascending peer-id order so chunk assignment is
    /// deterministic across observers.
    pub async fn trainers_in(&self, topic: &str) -> Vec<PeerInfo> {
        let mut trainers: Vec<PeerInfo> = self
            .mesh(topic)
            .await
            .into_iter()
            .filter(|p| p.role == Role::Trainer)
            .collect();
        trainers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        trainers
    }

    /// Resolve a peer by its ledger account address; how an observed
    /// `WeightsSubmitted` event is credited to an assigned trainer.
    pub async fn find_by_account(&self, account: &str) -> Option<PeerInfo> {
        let needle = account.to_ascii_lowercase();
        let peers = self.peers.read().await;
        peers
            .values()
            .find(|p| {
                p.account
                    .as_deref()
                    .map(|a| a.to_ascii_lowercase() == needle)
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub async fn announcements(&self) -> Vec<PeerAnnouncement> {
        let peers = self.peers.read().await;
        peers.values().map(PeerInfo::to_announcement).collect()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(peer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(id: &str, role: Role, topics: &[&str]) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: id.into(),
            address: format!("127.0.0.1:7{}", id.len()),
            role,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            account: None,
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn merge_ignores_self() {
        let reg = PeerRegistry::new("me".into(), 10);
        assert!(!reg.merge_peer(&ann("me", Role::Trainer, &[])).await);
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test]
    async fn merge_counts_only_new_peers() {
        let reg = PeerRegistry::new("me".into(), 10);
        let batch = vec![
            ann("t1", Role::Trainer, &["4"]),
            ann("t2", Role::Trainer, &[]),
        ];
        assert_eq!(reg.merge_peers(&batch).await, 2);
        assert_eq!(reg.merge_peers(&batch).await, 0);
    }

    #[tokio::test]
    async fn stale_gossip_cannot_resurrect_a_peer() {
        let reg = PeerRegistry::new("me".into(), 10);
        let mut stale = ann("old", Role::Trainer, &["4"]);
        stale.last_seen = Utc::now() - chrono::Duration::seconds(60);
        assert!(!reg.merge_peer(&stale).await);
        assert!(reg.get("old").await.is_none());
    }

    #[tokio::test]
    async fn mesh_and_trainer_candidates_filter_by_topic_and_role() {
        let reg = PeerRegistry::new("me".into(), 10);
        reg.merge_peer(&ann("bbb", Role::Trainer, &["fed-learn", "4"])).await;
        reg.merge_peer(&ann("aaa", Role::Trainer, &["4"])).await;
        reg.merge_peer(&ann("ccc", Role::Client, &["4"])).await;
        reg.merge_peer(&ann("ddd", Role::Trainer, &["fed-learn"])).await;

        assert_eq!(reg.mesh("4").await.len(), 3);

        // Candidates are trainers only, in ascending peer-id order.
        let candidates: Vec<String> = reg
            .trainers_in("4")
            .await
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        assert_eq!(candidates, vec!["aaa".to_string(), "bbb".to_string()]);
    }

    #[tokio::test]
    async fn role_announcement_updates_topics_and_account() {
        let reg = PeerRegistry::new("me".into(), 10);
        reg.merge_peer(&ann("t1", Role::Unknown, &[])).await;
        reg.set_role("t1", Role::Trainer, &["9".to_string()], Some("0xabc".into()))
            .await;

        let peer = reg.get("t1").await.unwrap();
        assert_eq!(peer.role, Role::Trainer);
        assert!(peer.topics.contains("9"));
        assert_eq!(reg.find_by_account("0xABC").await.unwrap().peer_id, "t1");
    }

    #[tokio::test]
    async fn one_missed_probe_evicts_and_reports_round_topics() {
        let reg = PeerRegistry::new("me".into(), 10);
        reg.merge_peer(&ann("t1", Role::Trainer, &["fed-learn", "4"])).await;
        reg.merge_peer(&ann("t2", Role::Trainer, &["fed-learn"])).await;

        assert_eq!(reg.mark_unresponsive("t1").await, 1);
        let evicted = reg.evict_unresponsive().await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].peer_id, "t1");
        assert_eq!(evicted[0].round_topics(), vec!["4".to_string()]);
        assert!(reg.get("t1").await.is_none());
        assert!(reg.get("t2").await.is_some());
    }

    #[tokio::test]
    async fn answering_a_probe_clears_the_miss_count() {
        let reg = PeerRegistry::new("me".into(), 10);
        reg.merge_peer(&ann("t1", Role::Trainer, &["4"])).await;

        reg.mark_unresponsive("t1").await;
        reg.mark_responsive("t1").await;
        assert!(reg.evict_unresponsive().await.is_empty());
        assert_eq!(reg.get("t1").await.unwrap().missed_probes, 0);
    }

    #[tokio::test]
    async fn unprobed_peers_are_still_evicted_past_the_staleness_window() {
        let reg = PeerRegistry::new("me".into(), 10);
        let mut fading = ann("t1", Role::Trainer, &["4"]);
        fading.last_seen = Utc::now() - chrono::Duration::seconds(9);
        reg.merge_peer(&fading).await;

        // Still inside the window: kept.
        assert!(reg.evict_unresponsive().await.is_empty());

        // Age it past the window without any probe result.
        reg.peers.write().await.get_mut("t1").unwrap().last_seen =
            Utc::now() - chrono::Duration::seconds(11);
        let evicted = reg.evict_unresponsive().await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].peer_id, "t1");
    }
}
