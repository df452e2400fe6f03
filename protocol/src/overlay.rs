use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::identity::{verify_envelope, PeerIdentity};
use crate::peer::{PeerInfo, PeerRegistry};
use crate::types::*;

const PEER_ID_HEADER: &str = "x-peer-id";
const PUBLIC_KEY_HEADER: &str = "x-peer-key";
const SIGNATURE_HEADER: &str = "x-peer-sig";

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("no peers subscribed to topic '{0}'")]
    NoPeers(String),
    #[error("failed to reach peer at {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("peer at {addr} rejected envelope: HTTP {status}")]
    Rejected { addr: String, status: u16 },
    #[error("malformed acknowledgement from {addr}: {source}")]
    BadAck {
        addr: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("bootstrap at {0} unreachable")]
    BootstrapUnreachable(String),
}

/// A fedmesh overlay node — authenticated peer connections plus
/// topic-scoped publish/subscribe.
///
/// Each overlay node:
/// 1. Serves an HTTP endpoint for receiving signed envelopes
/// 2. Heartbeats: probes every peer, evicts the unresponsive, refreshes
///    the directory from the bootstrap
/// 3. Fans published payloads out to the mesh members of a topic
pub struct Overlay {
    pub config: OverlayConfig,
    identity: Arc<PeerIdentity>,
    pub peers: PeerRegistry,
    topics: RwLock<HashSet<String>>,
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<(PeerId, String)>>>>,
    probe_nonce: AtomicU64,
    http: reqwest::Client,
}

impl Overlay {
    pub fn new(config: OverlayConfig, identity: Arc<PeerIdentity>) -> Arc<Self> {
        let peers = PeerRegistry::new(config.peer_id.clone(), config.peer_timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Arc::new(Self {
            config,
            identity,
            peers,
            topics: RwLock::new(HashSet::new()),
            subscribers: RwLock::new(HashMap::new()),
            probe_nonce: AtomicU64::new(0),
            http,
        })
    }

    /// Serve the overlay endpoint on an already-bound listener. The caller
    /// binds first so ephemeral ports are known before peers are dialed.
    pub async fn serve_on(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
    ) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/overlay", post(overlay_handler))
            .with_state(self);
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Startup dial of the bootstrap node. Bounded retries with exponential
    /// backoff; exhaustion means the process cannot join the network.
    pub async fn bootstrap(&self) -> Result<usize, OverlayError> {
        let addr = match &self.config.bootstrap_addr {
            Some(addr) => addr.clone(),
            None => return Ok(0),
        };

        let mut delay = self.config.dial_backoff_base_secs;
        for attempt in 1..=self.config.startup_dial_attempts {
            match self.sync_with_peer(&addr).await {
                Ok(count) => {
                    tracing::info!(bootstrap = %addr, new_peers = count, "🌱 Joined overlay");
                    return Ok(count);
                }
                Err(e) => {
                    tracing::warn!(
                        bootstrap = %addr,
                        attempt,
                        error = %e,
                        "Bootstrap dial failed"
                    );
                }
            }
            if attempt < self.config.startup_dial_attempts {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(self.config.dial_backoff_cap_secs);
            }
        }
        Err(OverlayError::BootstrapUnreachable(addr))
    }

    /// Dial and handshake with a peer; merges its peer list into ours.
    /// Idempotent — re-dialing a known peer refreshes its record.
    pub async fn connect(&self, addr: &str) -> Result<usize, OverlayError> {
        self.sync_with_peer(addr).await
    }

    /// Send our peer list to a peer and merge theirs.
    async fn sync_with_peer(&self, addr: &str) -> Result<usize, OverlayError> {
        let mut peers = self.peers.announcements().await;
        peers.push(self.local_announcement().await);
        let env = Envelope::PeerSync {
            sender: self.config.peer_id.clone(),
            peers,
        };

        let ack = self.send_envelope(addr, &env).await?;
        let discovered = self.peers.merge_peers(&ack.peers).await;
        self.peers.mark_responsive(&ack.peer_id).await;
        Ok(discovered)
    }

    /// The announcement describing this node right now.
    pub async fn local_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: self.config.peer_id.clone(),
            address: self.config.public_addr.clone(),
            role: self.config.role,
            topics: self.topics.read().await.iter().cloned().collect(),
            account: self.config.account.clone(),
            last_seen: Utc::now(),
        }
    }

    /// Subscribe to a topic. Returns a stream of `(sender, payload)` in
    /// per-sender arrival order. Idempotent: every call yields its own
    /// stream, and the topic is joined at most once.
    pub async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<(PeerId, String)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.write().await.insert(topic.to_string());
        self.subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        self.announce().await;
        tracing::info!(topic, "Subscribed");
        rx
    }

    /// Leave a topic and drop its local subscribers.
    pub async fn unsubscribe(&self, topic: &str) {
        self.topics.write().await.remove(topic);
        self.subscribers.write().await.remove(topic);
        self.announce().await;
        tracing::info!(topic, "Unsubscribed");
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.iter().cloned().collect()
    }

    /// Best-effort broadcast to the mesh members of a topic. Sends are
    /// sequential, so one publisher's messages arrive in order.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<usize, OverlayError> {
        let targets = self.peers.mesh(topic).await;
        if targets.is_empty() {
            return Err(OverlayError::NoPeers(topic.to_string()));
        }

        let env = Envelope::Publish {
            sender: self.config.peer_id.clone(),
            topic: topic.to_string(),
            payload: payload.to_string(),
        };

        let mut delivered = 0;
        for peer in &targets {
            match self.send_envelope(&peer.address, &env).await {
                Ok(_) => {
                    delivered += 1;
                    self.peers.mark_responsive(&peer.peer_id).await;
                }
                Err(e) => {
                    tracing::debug!(peer = %peer.peer_id, error = %e, "Publish delivery failed");
                    self.peers.mark_unresponsive(&peer.peer_id).await;
                }
            }
        }
        tracing::debug!(topic, delivered, targets = targets.len(), "Published");
        Ok(delivered)
    }

    /// The local view of a topic's mesh membership.
    pub async fn mesh(&self, topic: &str) -> Vec<PeerInfo> {
        self.peers.mesh(topic).await
    }

    /// Announce our role and topic memberships to every known peer.
    pub async fn announce(&self) {
        let env = Envelope::AnnounceRole {
            sender: self.config.peer_id.clone(),
            role: self.config.role,
            topics: self.topics.read().await.iter().cloned().collect(),
            account: self.config.account.clone(),
        };
        for peer in self.peers.snapshot().await {
            if let Err(e) = self.send_envelope(&peer.address, &env).await {
                tracing::debug!(peer = %peer.peer_id, error = %e, "Announce failed");
                self.peers.mark_unresponsive(&peer.peer_id).await;
            }
        }
    }

    /// Ask a remote node (normally the bootstrap) for its directory.
    pub async fn query_mesh(&self, addr: &str) -> Result<Vec<PeerAnnouncement>, OverlayError> {
        let env = Envelope::PeerSync {
            sender: self.config.peer_id.clone(),
            peers: vec![self.local_announcement().await],
        };
        let ack = self.send_envelope(addr, &env).await?;
        Ok(ack.peers)
    }

    /// Run the heartbeat loop. Every interval: probe each mesh member
    /// with a signed ping, evict whoever missed, and refresh the
    /// directory from the bootstrap. A peer that dies therefore leaves
    /// every local mesh view within one heartbeat; bootstrap dial
    /// failures retry forever at this cadence.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            for peer in self.peers.snapshot().await {
                match self.probe(&peer.address).await {
                    Ok(_) => self.peers.mark_responsive(&peer.peer_id).await,
                    Err(e) => {
                        let missed = self.peers.mark_unresponsive(&peer.peer_id).await;
                        tracing::debug!(peer = %peer.peer_id, missed, error = %e, "Probe failed");
                    }
                }
            }

            for casualty in self.peers.evict_unresponsive().await {
                let rounds = casualty.round_topics();
                if rounds.is_empty() {
                    tracing::info!(peer = %casualty.peer_id, "💀 Evicted unresponsive peer");
                } else {
                    // An assigned trainer vanishing mid-round surfaces
                    // later as the client's per-chunk timeout.
                    tracing::warn!(
                        peer = %casualty.peer_id,
                        role = %casualty.role,
                        ?rounds,
                        "💀 Evicted unresponsive peer mid-round"
                    );
                }
            }

            if let Some(bootstrap) = &self.config.bootstrap_addr {
                if let Err(e) = self.sync_with_peer(bootstrap).await {
                    tracing::debug!(bootstrap = %bootstrap, error = %e, "Directory refresh failed");
                }
            }

            let peer_count = self.peers.count().await;
            tracing::debug!(peers = peer_count, "Heartbeat complete");
        }
    }

    /// One liveness probe; the signed transport ack is the reply.
    async fn probe(&self, addr: &str) -> Result<OverlayAck, OverlayError> {
        let env = Envelope::Ping {
            sender: self.config.peer_id.clone(),
            nonce: self.probe_nonce.fetch_add(1, Ordering::Relaxed),
        };
        self.send_envelope(addr, &env).await
    }

    /// Addresses this node can be reached at.
    pub fn local_addrs(&self) -> Vec<String> {
        vec![
            self.config.public_addr.clone(),
            self.config.listen_addr.clone(),
        ]
    }

    async fn send_envelope(
        &self,
        addr: &str,
        env: &Envelope,
    ) -> Result<OverlayAck, OverlayError> {
        let body = serde_json::to_vec(env).expect("envelope serialization is infallible");
        let signature = self.identity.sign(&body);

        let url = format!("http://{addr}/overlay");
        let resp = self
            .http
            .post(&url)
            .header(PEER_ID_HEADER, self.config.peer_id.as_str())
            .header(PUBLIC_KEY_HEADER, hex::encode(self.identity.public_key_bytes()))
            .header(SIGNATURE_HEADER, hex::encode(signature))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|source| OverlayError::Dial {
                addr: addr.to_string(),
                source,
            })?;

        if !resp.status().is_success() {
            return Err(OverlayError::Rejected {
                addr: addr.to_string(),
                status: resp.status().as_u16(),
            });
        }

        resp.json::<OverlayAck>()
            .await
            .map_err(|source| OverlayError::BadAck {
                addr: addr.to_string(),
                source,
            })
    }

    /// Handle a verified incoming envelope.
    async fn handle_envelope(&self, env: Envelope) -> OverlayAck {
        match env {
            Envelope::PeerSync { sender, peers } => {
                self.peers.merge_peers(&peers).await;
                self.peers.mark_responsive(&sender).await;

                let mut ours = self.peers.announcements().await;
                ours.push(self.local_announcement().await);
                OverlayAck {
                    peer_id: self.config.peer_id.clone(),
                    peers: ours,
                }
            }

            Envelope::AnnounceRole { sender, role, topics, account } => {
                tracing::debug!(peer = %sender, role = %role, ?topics, "Role announced");
                self.peers.set_role(&sender, role, &topics, account).await;
                self.empty_ack()
            }

            Envelope::Publish { sender, topic, payload } => {
                self.peers.mark_responsive(&sender).await;
                self.deliver(&sender, &topic, payload).await;
                self.empty_ack()
            }

            // Any signed envelope proves liveness; a ping just carries
            // nothing else.
            Envelope::Ping { sender, .. } => {
                self.peers.mark_responsive(&sender).await;
                self.empty_ack()
            }
        }
    }

    /// Fan a published payload out to the local subscribers of a topic.
    async fn deliver(&self, sender: &str, topic: &str, payload: String) {
        if !self.topics.read().await.contains(topic) {
            tracing::debug!(topic, from = %sender, "Dropping payload for unjoined topic");
            return;
        }
        let mut subs = self.subscribers.write().await;
        if let Some(senders) = subs.get_mut(topic) {
            senders.retain(|tx| tx.send((sender.to_string(), payload.clone())).is_ok());
        }
    }

    fn empty_ack(&self) -> OverlayAck {
        OverlayAck {
            peer_id: self.config.peer_id.clone(),
            peers: vec![],
        }
    }
}

async fn overlay_handler(
    State(overlay): State<Arc<Overlay>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OverlayAck>, StatusCode> {
    let peer_id = header_str(&headers, PEER_ID_HEADER).ok_or(StatusCode::UNAUTHORIZED)?;
    let key = header_hex(&headers, PUBLIC_KEY_HEADER).ok_or(StatusCode::UNAUTHORIZED)?;
    let sig = header_hex(&headers, SIGNATURE_HEADER).ok_or(StatusCode::UNAUTHORIZED)?;

    if verify_envelope(peer_id, &key, &sig, &body).is_err() {
        tracing::debug!(peer = %peer_id, "Rejected envelope with bad signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let env: Envelope =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    if env.sender() != peer_id {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(Json(overlay.handle_envelope(env).await))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_hex(headers: &HeaderMap, name: &str) -> Option<Vec<u8>> {
    header_str(headers, name).and_then(|v| hex::decode(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_overlay(role: Role) -> Arc<Overlay> {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(PeerIdentity::load_or_generate(dir.path()).unwrap());
        let config = OverlayConfig {
            peer_id: identity.peer_id().clone(),
            role,
            ..OverlayConfig::default()
        };
        Overlay::new(config, identity)
    }

    #[tokio::test]
    async fn publish_without_mesh_members_fails() {
        let overlay = test_overlay(Role::Client);
        let err = overlay.publish("42", "hello").await.unwrap_err();
        assert!(matches!(err, OverlayError::NoPeers(t) if t == "42"));
    }

    #[tokio::test]
    async fn delivery_reaches_local_subscribers_only_for_joined_topics() {
        let overlay = test_overlay(Role::Trainer);
        let mut rx = overlay.subscribe("7").await;

        overlay.deliver("peer-a", "7", "payload".into()).await;
        overlay.deliver("peer-a", "8", "other".into()).await;

        let (from, payload) = rx.try_recv().unwrap();
        assert_eq!(from, "peer-a");
        assert_eq!(payload, "payload");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_drops_the_stream() {
        let overlay = test_overlay(Role::Trainer);
        let mut rx = overlay.subscribe("7").await;
        overlay.unsubscribe("7").await;
        overlay.deliver("peer-a", "7", "late".into()).await;
        assert!(rx.try_recv().is_err());
        assert!(overlay.topics().await.is_empty());
    }

    #[tokio::test]
    async fn peer_sync_ack_includes_self() {
        let overlay = test_overlay(Role::Bootstrap);
        let ack = overlay
            .handle_envelope(Envelope::PeerSync { sender: "remote".into(), peers: vec![] })
            .await;
        assert!(ack
            .peers
            .iter()
            .any(|p| p.peer_id == overlay.config.peer_id));
    }
}
