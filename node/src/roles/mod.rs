//! The three node roles and their event loops.
//!
//! Each role owns its state exclusively: the overlay, the HTTP surface
//! and background pollers never touch it directly, they push `NodeEvent`s
//! into the role's queue and the single consumer task mutates. Command
//! events carry a oneshot for the reply, which also serializes the
//! control surface — one outstanding command at a time.

pub mod bootstrap;
pub mod client;
pub mod trainer;

use std::collections::BTreeMap;
use std::sync::Arc;

use fedmesh_protocol::{Overlay, PeerId, TaskId};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::commands::Command;
use crate::ledger::LedgerEvent;

pub type CommandResult = Result<Value, String>;
pub type EventSender = mpsc::UnboundedSender<NodeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NodeEvent>;

#[derive(Debug)]
pub enum NodeEvent {
    /// A control-surface command awaiting a reply.
    Command {
        cmd: Command,
        reply: oneshot::Sender<CommandResult>,
    },
    /// A payload delivered on a subscribed topic.
    Round {
        from: PeerId,
        topic: String,
        raw: String,
    },
    /// A decoded contract event from the mirror poller.
    Ledger(LedgerEvent),
    /// The round's wall-clock deadline elapsed.
    DeadlineExpired { task_id: TaskId },
    /// Trainer worker progress.
    ChunkDone {
        topic: String,
        chunk_idx: u32,
        weights_hash: String,
    },
    WorkFinished { topic: String },
    WorkFailed { topic: String, error: String },
    /// Graceful drain requested.
    Shutdown,
}

/// Bridge a topic subscription into a role's event queue.
pub fn forward_subscription(
    topic: String,
    mut rx: mpsc::UnboundedReceiver<(PeerId, String)>,
    events: EventSender,
) {
    tokio::spawn(async move {
        while let Some((from, raw)) = rx.recv().await {
            let event = NodeEvent::Round {
                from,
                topic: topic.clone(),
                raw,
            };
            if events.send(event).is_err() {
                break;
            }
        }
    });
}

/// Commands every role answers the same way, straight off the overlay.
/// Returns `None` for commands the caller must handle itself.
pub async fn overlay_command(overlay: &Arc<Overlay>, cmd: &Command) -> Option<CommandResult> {
    match cmd {
        Command::Connect { addr } => Some(
            overlay
                .connect(addr)
                .await
                .map(|new_peers| json!({ "connected": addr, "new_peers": new_peers }))
                .map_err(|e| e.to_string()),
        ),
        Command::Publish { topic, message } => Some(
            overlay
                .publish(topic, message)
                .await
                .map(|delivered| json!({ "delivered": delivered }))
                .map_err(|e| e.to_string()),
        ),
        Command::Mesh => Some(Ok(mesh_snapshot(overlay).await)),
        Command::BootMesh => match &overlay.config.bootstrap_addr {
            Some(addr) => Some(
                overlay
                    .query_mesh(addr)
                    .await
                    .map(|peers| json!({ "peers": peers }))
                    .map_err(|e| e.to_string()),
            ),
            // The bootstrap's own directory is the authoritative view.
            None => Some(Ok(mesh_snapshot(overlay).await)),
        },
        Command::Peers => Some(Ok(json!({ "peers": overlay.peers.announcements().await }))),
        Command::Local => Some(Ok(json!({ "addresses": overlay.local_addrs() }))),
        Command::Topics => Some(Ok(json!({ "topics": overlay.topics().await }))),
        _ => None,
    }
}

/// Topic → member peer ids, including our own memberships.
pub async fn mesh_snapshot(overlay: &Arc<Overlay>) -> Value {
    let mut topics: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for topic in overlay.topics().await {
        topics
            .entry(topic)
            .or_default()
            .push(overlay.config.peer_id.clone());
    }
    for peer in overlay.peers.snapshot().await {
        for topic in &peer.topics {
            topics
                .entry(topic.clone())
                .or_default()
                .push(peer.peer_id.clone());
        }
    }
    for members in topics.values_mut() {
        members.sort();
    }
    json!({ "mesh": topics })
}
