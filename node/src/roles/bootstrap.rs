use std::sync::Arc;

use chrono::{DateTime, Utc};
use fedmesh_protocol::Overlay;
use serde_json::json;

use crate::commands::Command;
use crate::roles::{overlay_command, CommandResult, EventReceiver, NodeEvent};

/// The rendezvous point. Holds the peer directory (inside the overlay's
/// registry) and answers admin queries; no training state ever lives here.
pub struct Bootstrap {
    overlay: Arc<Overlay>,
    started_at: DateTime<Utc>,
}

impl Bootstrap {
    pub fn new(overlay: Arc<Overlay>) -> Self {
        Self {
            overlay,
            started_at: Utc::now(),
        }
    }

    pub async fn run(self, mut events: EventReceiver) {
        tracing::info!(peer_id = %self.overlay.config.peer_id, "Bootstrap serving");
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::Command { cmd, reply } => {
                    let _ = reply.send(self.handle_command(cmd).await);
                }
                NodeEvent::Round { from, topic, .. } => {
                    // The bootstrap joins the discovery topic only to be a
                    // mesh member; payloads are directory-irrelevant.
                    tracing::debug!(%from, topic, "Ignoring topic payload");
                }
                NodeEvent::Shutdown => break,
                other => tracing::debug!(?other, "Event not applicable to bootstrap"),
            }
        }
        tracing::info!("Bootstrap drained");
    }

    async fn handle_command(&self, cmd: Command) -> CommandResult {
        if let Some(result) = overlay_command(&self.overlay, &cmd).await {
            return result;
        }
        match cmd {
            Command::Status => Ok(json!({
                "role": "bootstrap",
                "peer_id": self.overlay.config.peer_id,
                "peers": self.overlay.peers.count().await,
                "uptime_secs": (Utc::now() - self.started_at).num_seconds(),
            })),
            other => Err(format!("command not supported for role bootstrap: {other:?}")),
        }
    }
}
