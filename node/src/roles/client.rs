use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fedmesh_protocol::{
    ChunkAssignment, Overlay, PeerId, RoundMessage, TaskId, DISCOVERY_TOPIC,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::commands::{Command, WhitelistOp};
use crate::config::Config;
use crate::ledger::{EventObserver, LedgerClient, LedgerEvent, Task, POLL_INTERVAL};
use crate::roles::{forward_subscription, overlay_command, CommandResult, EventReceiver, EventSender, NodeEvent};
use crate::session::{PlainSession, SessionCipher};
use crate::storage::{is_content_hash, ObjectStore, PRESIGN_TTL};

/// Cap for the Assign retransmission backoff.
const ASSIGN_RETX_CAP_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Advertising,
    Assembling,
    Training,
    Settling,
    Done,
    Aborted,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Advertising => "advertising",
            Phase::Assembling => "assembling",
            Phase::Training => "training",
            Phase::Settling => "settling",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
enum ChunkState {
    Unassigned,
    Assigned { trainer: PeerId },
    Submitted { trainer: PeerId, weights_hash: String },
}

/// One accepted on-chain submission, in observation order.
struct Submission {
    trainer_addr: String,
    weights_hash: String,
}

/// Per-round client state. Exclusively owned by the client event loop.
struct Round {
    task: Task,
    topic: String,
    phase: Phase,
    chunks: BTreeMap<u32, ChunkState>,
    observed: Vec<Submission>,
    /// Submission events already credited: (trainer, hash, remaining_after).
    seen: HashSet<(String, String, u64)>,
    remaining: u64,
    session: Option<Box<dyn SessionCipher>>,
    /// Poller, deadline and retransmit tasks; aborted when the round ends.
    handles: Vec<JoinHandle<()>>,
}

impl Round {
    fn abort_tasks(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    fn all_submitted(&self) -> bool {
        !self.chunks.is_empty()
            && self
                .chunks
                .values()
                .all(|c| matches!(c, ChunkState::Submitted { .. }))
    }
}

/// The client role: originates a round for one funded task and drives it
/// from advertisement to settlement, with the ledger as the source of
/// truth for submissions.
pub struct Client {
    overlay: Arc<Overlay>,
    ledger: Arc<LedgerClient>,
    store: Arc<ObjectStore>,
    config: Arc<Config>,
    events_tx: EventSender,
    round: Option<Round>,
    last_result: Option<Value>,
    started_at: DateTime<Utc>,
}

impl Client {
    pub fn new(
        overlay: Arc<Overlay>,
        ledger: Arc<LedgerClient>,
        store: Arc<ObjectStore>,
        config: Arc<Config>,
        events_tx: EventSender,
    ) -> Self {
        Self {
            overlay,
            ledger,
            store,
            config,
            events_tx,
            round: None,
            last_result: None,
            started_at: Utc::now(),
        }
    }

    pub async fn run(mut self, mut events: EventReceiver) {
        tracing::info!(peer_id = %self.overlay.config.peer_id, "Client ready");
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::Command { cmd, reply } => {
                    let _ = reply.send(self.handle_command(cmd).await);
                }
                NodeEvent::Round { from, topic, raw } => {
                    self.handle_round_message(&from, &topic, &raw).await;
                }
                NodeEvent::Ledger(ledger_event) => {
                    self.handle_ledger_event(ledger_event).await;
                }
                NodeEvent::DeadlineExpired { task_id } => {
                    self.handle_deadline(task_id).await;
                }
                NodeEvent::Shutdown => {
                    self.shutdown().await;
                    break;
                }
                other => tracing::debug!(?other, "Event not applicable to client"),
            }
        }
        tracing::info!("Client drained");
    }

    async fn handle_command(&mut self, cmd: Command) -> CommandResult {
        match cmd {
            Command::Advertize { task_id } => self.advertize(task_id).await,
            Command::Train { task_id, model_hash, manifest_url, session_pub_key } => {
                self.train(task_id, model_hash, manifest_url, session_pub_key).await
            }
            Command::Leave { topic } => self.leave(topic).await,
            Command::Whitelist { op, account } => self.whitelist(op, &account).await,
            Command::Status => Ok(self.status_json().await),
            Command::Join { .. } => {
                Err("command not supported for role client: join".to_string())
            }
            other => match overlay_command(&self.overlay, &other).await {
                Some(result) => result,
                None => Err(format!("command not supported for role client: {other:?}")),
            },
        }
    }

    /// `Idle → Advertising → Assembling`: open the round topic, announce
    /// the task, start observing the ledger.
    async fn advertize(&mut self, task_id: TaskId) -> CommandResult {
        if let Some(round) = &self.round {
            if !matches!(round.phase, Phase::Done | Phase::Aborted) {
                return Err(format!(
                    "round for task {} is {}; one round per client",
                    round.task.task_id, round.phase
                ));
            }
        }

        let mut task = self
            .ledger
            .get_task(task_id)
            .await
            .map_err(|e| e.to_string())?;
        task.task_id = task_id;

        // A vanished task is fatal unless the ledger shows the task
        // completing — then a restarted client can settle from history.
        let mut recovered = Vec::new();
        if !task.exists {
            let mut probe = EventObserver::new(self.ledger.clone(), Some(task_id));
            let history = probe.poll().await.map_err(|e| e.to_string())?;
            let completed = history
                .iter()
                .any(|e| matches!(e, LedgerEvent::TaskCompleted { .. }));
            if !completed {
                return Err(format!("task {task_id} does not exist"));
            }
            recovered = history;
            tracing::info!(task_id, "Task already completed on ledger, recovering");
        }

        let topic = task_id.to_string();
        tracing::info!(task_id, %topic, phase = %Phase::Advertising, "Opening round topic");
        let rx = self.overlay.subscribe(&topic).await;
        forward_subscription(topic.clone(), rx, self.events_tx.clone());

        if let Err(e) = self
            .overlay
            .publish(
                DISCOVERY_TOPIC,
                &to_payload(&RoundMessage::Advertise { task_id }),
            )
            .await
        {
            tracing::warn!(error = %e, "Task advertisement reached no peers");
        }
        self.ledger
            .publish_log(&format!("client: advertising task {task_id}"))
            .await;

        let chunks = (0..task.total_chunks as u32)
            .map(|i| (i, ChunkState::Unassigned))
            .collect();
        let mut round = Round {
            remaining: task.remaining_chunks,
            task,
            topic,
            phase: Phase::Assembling,
            chunks,
            observed: Vec::new(),
            seen: HashSet::new(),
            session: None,
            handles: Vec::new(),
        };
        round.handles.push(self.spawn_poller(task_id));
        if let Some(deadline_secs) = self.config.round_deadline_secs {
            round.handles.push(self.spawn_deadline(task_id, deadline_secs));
        }

        // Replay recovered history in full before any settlement check, so
        // a completed task settles with every submission, not just the first.
        for event in recovered {
            match event {
                LedgerEvent::WeightsSubmitted { trainer, weights_hash, remaining_chunks, .. } => {
                    let key = (trainer.clone(), weights_hash.clone(), remaining_chunks);
                    if round.seen.insert(key) {
                        round.observed.push(Submission {
                            trainer_addr: trainer,
                            weights_hash,
                        });
                    }
                }
                LedgerEvent::TaskCreated { num_chunks, model_url, dataset_url, .. } => {
                    round.task.total_chunks = num_chunks;
                    round.task.model_ref = model_url;
                    round.task.dataset_ref = dataset_url;
                }
                LedgerEvent::TaskCompleted { .. } => round.remaining = 0,
                LedgerEvent::Withdrawn { .. } => {}
            }
        }

        tracing::info!(task_id, phase = %round.phase, "Assembling trainers");
        self.round = Some(round);
        self.maybe_settle().await;

        let Some(round) = self.round.as_ref() else {
            // The history replay settled the round on the spot.
            return Ok(self
                .last_result
                .clone()
                .unwrap_or_else(|| json!({ "task_id": task_id, "phase": "done" })));
        };
        Ok(json!({
            "task_id": task_id,
            "topic": round.topic,
            "phase": round.phase.to_string(),
            "total_chunks": round.task.total_chunks,
            "remaining_chunks": round.remaining,
        }))
    }

    /// `Assembling → Training`: freeze the candidate set, assign chunks
    /// round-robin and publish the assignment message.
    async fn train(
        &mut self,
        task_id: TaskId,
        model_hash: String,
        manifest_url: String,
        session_pub_key: String,
    ) -> CommandResult {
        let (topic, total) = match &self.round {
            Some(round) if round.task.task_id == task_id => {
                if round.phase != Phase::Assembling {
                    return Err(format!("round is {}, expected assembling", round.phase));
                }
                (round.topic.clone(), round.task.total_chunks as u32)
            }
            Some(round) => {
                return Err(format!("active round is for task {}", round.task.task_id))
            }
            None => return Err(format!("task {task_id} has not been advertized")),
        };

        // Freeze the candidate set: declared trainers in the round mesh,
        // already in the deterministic assignment order.
        let trainers: Vec<PeerId> = self
            .overlay
            .peers
            .trainers_in(&topic)
            .await
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        if trainers.is_empty() {
            tracing::warn!(task_id, "No trainers in mesh; staying in assembling");
            return Err("no trainers in mesh".to_string());
        }

        let assignments = assign_round_robin(total, &trainers);

        let session: Box<dyn SessionCipher> = Box::new(PlainSession::new(&session_pub_key));
        let model_url = self.resolve_model_url(&model_hash);
        let assign = RoundMessage::Assign {
            task_id,
            model_url,
            manifest_url,
            session_pub_key: hex::encode(session.public_key_bytes()),
            assignments: assignments.clone(),
        };
        let payload = to_payload(&assign);

        self.overlay
            .publish(&topic, &payload)
            .await
            .map_err(|e| e.to_string())?;

        let retransmit = self.spawn_assign_retransmit(topic, payload);
        if let Some(round) = &mut self.round {
            for a in &assignments {
                round.chunks.insert(
                    a.chunk_idx,
                    ChunkState::Assigned { trainer: a.trainer.clone() },
                );
            }
            round.session = Some(session);
            round.phase = Phase::Training;
            round.handles.push(retransmit);
        }
        tracing::info!(
            task_id,
            trainers = trainers.len(),
            chunks = total,
            phase = %Phase::Training,
            "Assignments distributed"
        );
        self.ledger
            .publish_log(&format!(
                "client: task {task_id} training with {} trainers over {total} chunks",
                trainers.len()
            ))
            .await;

        // Submissions observed before the freeze (client restart mid-round)
        // are credited against the fresh assignment now.
        let replay: Vec<Submission> = self
            .round
            .as_mut()
            .map(|r| std::mem::take(&mut r.observed))
            .unwrap_or_default();
        for submission in replay {
            self.credit(submission).await;
        }
        self.maybe_settle().await;

        Ok(json!({
            "task_id": task_id,
            "trainers": trainers,
            "assignments": assignments
                .iter()
                .map(|a| json!({ "chunk": a.chunk_idx, "trainer": a.trainer }))
                .collect::<Vec<_>>(),
            "phase": self.round.as_ref().map(|r| r.phase.to_string()),
        }))
    }

    /// Manage which trainer accounts the contract accepts submissions
    /// from. A non-whitelisted trainer's submission reverts on-chain.
    async fn whitelist(&self, op: WhitelistOp, account: &str) -> CommandResult {
        match op {
            WhitelistOp::Add => self
                .ledger
                .add_to_whitelist(account)
                .await
                .map(|receipt| json!({ "whitelisted": account, "transaction": receipt.transaction_id }))
                .map_err(|e| e.to_string()),
            WhitelistOp::Remove => self
                .ledger
                .remove_from_whitelist(account)
                .await
                .map(|receipt| json!({ "removed": account, "transaction": receipt.transaction_id }))
                .map_err(|e| e.to_string()),
            WhitelistOp::Check => self
                .ledger
                .is_whitelisted(account)
                .await
                .map(|whitelisted| json!({ "account": account, "whitelisted": whitelisted }))
                .map_err(|e| e.to_string()),
        }
    }

    async fn leave(&mut self, topic: String) -> CommandResult {
        self.overlay.unsubscribe(&topic).await;
        let aborts_round = self
            .round
            .as_ref()
            .map(|r| r.topic == topic && !matches!(r.phase, Phase::Done | Phase::Aborted))
            .unwrap_or(false);
        if aborts_round {
            self.abort_round("round topic left").await;
        }
        Ok(json!({ "left": topic }))
    }

    async fn handle_round_message(&mut self, from: &str, topic: &str, raw: &str) {
        match serde_json::from_str::<RoundMessage>(raw) {
            Ok(RoundMessage::Log { text }) => {
                tracing::info!(%from, topic, "{text}");
            }
            Ok(other) => {
                // The client originates the rest of the round protocol;
                // echoes of our own traffic are expected and idempotent.
                tracing::debug!(%from, topic, msg = ?other, "Ignoring round message");
            }
            Err(_) => {
                tracing::debug!(%from, topic, "Dropping malformed payload");
            }
        }
    }

    async fn handle_ledger_event(&mut self, event: LedgerEvent) {
        let active_task = match &self.round {
            Some(round) if !matches!(round.phase, Phase::Done | Phase::Aborted) => {
                round.task.task_id
            }
            _ => return,
        };
        if event.task_id() != Some(active_task) {
            return;
        }

        match event {
            LedgerEvent::WeightsSubmitted {
                trainer,
                weights_hash,
                reward,
                remaining_chunks,
                ..
            } => {
                if let Some(round) = &mut self.round {
                    let key = (trainer.clone(), weights_hash.clone(), remaining_chunks);
                    if !round.seen.insert(key) {
                        return;
                    }
                    // Ledger observation is monotonic in remaining chunks.
                    round.remaining = round.remaining.min(remaining_chunks);
                    tracing::info!(
                        task_id = active_task,
                        trainer = %trainer,
                        reward,
                        remaining = round.remaining,
                        "Weights submitted on-chain"
                    );
                }
                self.credit(Submission { trainer_addr: trainer, weights_hash }).await;
                self.maybe_settle().await;
            }
            LedgerEvent::TaskCompleted { task_id } => {
                tracing::info!(task_id, "Task completed on-chain");
                if let Some(round) = &mut self.round {
                    round.remaining = 0;
                }
                self.maybe_settle().await;
            }
            LedgerEvent::TaskCreated { num_chunks, model_url, dataset_url, .. } => {
                // Fills in a recovered round that never saw the task struct.
                if let Some(round) = &mut self.round {
                    if round.task.total_chunks == 0 {
                        round.task.total_chunks = num_chunks;
                        round.task.model_ref = model_url;
                        round.task.dataset_ref = dataset_url;
                        round.chunks = (0..num_chunks as u32)
                            .map(|i| (i, ChunkState::Unassigned))
                            .collect();
                    }
                }
            }
            LedgerEvent::Withdrawn { who, amount } => {
                tracing::debug!(%who, amount, "Withdrawal observed");
            }
        }
    }

    /// Attribute one on-chain submission to its trainer's earliest
    /// still-assigned chunk (first-wins) and echo a SubmitAck.
    async fn credit(&mut self, submission: Submission) {
        let Some(round) = &mut self.round else { return };
        if round.phase != Phase::Training {
            // Not yet assigned: remember for replay after `train`.
            round.observed.push(submission);
            return;
        }

        let peer = self
            .overlay
            .peers
            .find_by_account(&submission.trainer_addr)
            .await;
        let Some(peer) = peer else {
            tracing::debug!(
                trainer = %submission.trainer_addr,
                "Submission from account with no mesh binding"
            );
            round.observed.push(submission);
            return;
        };

        let chunk_idx = round.chunks.iter().find_map(|(idx, state)| match state {
            ChunkState::Assigned { trainer } if *trainer == peer.peer_id => Some(*idx),
            _ => None,
        });
        let Some(chunk_idx) = chunk_idx else {
            tracing::debug!(trainer = %peer.peer_id, "No assigned chunk left to credit");
            return;
        };

        round.chunks.insert(
            chunk_idx,
            ChunkState::Submitted {
                trainer: peer.peer_id.clone(),
                weights_hash: submission.weights_hash.clone(),
            },
        );
        let ack = RoundMessage::SubmitAck {
            task_id: round.task.task_id,
            chunk_idx,
            trainer: peer.peer_id.clone(),
            weights_hash: submission.weights_hash,
        };
        let topic = round.topic.clone();
        if let Err(e) = self.overlay.publish(&topic, &to_payload(&ack)).await {
            tracing::debug!(error = %e, "SubmitAck reached no peers");
        }
    }

    /// `Training → Settling → Done` once the ledger says the task is done.
    async fn maybe_settle(&mut self) {
        let done = match &self.round {
            Some(round) => {
                !matches!(round.phase, Phase::Done | Phase::Aborted)
                    && (round.remaining == 0 || round.all_submitted())
            }
            None => false,
        };
        if !done {
            return;
        }

        let Some(mut round) = self.round.take() else { return };
        round.phase = Phase::Settling;
        let task_id = round.task.task_id;
        tracing::info!(task_id, phase = %round.phase, "Collecting weights");

        let mut weights = Vec::new();
        let submitted: Vec<(u32, String, String)> = round
            .chunks
            .iter()
            .filter_map(|(idx, state)| match state {
                ChunkState::Submitted { trainer, weights_hash } => {
                    Some((*idx, trainer.clone(), weights_hash.clone()))
                }
                _ => None,
            })
            .collect();

        if !submitted.is_empty() {
            for (chunk, trainer, hash) in submitted {
                weights.push(json!({
                    "chunk": chunk,
                    "trainer": trainer,
                    "weights_hash": hash,
                    "url": self.fresh_url(&hash),
                }));
            }
        } else {
            // Recovered round with no assignment of our own: expose the
            // chain's submissions in observation order.
            for (i, submission) in round.observed.iter().enumerate() {
                weights.push(json!({
                    "chunk": i,
                    "trainer_account": submission.trainer_addr,
                    "weights_hash": submission.weights_hash,
                    "url": self.fresh_url(&submission.weights_hash),
                }));
            }
        }

        round.abort_tasks();
        self.overlay.unsubscribe(&round.topic).await;
        round.phase = Phase::Done;
        tracing::info!(task_id, weights = weights.len(), phase = %round.phase, "Round complete");
        self.ledger
            .publish_log(&format!("client: task {task_id} complete, {} weights", weights.len()))
            .await;

        self.last_result = Some(json!({
            "task_id": task_id,
            "status": "done",
            "weights": weights,
        }));
    }

    async fn handle_deadline(&mut self, task_id: TaskId) {
        let applies = self
            .round
            .as_ref()
            .map(|r| r.task.task_id == task_id && !matches!(r.phase, Phase::Done | Phase::Aborted))
            .unwrap_or(false);
        if applies {
            self.abort_round("round deadline elapsed").await;
        }
    }

    /// `Any state → Aborted`. Funds stay under contract rules.
    async fn abort_round(&mut self, reason: &str) {
        let Some(mut round) = self.round.take() else { return };
        let task_id = round.task.task_id;
        round.abort_tasks();
        round.phase = Phase::Aborted;

        let pending: Vec<Value> = round
            .chunks
            .iter()
            .filter_map(|(idx, state)| match state {
                ChunkState::Assigned { trainer } => {
                    Some(json!({ "chunk": idx, "trainer": trainer, "state": "timed_out" }))
                }
                ChunkState::Unassigned => Some(json!({ "chunk": idx, "state": "unassigned" })),
                ChunkState::Submitted { .. } => None,
            })
            .collect();

        tracing::error!(task_id, reason, pending = pending.len(), phase = %round.phase, "Round aborted");
        self.ledger
            .publish_log(&format!("client: task {task_id} aborted: {reason}"))
            .await;
        self.overlay.unsubscribe(&round.topic).await;

        self.last_result = Some(json!({
            "task_id": task_id,
            "status": "aborted",
            "reason": reason,
            "pending_chunks": pending,
        }));
    }

    async fn shutdown(&mut self) {
        if self.round.is_some() {
            self.abort_round("client shutting down").await;
        }
    }

    fn spawn_poller(&self, task_id: TaskId) -> JoinHandle<()> {
        let mut observer = EventObserver::new(self.ledger.clone(), Some(task_id));
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match observer.poll().await {
                    Ok(ledger_events) => {
                        for event in ledger_events {
                            if events.send(NodeEvent::Ledger(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(task_id, error = %e, "Ledger poll failed"),
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
    }

    fn spawn_deadline(&self, task_id: TaskId, deadline_secs: u64) -> JoinHandle<()> {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(deadline_secs)).await;
            let _ = events.send(NodeEvent::DeadlineExpired { task_id });
        })
    }

    /// Re-emit the assignment with exponential backoff until the round
    /// task is aborted. Trainers treat identical retransmissions as no-ops.
    fn spawn_assign_retransmit(&self, topic: String, payload: String) -> JoinHandle<()> {
        let overlay = self.overlay.clone();
        tokio::spawn(async move {
            let mut delay = 1u64;
            loop {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(ASSIGN_RETX_CAP_SECS);
                if let Err(e) = overlay.publish(&topic, &payload).await {
                    tracing::debug!(topic, error = %e, "Assign retransmit failed");
                }
            }
        })
    }

    fn resolve_model_url(&self, model_hash: &str) -> String {
        if !is_content_hash(model_hash) {
            // The UI may hand over a ready-made URL instead of a hash.
            return model_hash.to_string();
        }
        match self.store.presign_get(model_hash, PRESIGN_TTL) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Model presign failed, falling back to raw URL");
                self.store.raw_url(model_hash)
            }
        }
    }

    fn fresh_url(&self, hash: &str) -> String {
        match self.store.presign_get(hash, PRESIGN_TTL) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Presign failed, falling back to raw URL");
                self.store.raw_url(hash)
            }
        }
    }

    async fn status_json(&self) -> Value {
        let round = match &self.round {
            Some(round) => json!({
                "task_id": round.task.task_id,
                "topic": round.topic,
                "phase": round.phase.to_string(),
                "total_chunks": round.task.total_chunks,
                "remaining_chunks": round.remaining,
                "session_pub_key": round
                    .session
                    .as_ref()
                    .map(|s| hex::encode(s.public_key_bytes())),
                "chunks": round
                    .chunks
                    .iter()
                    .map(|(idx, state)| {
                        let state = match state {
                            ChunkState::Unassigned => json!({ "state": "unassigned" }),
                            ChunkState::Assigned { trainer } => {
                                json!({ "state": "assigned", "trainer": trainer })
                            }
                            ChunkState::Submitted { trainer, weights_hash } => json!({
                                "state": "submitted",
                                "trainer": trainer,
                                "weights_hash": weights_hash,
                            }),
                        };
                        json!({ "chunk": idx, "detail": state })
                    })
                    .collect::<Vec<_>>(),
            }),
            None => Value::Null,
        };

        json!({
            "role": "client",
            "peer_id": self.overlay.config.peer_id,
            "operator": self.ledger.operator_account(),
            "uptime_secs": (Utc::now() - self.started_at).num_seconds(),
            "round": round,
            "last_result": self.last_result,
        })
    }
}

fn to_payload(msg: &RoundMessage) -> String {
    serde_json::to_string(msg).expect("round message serialization is infallible")
}

/// Deterministic work distribution: chunks `[0..total)` dealt round-robin
/// to the frozen trainer set in ascending peer-id order.
fn assign_round_robin(total_chunks: u32, trainers: &[PeerId]) -> Vec<ChunkAssignment> {
    (0..total_chunks)
        .map(|chunk_idx| ChunkAssignment {
            chunk_idx,
            trainer: trainers[chunk_idx as usize % trainers.len()].clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fedmesh_protocol::{PeerAnnouncement, PeerIdentity, Role};
    use tokio::sync::mpsc;

    use crate::config::{LedgerSettings, NodeRole, StoreSettings};
    use crate::ledger::account_to_evm_address;
    use crate::roles::EventReceiver;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            role: NodeRole::Client,
            http_port: 9001,
            overlay_port: 0,
            node_ip: "127.0.0.1".into(),
            is_cloud: false,
            bootstrap_addr: None,
            config_dir: std::path::PathBuf::from(".fedmesh"),
            ledger: None,
            store: None,
            round_deadline_secs: None,
            chunk_bytes: 50 * 1024,
            model_runner: "python3".into(),
            train_timeout_secs: 5,
        })
    }

    fn test_client() -> (Client, EventReceiver) {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(PeerIdentity::load_or_generate(dir.path()).unwrap());
        let overlay = Overlay::new(
            fedmesh_protocol::OverlayConfig {
                peer_id: identity.peer_id().clone(),
                role: Role::Client,
                ..fedmesh_protocol::OverlayConfig::default()
            },
            identity,
        );
        let ledger = Arc::new(
            LedgerClient::new(&LedgerSettings {
                operator_id: "0.0.2002".into(),
                operator_key: format!("{:064x}", 7),
                contract_id: "0.0.5005".into(),
                topic_id: None,
                gateway_url: "http://127.0.0.1:1".into(),
                mirror_url: "http://127.0.0.1:1".into(),
            })
            .unwrap(),
        );
        let store = Arc::new(
            ObjectStore::new(&StoreSettings {
                access_key: "ak".into(),
                secret_key: "sk".into(),
                endpoint: "http://127.0.0.1:1".into(),
                bucket: "bucket".into(),
            })
            .unwrap(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Client::new(overlay, ledger, store, test_config(), events_tx),
            events_rx,
        )
    }

    fn training_round(task_id: TaskId, chunks: &[(u32, &str)]) -> Round {
        Round {
            task: Task {
                task_id,
                depositor: "0xdead".into(),
                model_ref: "model".into(),
                dataset_ref: "dataset".into(),
                total_chunks: chunks.len() as u64,
                remaining_chunks: chunks.len() as u64,
                per_chunk_reward: 10_000_000,
                exists: true,
            },
            topic: task_id.to_string(),
            phase: Phase::Training,
            chunks: chunks
                .iter()
                .map(|(idx, trainer)| {
                    (*idx, ChunkState::Assigned { trainer: trainer.to_string() })
                })
                .collect::<BTreeMap<_, _>>(),
            observed: Vec::new(),
            seen: HashSet::new(),
            remaining: chunks.len() as u64,
            session: None,
            handles: Vec::new(),
        }
    }

    async fn bind_trainer(client: &Client, peer_id: &str, account: &str, topic: &str) {
        client
            .overlay
            .peers
            .merge_peer(&PeerAnnouncement {
                peer_id: peer_id.into(),
                address: "127.0.0.1:1".into(),
                role: Role::Trainer,
                topics: vec![topic.into()],
                account: Some(account.into()),
                last_seen: Utc::now(),
            })
            .await;
    }

    fn submitted_chunks(client: &Client) -> Vec<(u32, String)> {
        client
            .round
            .as_ref()
            .map(|round| {
                round
                    .chunks
                    .iter()
                    .filter_map(|(idx, state)| match state {
                        ChunkState::Submitted { weights_hash, .. } => {
                            Some((*idx, weights_hash.clone()))
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn round_robin_covers_every_chunk_exactly_once() {
        let trainers: Vec<PeerId> = vec!["a".into(), "b".into(), "c".into()];
        let assignments = assign_round_robin(3, &trainers);
        assert_eq!(assignments.len(), 3);
        for (i, a) in assignments.iter().enumerate() {
            assert_eq!(a.chunk_idx, i as u32);
            assert_eq!(a.trainer, trainers[i]);
        }
    }

    #[test]
    fn round_robin_with_fewer_trainers_than_chunks() {
        let trainers: Vec<PeerId> = vec!["a".into(), "b".into()];
        let assignments = assign_round_robin(5, &trainers);
        let a_count = assignments.iter().filter(|a| a.trainer == "a").count();
        let b_count = assignments.iter().filter(|a| a.trainer == "b").count();
        // At most ceil(5/2) per trainer, every chunk assigned once.
        assert_eq!(a_count, 3);
        assert_eq!(b_count, 2);
        let mut seen = HashSet::new();
        assert!(assignments.iter().all(|a| seen.insert(a.chunk_idx)));
    }

    #[test]
    fn single_trainer_takes_every_chunk() {
        let trainers: Vec<PeerId> = vec!["only".into()];
        let assignments = assign_round_robin(3, &trainers);
        assert!(assignments.iter().all(|a| a.trainer == "only"));
    }

    #[tokio::test]
    async fn submissions_credit_chunks_first_wins() {
        let (mut client, _rx) = test_client();
        let account = account_to_evm_address("0.0.1001").unwrap();
        bind_trainer(&client, "trainer-a", &account, "4").await;
        client.round = Some(training_round(4, &[(0, "trainer-a"), (1, "trainer-a")]));

        client
            .credit(Submission { trainer_addr: account.clone(), weights_hash: "h1".into() })
            .await;
        client
            .credit(Submission { trainer_addr: account.clone(), weights_hash: "h2".into() })
            .await;
        assert_eq!(
            submitted_chunks(&client),
            vec![(0, "h1".to_string()), (1, "h2".to_string())]
        );

        // Nothing left to credit: the extra submission is ignored.
        client
            .credit(Submission { trainer_addr: account, weights_hash: "h3".into() })
            .await;
        assert_eq!(submitted_chunks(&client).len(), 2);
    }

    #[tokio::test]
    async fn replayed_ledger_observation_does_not_double_credit() {
        let (mut client, _rx) = test_client();
        let account = account_to_evm_address("0.0.1001").unwrap();
        bind_trainer(&client, "trainer-a", &account, "4").await;
        client.round = Some(training_round(4, &[(0, "trainer-a"), (1, "trainer-a")]));

        let event = LedgerEvent::WeightsSubmitted {
            task_id: 4,
            trainer: account,
            weights_hash: "h1".into(),
            reward: 10_000_000,
            remaining_chunks: 1,
        };
        client.handle_ledger_event(event.clone()).await;
        client.handle_ledger_event(event).await;

        assert_eq!(submitted_chunks(&client), vec![(0, "h1".to_string())]);
    }

    #[tokio::test]
    async fn round_settles_when_remaining_reaches_zero() {
        let (mut client, _rx) = test_client();
        let account = account_to_evm_address("0.0.1001").unwrap();
        bind_trainer(&client, "trainer-a", &account, "4").await;
        client.round = Some(training_round(4, &[(0, "trainer-a"), (1, "trainer-a")]));

        client
            .handle_ledger_event(LedgerEvent::WeightsSubmitted {
                task_id: 4,
                trainer: account.clone(),
                weights_hash: "a".repeat(64),
                reward: 10_000_000,
                remaining_chunks: 1,
            })
            .await;
        assert!(client.round.is_some());

        client
            .handle_ledger_event(LedgerEvent::WeightsSubmitted {
                task_id: 4,
                trainer: account,
                weights_hash: "b".repeat(64),
                reward: 10_000_000,
                remaining_chunks: 0,
            })
            .await;

        assert!(client.round.is_none());
        let result = client.last_result.expect("round result exposed");
        assert_eq!(result["status"], "done");
        assert_eq!(result["weights"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn events_for_other_tasks_are_ignored() {
        let (mut client, _rx) = test_client();
        let account = account_to_evm_address("0.0.1001").unwrap();
        bind_trainer(&client, "trainer-a", &account, "4").await;
        client.round = Some(training_round(4, &[(0, "trainer-a")]));

        client
            .handle_ledger_event(LedgerEvent::WeightsSubmitted {
                task_id: 9,
                trainer: account,
                weights_hash: "h1".into(),
                reward: 1,
                remaining_chunks: 0,
            })
            .await;
        assert!(client.round.is_some());
        assert!(submitted_chunks(&client).is_empty());
    }

    #[tokio::test]
    async fn deadline_aborts_and_reports_pending_chunks() {
        let (mut client, _rx) = test_client();
        client.round = Some(training_round(4, &[(0, "trainer-a"), (1, "trainer-b")]));

        client.handle_deadline(4).await;
        assert!(client.round.is_none());
        let result = client.last_result.expect("abort result exposed");
        assert_eq!(result["status"], "aborted");
        assert_eq!(result["pending_chunks"].as_array().unwrap().len(), 2);
    }
}
