use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use fedmesh_protocol::{Overlay, RoundMessage, TaskId};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tokio::task::JoinHandle;

use crate::commands::Command;
use crate::config::Config;
use crate::ledger::LedgerClient;
use crate::roles::{forward_subscription, overlay_command, CommandResult, EventReceiver, EventSender, NodeEvent};
use crate::storage::{content_hash, ObjectStore};

/// Grace period for the model process to exit after closing stdout.
const EXIT_GRACE: Duration = Duration::from_secs(30);

/// Per-topic participation state.
struct JoinedRound {
    task_id: Option<TaskId>,
    /// Hash of the accepted Assign payload; identical retransmissions
    /// are no-ops, conflicting ones are ignored (first wins).
    assign_fingerprint: Option<String>,
    processed: HashSet<u32>,
    pending: Vec<u32>,
    worker: Option<JoinHandle<()>>,
}

impl JoinedRound {
    fn new() -> Self {
        Self {
            task_id: None,
            assign_fingerprint: None,
            processed: HashSet::new(),
            pending: Vec::new(),
            worker: None,
        }
    }
}

/// The trainer role: joins advertised rounds, works its assigned chunks
/// sequentially and anchors each result on the ledger.
pub struct Trainer {
    overlay: Arc<Overlay>,
    ledger: Arc<LedgerClient>,
    store: Arc<ObjectStore>,
    config: Arc<Config>,
    events_tx: EventSender,
    rounds: HashMap<String, JoinedRound>,
    started_at: DateTime<Utc>,
}

impl Trainer {
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
            rounds: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    pub async fn run(mut self, mut events: EventReceiver) {
        tracing::info!(peer_id = %self.overlay.config.peer_id, "Trainer idle");
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::Command { cmd, reply } => {
                    let _ = reply.send(self.handle_command(cmd).await);
                }
                NodeEvent::Round { from, topic, raw } => {
                    self.handle_round_message(&from, &topic, &raw).await;
                }
                NodeEvent::ChunkDone { topic, chunk_idx, weights_hash } => {
                    if let Some(round) = self.rounds.get_mut(&topic) {
                        round.processed.insert(chunk_idx);
                        round.pending.retain(|c| *c != chunk_idx);
                        tracing::info!(%topic, chunk_idx, %weights_hash, "Chunk submitted");
                    }
                }
                NodeEvent::WorkFinished { topic } => {
                    self.finish_round(&topic).await;
                }
                NodeEvent::WorkFailed { topic, error } => {
                    tracing::error!(%topic, %error, "Chunk work failed");
                    if let Some(round) = self.rounds.get_mut(&topic) {
                        // Let a retransmitted Assign restart the leftovers.
                        round.assign_fingerprint = None;
                        round.worker = None;
                    }
                }
                NodeEvent::Shutdown => {
                    self.shutdown().await;
                    break;
                }
                other => tracing::debug!(?other, "Event not applicable to trainer"),
            }
        }
        tracing::info!("Trainer drained");
    }

    async fn handle_command(&mut self, cmd: Command) -> CommandResult {
        match cmd {
            Command::Join { topic } => self.join(topic).await,
            Command::Leave { topic } => self.leave(topic).await,
            Command::Status => Ok(self.status_json()),
            Command::Advertize { .. } | Command::Train { .. } => {
                Err("command not supported for role trainer".to_string())
            }
            other => match overlay_command(&self.overlay, &other).await {
                Some(result) => result,
                None => Err(format!("command not supported for role trainer: {other:?}")),
            },
        }
    }

    /// `Idle → Joined`: subscribe to a round topic and announce.
    async fn join(&mut self, topic: String) -> CommandResult {
        if self.rounds.contains_key(&topic) {
            return Ok(json!({ "joined": topic, "already": true }));
        }
        // A non-whitelisted account would only find out at submission
        // time, when the contract reverts; warn up front instead.
        match self.ledger.is_whitelisted(self.ledger.operator_account()).await {
            Ok(false) => tracing::warn!(
                account = %self.ledger.operator_account(),
                "Operator account is not whitelisted; submissions will revert"
            ),
            Ok(true) => {}
            Err(e) => tracing::debug!(error = %e, "Whitelist check unavailable"),
        }

        let rx = self.overlay.subscribe(&topic).await;
        forward_subscription(topic.clone(), rx, self.events_tx.clone());
        self.rounds.insert(topic.clone(), JoinedRound::new());
        self.ledger
            .publish_log(&format!("trainer: joined round topic {topic}"))
            .await;
        Ok(json!({ "joined": topic }))
    }

    async fn leave(&mut self, topic: String) -> CommandResult {
        if let Some(round) = self.rounds.remove(&topic) {
            if let Some(worker) = round.worker {
                worker.abort();
            }
        }
        self.overlay.unsubscribe(&topic).await;
        Ok(json!({ "left": topic }))
    }

    async fn handle_round_message(&mut self, from: &str, topic: &str, raw: &str) {
        let message = match serde_json::from_str::<RoundMessage>(raw) {
            Ok(message) => message,
            Err(_) => {
                tracing::debug!(%from, topic, "Dropping malformed payload");
                return;
            }
        };

        match message {
            RoundMessage::Advertise { task_id } => {
                tracing::info!(%from, task_id, "Task advertised; join with `join {task_id}`");
            }
            RoundMessage::Assign {
                task_id,
                model_url,
                manifest_url,
                assignments,
                ..
            } => {
                let Some(round) = self.rounds.get_mut(topic) else {
                    tracing::debug!(topic, "Assignment for a topic we never joined");
                    return;
                };

                let fingerprint = content_hash(raw.as_bytes());
                match &round.assign_fingerprint {
                    Some(seen) if *seen == fingerprint => {
                        tracing::debug!(topic, "Assign retransmission, no-op");
                        return;
                    }
                    Some(_) => {
                        tracing::warn!(topic, "Conflicting assignment ignored");
                        return;
                    }
                    None => {}
                }

                let me = &self.overlay.config.peer_id;
                let mut my_chunks: Vec<u32> = assignments
                    .iter()
                    .filter(|a| a.trainer == *me)
                    .map(|a| a.chunk_idx)
                    .filter(|c| !round.processed.contains(c))
                    .collect();
                my_chunks.sort_unstable();
                my_chunks.dedup();

                round.assign_fingerprint = Some(fingerprint);
                round.task_id = Some(task_id);
                if my_chunks.is_empty() {
                    tracing::info!(topic, task_id, "No chunks assigned to this trainer");
                    return;
                }
                round.pending = my_chunks.clone();

                tracing::info!(topic, task_id, chunks = ?my_chunks, "Starting chunk work");
                let work = ChunkWork {
                    overlay: self.overlay.clone(),
                    ledger: self.ledger.clone(),
                    store: self.store.clone(),
                    events: self.events_tx.clone(),
                    topic: topic.to_string(),
                    task_id,
                    model_url,
                    manifest_url,
                    chunks: my_chunks,
                    runner: self.config.model_runner.clone(),
                    timeout: Duration::from_secs(self.config.train_timeout_secs),
                };
                round.worker = Some(tokio::spawn(work.run()));
            }
            RoundMessage::SubmitAck { chunk_idx, trainer, .. } => {
                if trainer == self.overlay.config.peer_id {
                    if let Some(round) = self.rounds.get_mut(topic) {
                        round.processed.insert(chunk_idx);
                        round.pending.retain(|c| *c != chunk_idx);
                    }
                    tracing::debug!(topic, chunk_idx, "Own submission acknowledged");
                }
            }
            RoundMessage::Log { text } => {
                tracing::info!(%from, topic, "{text}");
            }
        }
    }

    /// `Submitted → Idle` for one topic: all assigned chunks are on-chain.
    async fn finish_round(&mut self, topic: &str) {
        if self.rounds.remove(topic).is_none() {
            return;
        }
        self.overlay.unsubscribe(topic).await;
        self.ledger
            .publish_log(&format!("trainer: finished round topic {topic}"))
            .await;
        tracing::info!(topic, "All assigned chunks submitted, back to idle");
    }

    /// Graceful drain: in-flight submissions must complete so trainer
    /// payouts are preserved.
    async fn shutdown(&mut self) {
        for (topic, round) in self.rounds.drain() {
            if let Some(worker) = round.worker {
                tracing::info!(%topic, "Waiting for in-flight chunk work");
                let _ = tokio::time::timeout(EXIT_GRACE, worker).await;
            }
        }
    }

    fn status_json(&self) -> serde_json::Value {
        let rounds: Vec<_> = self
            .rounds
            .iter()
            .map(|(topic, round)| {
                json!({
                    "topic": topic,
                    "task_id": round.task_id,
                    "processed": round.processed.iter().collect::<Vec<_>>(),
                    "pending": round.pending,
                })
            })
            .collect();
        json!({
            "role": "trainer",
            "peer_id": self.overlay.config.peer_id,
            "operator": self.ledger.operator_account(),
            "uptime_secs": (Utc::now() - self.started_at).num_seconds(),
            "rounds": rounds,
        })
    }
}

/// One round's worth of sequential chunk work for this trainer.
struct ChunkWork {
    overlay: Arc<Overlay>,
    ledger: Arc<LedgerClient>,
    store: Arc<ObjectStore>,
    events: EventSender,
    topic: String,
    task_id: TaskId,
    model_url: String,
    manifest_url: String,
    chunks: Vec<u32>,
    runner: String,
    timeout: Duration,
}

impl ChunkWork {
    async fn run(self) {
        match self.run_inner().await {
            Ok(()) => {
                let _ = self.events.send(NodeEvent::WorkFinished { topic: self.topic.clone() });
            }
            Err(e) => {
                let _ = self.events.send(NodeEvent::WorkFailed {
                    topic: self.topic.clone(),
                    error: format!("{e:#}"),
                });
            }
        }
    }

    async fn run_inner(&self) -> anyhow::Result<()> {
        let manifest = self
            .store
            .download(&self.manifest_url)
            .await
            .context("manifest download failed")?;
        let manifest = String::from_utf8(manifest).context("manifest is not utf-8")?;
        let chunk_urls: Vec<&str> = manifest.trim().split(',').collect();

        let model = self
            .store
            .download(&self.model_url)
            .await
            .context("model download failed")?;

        for &chunk_idx in &self.chunks {
            let url = chunk_urls.get(chunk_idx as usize).ok_or_else(|| {
                anyhow::anyhow!(
                    "manifest has {} entries but chunk {chunk_idx} was assigned",
                    chunk_urls.len()
                )
            })?;
            self.train_on_chunk(chunk_idx, url, &model).await?;
        }
        Ok(())
    }

    /// `Working → Submitted` for one chunk: fetch data, execute the model
    /// artifact, upload the weights and anchor the hash on-chain.
    async fn train_on_chunk(
        &self,
        chunk_idx: u32,
        chunk_url: &str,
        model: &[u8],
    ) -> anyhow::Result<()> {
        let dataset = self
            .store
            .download(chunk_url)
            .await
            .with_context(|| format!("chunk {chunk_idx} download failed"))?;

        let dir = std::env::temp_dir();
        let dataset_path = dir.join(format!("fedmesh_dataset_{}_{chunk_idx}.csv", self.task_id));
        let model_path = dir.join(format!("fedmesh_model_{}.py", self.task_id));
        tokio::fs::write(&dataset_path, &dataset).await?;
        tokio::fs::write(&model_path, model).await?;

        let result = run_model(&self.runner, &model_path, &dataset_path, self.timeout).await;

        let _ = tokio::fs::remove_file(&dataset_path).await;
        let _ = tokio::fs::remove_file(&model_path).await;
        let weights = result?;

        let weights_hash = self
            .store
            .upload(weights)
            .await
            .context("weights upload failed")?;

        self.ledger
            .submit_weights(self.task_id, &weights_hash)
            .await
            .with_context(|| format!("chunk {chunk_idx} submission rejected"))?;

        tracing::info!(
            task_id = self.task_id,
            chunk_idx,
            %weights_hash,
            "Weights anchored on ledger"
        );
        let log = RoundMessage::Log {
            text: format!(
                "trainer: task {} chunk {chunk_idx} submitted ({weights_hash})",
                self.task_id
            ),
        };
        if let Ok(payload) = serde_json::to_string(&log) {
            if let Err(e) = self.overlay.publish(&self.topic, &payload).await {
                tracing::debug!(error = %e, "Submission log reached no peers");
            }
        }
        self.ledger
            .publish_log(&format!(
                "trainer: task {} chunk {chunk_idx} weights {weights_hash}",
                self.task_id
            ))
            .await;

        let _ = self.events.send(NodeEvent::ChunkDone {
            topic: self.topic.clone(),
            chunk_idx,
            weights_hash,
        });
        Ok(())
    }
}

/// Execute the opaque model artifact on one dataset chunk. The weights
/// are whatever the process writes to stdout.
async fn run_model(
    runner: &str,
    model_path: &Path,
    dataset_path: &Path,
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let mut child = ProcessCommand::new(runner)
        .arg(model_path)
        .env("DATASET_PATH", dataset_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn model runner '{runner}'"))?;

    let stdout = child.stdout.take().context("model stdout unavailable")?;
    let stderr = child.stderr.take().context("model stderr unavailable")?;

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("model stderr: {line}");
            tail.push(line);
        }
        tail
    });

    let mut weights = Vec::new();
    let mut reader = BufReader::new(stdout);
    match tokio::time::timeout(timeout, reader.read_to_end(&mut weights)).await {
        Ok(read) => {
            read.context("reading model output failed")?;
        }
        Err(_) => {
            let _ = child.kill().await;
            let _ = stderr_task.await;
            anyhow::bail!("model execution timed out after {}s", timeout.as_secs());
        }
    }

    let status = tokio::select! {
        status = child.wait() => status.context("model process lost")?,
        _ = tokio::time::sleep(EXIT_GRACE) => {
            let _ = child.kill().await;
            let _ = stderr_task.await;
            anyhow::bail!("model did not exit after closing stdout");
        }
    };

    let stderr_tail = stderr_task.await.unwrap_or_default();
    if !status.success() {
        let tail: Vec<_> = stderr_tail.iter().rev().take(5).rev().cloned().collect();
        anyhow::bail!("model exited with {status}: {}", tail.join(" | "));
    }
    if weights.is_empty() {
        anyhow::bail!("model produced no weights on stdout");
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    use fedmesh_protocol::{ChunkAssignment, Overlay, OverlayConfig, PeerIdentity, Role};
    use tokio::sync::mpsc;

    use crate::config::{LedgerSettings, NodeRole, StoreSettings};
    use crate::roles::EventReceiver;

    fn test_trainer() -> (Trainer, EventReceiver) {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(PeerIdentity::load_or_generate(dir.path()).unwrap());
        let overlay = Overlay::new(
            OverlayConfig {
                peer_id: identity.peer_id().clone(),
                role: Role::Trainer,
                ..OverlayConfig::default()
            },
            identity,
        );
        let ledger = Arc::new(
            LedgerClient::new(&LedgerSettings {
                operator_id: "0.0.1001".into(),
                operator_key: format!("{:064x}", 3),
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
        let config = Arc::new(Config {
            role: NodeRole::Trainer,
            http_port: 9002,
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
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Trainer::new(overlay, ledger, store, config, events_tx),
            events_rx,
        )
    }

    fn assign_payload(trainer: &str, task_id: TaskId, chunks: &[u32]) -> String {
        serde_json::to_string(&RoundMessage::Assign {
            task_id,
            model_url: "http://127.0.0.1:1/model".into(),
            manifest_url: "http://127.0.0.1:1/manifest".into(),
            session_pub_key: "00".into(),
            assignments: chunks
                .iter()
                .map(|c| ChunkAssignment { chunk_idx: *c, trainer: trainer.into() })
                .collect(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn retransmitted_assign_is_a_no_op() {
        let (mut trainer, _rx) = test_trainer();
        trainer.rounds.insert("4".into(), JoinedRound::new());

        let me = trainer.overlay.config.peer_id.clone();
        let raw = assign_payload(&me, 4, &[0, 1]);
        trainer.handle_round_message("client", "4", &raw).await;

        let round = trainer.rounds.get("4").unwrap();
        assert_eq!(round.task_id, Some(4));
        assert_eq!(round.pending, vec![0, 1]);
        let fingerprint = round.assign_fingerprint.clone();

        // Byte-identical retransmission leaves the round untouched.
        trainer.handle_round_message("client", "4", &raw).await;
        let round = trainer.rounds.get("4").unwrap();
        assert_eq!(round.assign_fingerprint, fingerprint);
        assert_eq!(round.pending, vec![0, 1]);
    }

    #[tokio::test]
    async fn conflicting_assign_is_ignored_first_wins() {
        let (mut trainer, _rx) = test_trainer();
        trainer.rounds.insert("4".into(), JoinedRound::new());

        let me = trainer.overlay.config.peer_id.clone();
        let first = assign_payload(&me, 4, &[0]);
        trainer.handle_round_message("client", "4", &first).await;
        let fingerprint = trainer.rounds.get("4").unwrap().assign_fingerprint.clone();

        let second = assign_payload(&me, 4, &[0, 1, 2]);
        trainer.handle_round_message("client", "4", &second).await;
        let round = trainer.rounds.get("4").unwrap();
        assert_eq!(round.assign_fingerprint, fingerprint);
        assert_eq!(round.pending, vec![0]);
    }

    #[tokio::test]
    async fn assignments_for_other_trainers_leave_us_idle() {
        let (mut trainer, _rx) = test_trainer();
        trainer.rounds.insert("4".into(), JoinedRound::new());

        let raw = assign_payload("someone-else", 4, &[0, 1]);
        trainer.handle_round_message("client", "4", &raw).await;

        let round = trainer.rounds.get("4").unwrap();
        assert!(round.pending.is_empty());
        assert!(round.worker.is_none());
        // The assignment itself was still accepted as this round's work list.
        assert!(round.assign_fingerprint.is_some());
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let (mut trainer, _rx) = test_trainer();
        trainer.rounds.insert("4".into(), JoinedRound::new());
        trainer.handle_round_message("client", "4", "{not json").await;
        trainer
            .handle_round_message("client", "4", r#"{"type":"Gradient","task_id":4}"#)
            .await;
        assert!(trainer.rounds.get("4").unwrap().assign_fingerprint.is_none());
    }

    #[tokio::test]
    async fn own_submit_ack_marks_chunk_processed() {
        let (mut trainer, _rx) = test_trainer();
        trainer.rounds.insert("4".into(), JoinedRound::new());

        let me = trainer.overlay.config.peer_id.clone();
        let ack = serde_json::to_string(&RoundMessage::SubmitAck {
            task_id: 4,
            chunk_idx: 1,
            trainer: me,
            weights_hash: "ab".repeat(32),
        })
        .unwrap();
        trainer.handle_round_message("client", "4", &ack).await;
        assert!(trainer.rounds.get("4").unwrap().processed.contains(&1));
    }
}
