//! Ledger adapter.
//!
//! Translates between the coordination plane and the external smart
//! contract. Two HTTP collaborators are involved: the transaction
//! *gateway* executes contract calls and view queries (requests signed
//! with the operator's secp256k1 key) and appends consensus-topic log
//! messages; the read-only *mirror* serves contract event logs, which are
//! decoded against the event ABI here.

pub mod abi;

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, SignOnly};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::LedgerSettings;
use abi::{AbiError, AbiType};

/// Mirror poll cadence for event observation.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Logs re-read per poll; the mirror window is bounded and deduplicated.
const POLL_WINDOW: u32 = 100;

/// Gas budget for `submitWeights`, matching the contract's deployment.
const SUBMIT_GAS: u64 = 10_000_000;
const WHITELIST_GAS: u64 = 100_000;

/// Response codes that must not be retried.
const NON_RETRIABLE: [&str; 3] = [
    "CONTRACT_REVERT_EXECUTED",
    "INVALID_SIGNATURE",
    "PAYER_ACCOUNT_NOT_FOUND",
];

const EXECUTE_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger: {0}")]
    Status(String),
    #[error("ledger: rpc failed: {0}")]
    Rpc(#[from] reqwest::Error),
    #[error("ledger: malformed response: {0}")]
    Decode(String),
    #[error("ledger: {0}")]
    Abi(#[from] AbiError),
    #[error("ledger: invalid operator key")]
    BadOperatorKey,
    #[error("ledger: invalid account id '{0}'")]
    BadAccount(String),
}

impl LedgerError {
    pub fn is_retriable(&self) -> bool {
        match self {
            LedgerError::Status(code) => !NON_RETRIABLE.contains(&code.as_str()),
            LedgerError::Rpc(_) => true,
            _ => false,
        }
    }
}

/// Ledger-side mirror of a funded training task.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: u64,
    pub depositor: String,
    pub model_ref: String,
    pub dataset_ref: String,
    pub total_chunks: u64,
    pub remaining_chunks: u64,
    pub per_chunk_reward: u128,
    pub exists: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Receipt {
    pub status: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// A contract event decoded from a mirror log.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    TaskCreated {
        task_id: u64,
        depositor: String,
        model_url: String,
        dataset_url: String,
        num_chunks: u64,
        total_reward: u128,
    },
    WeightsSubmitted {
        task_id: u64,
        trainer: String,
        weights_hash: String,
        reward: u128,
        remaining_chunks: u64,
    },
    TaskCompleted { task_id: u64 },
    Withdrawn { who: String, amount: u128 },
}

struct EventSignatures {
    task_created: String,
    weights_submitted: String,
    task_completed: String,
    withdrawn: String,
}

fn signatures() -> &'static EventSignatures {
    static SIGS: OnceLock<EventSignatures> = OnceLock::new();
    SIGS.get_or_init(|| EventSignatures {
        task_created: abi::event_signature(
            "TaskCreated(uint256,address,string,string,uint256,uint256)",
        ),
        weights_submitted: abi::event_signature(
            "WeightsSubmitted(uint256,address,string,uint256,uint256)",
        ),
        task_completed: abi::event_signature("TaskCompleted(uint256)"),
        withdrawn: abi::event_signature("Withdrawn(address,uint256)"),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorLog {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct MirrorLogsPage {
    #[serde(default)]
    logs: Vec<MirrorLog>,
}

pub struct LedgerClient {
    http: reqwest::Client,
    gateway_url: String,
    mirror_url: String,
    contract_id: String,
    topic_id: Option<String>,
    operator_id: String,
    secp: Secp256k1<SignOnly>,
    secret: SecretKey,
    public_key_hex: String,
}

impl LedgerClient {
    pub fn new(settings: &LedgerSettings) -> Result<Self, LedgerError> {
        let stripped = settings
            .operator_key
            .strip_prefix("0x")
            .unwrap_or(&settings.operator_key);
        let bytes = hex::decode(stripped).map_err(|_| LedgerError::BadOperatorKey)?;
        let secret =
            SecretKey::from_slice(&bytes).map_err(|_| LedgerError::BadOperatorKey)?;
        let secp = Secp256k1::signing_only();
        let public_key_hex = hex::encode(PublicKey::from_secret_key(&secp, &secret).serialize());

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            gateway_url: settings.gateway_url.trim_end_matches('/').to_string(),
            mirror_url: settings.mirror_url.trim_end_matches('/').to_string(),
            contract_id: settings.contract_id.clone(),
            topic_id: settings.topic_id.clone(),
            operator_id: settings.operator_id.clone(),
            secp,
            secret,
            public_key_hex,
        })
    }

    pub fn operator_account(&self) -> &str {
        &self.operator_id
    }

    /// The EVM form of the operator account, as it appears in indexed
    /// event topics.
    pub fn operator_address(&self) -> Result<String, LedgerError> {
        account_to_evm_address(&self.operator_id)
    }

    /// Startup connectivity probe: the cheapest contract view there is.
    pub async fn probe(&self) -> Result<u64, LedgerError> {
        self.get_task_id().await
    }

    /// Total number of tasks ever created (`getTaskId` view).
    pub async fn get_task_id(&self) -> Result<u64, LedgerError> {
        let result = self.query("getTaskId", vec![]).await?;
        val_u64(&result, 0)
    }

    pub async fn task_exists(&self, task_id: u64) -> Result<bool, LedgerError> {
        let result = self.query("taskExists", vec![uint(task_id)]).await?;
        val_bool(&result, 0)
    }

    /// Read the task struct out of the contract's public `tasks` mapping.
    pub async fn get_task(&self, task_id: u64) -> Result<Task, LedgerError> {
        let result = self.query("tasks", vec![uint(task_id)]).await?;
        Ok(Task {
            task_id,
            depositor: val_str(&result, 0)?,
            model_ref: val_str(&result, 1)?,
            dataset_ref: val_str(&result, 2)?,
            total_chunks: val_u64(&result, 3)?,
            remaining_chunks: val_u64(&result, 4)?,
            per_chunk_reward: val_u128(&result, 5)?,
            exists: val_bool(&result, 6)?,
        })
    }

    /// Submit a trainer's weights hash for one chunk. The contract
    /// decrements the task's remaining chunks and pays the reward.
    pub async fn submit_weights(
        &self,
        task_id: u64,
        weights_hash: &str,
    ) -> Result<Receipt, LedgerError> {
        self.execute(
            "submitWeights",
            vec![uint(task_id), string(weights_hash)],
            SUBMIT_GAS,
        )
        .await
    }

    pub async fn add_to_whitelist(&self, account: &str) -> Result<Receipt, LedgerError> {
        let addr = account_to_evm_address(account)?;
        self.execute("addToWhitelist", vec![address(&addr)], WHITELIST_GAS)
            .await
    }

    pub async fn remove_from_whitelist(&self, account: &str) -> Result<Receipt, LedgerError> {
        let addr = account_to_evm_address(account)?;
        self.execute("removeFromWhitelist", vec![address(&addr)], WHITELIST_GAS)
            .await
    }

    pub async fn is_whitelisted(&self, account: &str) -> Result<bool, LedgerError> {
        let addr = account_to_evm_address(account)?;
        let result = self.query("isWhitelisted", vec![address(&addr)]).await?;
        val_bool(&result, 0)
    }

    /// Append a human-readable message to the consensus log topic.
    /// Best-effort: failures are logged and swallowed.
    pub async fn publish_log(&self, message: &str) {
        let topic_id = match &self.topic_id {
            Some(id) => id.clone(),
            None => return,
        };
        let url = format!("{}/api/v1/topics/{}/messages", self.gateway_url, topic_id);
        let payload = json!({
            "topic_id": topic_id,
            "message": message,
            "operator_id": self.operator_id,
            "nonce": uuid::Uuid::new_v4().to_string(),
        })
        .to_string();
        let body = self.signed_body(&payload);

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "Consensus log append rejected")
            }
            Err(e) => tracing::warn!(error = %e, "Consensus log append failed"),
        }
    }

    /// Read the recent contract log window from the mirror, newest first.
    pub async fn fetch_logs(&self) -> Result<Vec<MirrorLog>, LedgerError> {
        let url = format!(
            "{}/api/v1/contracts/{}/results/logs",
            self.mirror_url, self.contract_id
        );
        let page: MirrorLogsPage = self
            .http
            .get(&url)
            .query(&[("limit", POLL_WINDOW.to_string()), ("order", "desc".into())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page.logs)
    }

    async fn query(&self, function: &str, params: Vec<Value>) -> Result<Vec<Value>, LedgerError> {
        let url = format!(
            "{}/api/v1/contracts/{}/query",
            self.gateway_url, self.contract_id
        );
        let resp: Value = self
            .http
            .post(&url)
            .json(&json!({
                "function": function,
                "params": params,
                "operator_id": self.operator_id,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let status = resp["status"].as_str().unwrap_or("UNKNOWN");
        if status != "SUCCESS" {
            return Err(LedgerError::Status(status.to_string()));
        }
        match resp["result"].as_array() {
            Some(values) => Ok(values.clone()),
            None => Err(LedgerError::Decode(format!("{function}: result missing"))),
        }
    }

    /// Execute a state-changing contract call, retrying transient
    /// failures. Non-retriable response codes abort immediately.
    async fn execute(
        &self,
        function: &str,
        params: Vec<Value>,
        gas: u64,
    ) -> Result<Receipt, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.execute_once(function, &params, gas).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_retriable() && attempt + 1 < EXECUTE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(function, attempt, error = %e, "Ledger call failed, retrying");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_once(
        &self,
        function: &str,
        params: &[Value],
        gas: u64,
    ) -> Result<Receipt, LedgerError> {
        let url = format!(
            "{}/api/v1/contracts/{}/execute",
            self.gateway_url, self.contract_id
        );
        let payload = json!({
            "contract_id": self.contract_id,
            "function": function,
            "params": params,
            "gas": gas,
            "operator_id": self.operator_id,
            "nonce": uuid::Uuid::new_v4().to_string(),
        })
        .to_string();

        let receipt: Receipt = self
            .http
            .post(&url)
            .json(&self.signed_body(&payload))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if receipt.status != "SUCCESS" {
            return Err(LedgerError::Status(receipt.status));
        }
        Ok(receipt)
    }

    /// Wrap a payload with the operator's ECDSA signature over its
    /// sha256 digest. The payload travels as the exact string signed.
    fn signed_body(&self, payload: &str) -> Value {
        let digest: [u8; 32] = Sha256::digest(payload.as_bytes()).into();
        let message = Message::from_digest(digest);
        let signature = self.secp.sign_ecdsa(&message, &self.secret);
        json!({
            "payload": payload,
            "signature": hex::encode(signature.serialize_compact()),
            "public_key": self.public_key_hex,
        })
    }
}

fn uint(v: u64) -> Value {
    json!({ "type": "uint256", "value": v.to_string() })
}

fn string(s: &str) -> Value {
    json!({ "type": "string", "value": s })
}

fn address(addr: &str) -> Value {
    json!({ "type": "address", "value": addr })
}

fn val_str(values: &[Value], idx: usize) -> Result<String, LedgerError> {
    values
        .get(idx)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| LedgerError::Decode(format!("missing string at index {idx}")))
}

fn val_u64(values: &[Value], idx: usize) -> Result<u64, LedgerError> {
    val_u128(values, idx).and_then(|v| {
        u64::try_from(v).map_err(|_| LedgerError::Decode(format!("uint at {idx} overflows u64")))
    })
}

fn val_u128(values: &[Value], idx: usize) -> Result<u128, LedgerError> {
    let value = values
        .get(idx)
        .ok_or_else(|| LedgerError::Decode(format!("missing uint at index {idx}")))?;
    if let Some(n) = value.as_u64() {
        return Ok(n as u128);
    }
    value
        .as_str()
        .and_then(|s| s.parse::<u128>().ok())
        .ok_or_else(|| LedgerError::Decode(format!("uint at {idx} is not a number")))
}

fn val_bool(values: &[Value], idx: usize) -> Result<bool, LedgerError> {
    values
        .get(idx)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| LedgerError::Decode(format!("missing bool at index {idx}")))
}

/// Convert a `shard.realm.num` account id to the EVM address form used
/// in indexed event topics: the last 20 bytes of the big-endian
/// concatenation of the three components. Addresses pass through.
pub fn account_to_evm_address(account: &str) -> Result<String, LedgerError> {
    let stripped = account.strip_prefix("0x").unwrap_or(account);
    if stripped.len() == 40 && stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(format!("0x{}", stripped.to_ascii_lowercase()));
    }

    let parts: Vec<&str> = account.split('.').collect();
    if parts.len() != 3 {
        return Err(LedgerError::BadAccount(account.to_string()));
    }
    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| LedgerError::BadAccount(account.to_string()))
    };
    let (shard, realm, num) = (parse(parts[0])?, parse(parts[1])?, parse(parts[2])?);

    let mut full = Vec::with_capacity(24);
    full.extend_from_slice(&shard.to_be_bytes());
    full.extend_from_slice(&realm.to_be_bytes());
    full.extend_from_slice(&num.to_be_bytes());
    Ok(format!("0x{}", hex::encode(&full[full.len() - 20..])))
}

/// Polls the mirror and turns fresh logs into decoded events, oldest
/// first. Deduplicates by `(transaction_hash, log index)` across polls.
pub struct EventObserver {
    client: std::sync::Arc<LedgerClient>,
    task_id: Option<u64>,
    seen: HashSet<(String, u64)>,
}

impl EventObserver {
    pub fn new(client: std::sync::Arc<LedgerClient>, task_id: Option<u64>) -> Self {
        Self {
            client,
            task_id,
            seen: HashSet::new(),
        }
    }

    pub async fn poll(&mut self) -> Result<Vec<LedgerEvent>, LedgerError> {
        let logs = self.client.fetch_logs().await?;
        Ok(self.sift(logs))
    }

    /// Filter a newest-first log window down to fresh, decodable events
    /// for the observed task, in chronological order.
    fn sift(&mut self, logs: Vec<MirrorLog>) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        for log in logs.into_iter().rev() {
            let key = (log.transaction_hash.clone(), log.index);
            if !self.seen.insert(key) {
                continue;
            }
            let event = match decode_log(&log) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(
                        tx = %log.transaction_hash,
                        at = %log.timestamp,
                        error = %e,
                        "Undecodable log"
                    );
                    continue;
                }
            };
            if let Some(wanted) = self.task_id {
                if event.task_id() != Some(wanted) {
                    continue;
                }
            }
            events.push(event);
        }
        events
    }
}

impl LedgerEvent {
    pub fn task_id(&self) -> Option<u64> {
        match self {
            LedgerEvent::TaskCreated { task_id, .. }
            | LedgerEvent::WeightsSubmitted { task_id, .. }
            | LedgerEvent::TaskCompleted { task_id } => Some(*task_id),
            LedgerEvent::Withdrawn { .. } => None,
        }
    }
}

/// Decode one mirror log against the contract event ABI. Unknown event
/// signatures yield `None` and are skipped.
fn decode_log(log: &MirrorLog) -> Result<Option<LedgerEvent>, LedgerError> {
    let sig = match log.topics.first() {
        Some(sig) => sig.as_str(),
        None => return Ok(None),
    };
    let sigs = signatures();

    let topic_uint = |i: usize| -> Result<u128, LedgerError> {
        let topic = log
            .topics
            .get(i)
            .ok_or_else(|| LedgerError::Decode(format!("missing topic {i}")))?;
        Ok(abi::decode_topic_uint(topic)?)
    };
    let topic_address = |i: usize| -> Result<String, LedgerError> {
        let topic = log
            .topics
            .get(i)
            .ok_or_else(|| LedgerError::Decode(format!("missing topic {i}")))?;
        Ok(abi::decode_topic_address(topic)?)
    };

    if sig == sigs.weights_submitted {
        let data = abi::decode_data(&log.data, &[AbiType::Str, AbiType::Uint, AbiType::Uint])?;
        Ok(Some(LedgerEvent::WeightsSubmitted {
            task_id: topic_uint(1)? as u64,
            trainer: topic_address(2)?,
            weights_hash: data[0].as_str().unwrap_or_default().to_string(),
            reward: data[1].as_uint().unwrap_or_default(),
            remaining_chunks: data[2].as_uint().unwrap_or_default() as u64,
        }))
    } else if sig == sigs.task_created {
        let data = abi::decode_data(
            &log.data,
            &[AbiType::Str, AbiType::Str, AbiType::Uint, AbiType::Uint],
        )?;
        Ok(Some(LedgerEvent::TaskCreated {
            task_id: topic_uint(1)? as u64,
            depositor: topic_address(2)?,
            model_url: data[0].as_str().unwrap_or_default().to_string(),
            dataset_url: data[1].as_str().unwrap_or_default().to_string(),
            num_chunks: data[2].as_uint().unwrap_or_default() as u64,
            total_reward: data[3].as_uint().unwrap_or_default(),
        }))
    } else if sig == sigs.task_completed {
        Ok(Some(LedgerEvent::TaskCompleted {
            task_id: topic_uint(1)? as u64,
        }))
    } else if sig == sigs.withdrawn {
        let data = abi::decode_data(&log.data, &[AbiType::Uint])?;
        Ok(Some(LedgerEvent::Withdrawn {
            who: topic_address(1)?,
            amount: data[0].as_uint().unwrap_or_default(),
        }))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_client() -> Arc<LedgerClient> {
        let settings = LedgerSettings {
            operator_id: "0.0.1001".into(),
            // The secp256k1 "1" key: valid and deterministic for tests.
            operator_key: format!("{:064x}", 1),
            contract_id: "0.0.5005".into(),
            topic_id: Some("0.0.6006".into()),
            gateway_url: "http://127.0.0.1:1".into(),
            mirror_url: "http://127.0.0.1:1".into(),
        };
        Arc::new(LedgerClient::new(&settings).unwrap())
    }

    fn weights_log(tx: &str, index: u64, task_id: u64, remaining: u64) -> MirrorLog {
        let mut data = String::from("0x");
        data.push_str(&format!("{:064x}", 96)); // string offset
        data.push_str(&format!("{:064x}", 10_000_000u64));
        data.push_str(&format!("{remaining:064x}"));
        let hash = "ab".repeat(32);
        data.push_str(&format!("{:064x}", hash.len()));
        data.push_str(&hex::encode(hash.as_bytes()));
        // hash is 64 ascii chars -> exactly two words, no padding needed

        MirrorLog {
            data,
            index,
            topics: vec![
                signatures().weights_submitted.clone(),
                format!("0x{task_id:064x}"),
                format!("0x{:064x}", 0x3e9u64),
            ],
            transaction_hash: tx.to_string(),
            timestamp: "1700000000.000000001".into(),
        }
    }

    #[test]
    fn account_conversion_matches_contract_layout() {
        assert_eq!(
            account_to_evm_address("0.0.1001").unwrap(),
            format!("0x{}{:016x}", "0".repeat(24), 1001)
        );
        // EVM addresses pass through, normalized.
        assert_eq!(
            account_to_evm_address("0xABCDEF0000000000000000000000000000000001").unwrap(),
            "0xabcdef0000000000000000000000000000000001"
        );
        assert!(account_to_evm_address("not-an-account").is_err());
    }

    #[test]
    fn weights_submitted_log_decodes() {
        let event = decode_log(&weights_log("0xaa", 0, 4, 2)).unwrap().unwrap();
        match event {
            LedgerEvent::WeightsSubmitted { task_id, trainer, weights_hash, reward, remaining_chunks } => {
                assert_eq!(task_id, 4);
                assert_eq!(trainer, account_to_evm_address("0.0.1001").unwrap());
                assert_eq!(weights_hash, "ab".repeat(32));
                assert_eq!(reward, 10_000_000);
                assert_eq!(remaining_chunks, 2);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_signatures_are_skipped() {
        let log = MirrorLog {
            data: "0x".into(),
            index: 0,
            topics: vec![abi::event_signature("SomethingElse(uint256)")],
            transaction_hash: "0xbb".into(),
            timestamp: String::new(),
        };
        assert_eq!(decode_log(&log).unwrap(), None);
    }

    #[test]
    fn observer_deduplicates_and_filters() {
        let mut observer = EventObserver::new(test_client(), Some(4));

        // First window: one event for task 4, one for task 9.
        let events = observer.sift(vec![
            weights_log("0x01", 0, 4, 2),
            weights_log("0x02", 0, 9, 5),
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id(), Some(4));

        // Second window re-reads the same logs plus a fresh one.
        let events = observer.sift(vec![
            weights_log("0x03", 0, 4, 1),
            weights_log("0x01", 0, 4, 2),
            weights_log("0x02", 0, 9, 5),
        ]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            LedgerEvent::WeightsSubmitted { remaining_chunks, .. } => {
                assert_eq!(*remaining_chunks, 1)
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn observer_returns_events_oldest_first() {
        let mut observer = EventObserver::new(test_client(), Some(4));
        // Mirror order is newest-first.
        let events = observer.sift(vec![
            weights_log("0x03", 0, 4, 0),
            weights_log("0x02", 0, 4, 1),
            weights_log("0x01", 0, 4, 2),
        ]);
        let remaining: Vec<u64> = events
            .iter()
            .map(|e| match e {
                LedgerEvent::WeightsSubmitted { remaining_chunks, .. } => *remaining_chunks,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[test]
    fn non_retriable_statuses_are_fatal() {
        assert!(!LedgerError::Status("CONTRACT_REVERT_EXECUTED".into()).is_retriable());
        assert!(!LedgerError::Status("INVALID_SIGNATURE".into()).is_retriable());
        assert!(LedgerError::Status("BUSY".into()).is_retriable());
    }
}
