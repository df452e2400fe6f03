use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use fedmesh_protocol::Role;
use thiserror::Error;

/// Default control-surface ports per role.
const BOOTSTRAP_HTTP_PORT: u16 = 9000;
const CLIENT_HTTP_PORT: u16 = 9001;
const TRAINER_HTTP_PORT: u16 = 9002;

/// The bootstrap overlay listens on a fixed, well-known port; everyone
/// else takes an ephemeral one.
const BOOTSTRAP_OVERLAY_PORT: u16 = 7400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NodeRole {
    Bootstrap,
    Client,
    Trainer,
}

impl From<NodeRole> for Role {
    fn from(role: NodeRole) -> Role {
        match role {
            NodeRole::Bootstrap => Role::Bootstrap,
            NodeRole::Client => Role::Client,
            NodeRole::Trainer => Role::Trainer,
        }
    }
}

#[derive(Parser)]
#[command(name = "fedmesh-node", about = "fedmesh federated-learning coordination node")]
pub struct Cli {
    /// Role this node plays for its lifetime
    #[arg(long, value_enum, env = "FEDMESH_ROLE")]
    pub role: NodeRole,

    /// Control-surface port (defaults: bootstrap 9000, client 9001, trainer 9002)
    #[arg(long, env = "FEDMESH_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Overlay listen port (bootstrap defaults to 7400, others ephemeral)
    #[arg(long, env = "FEDMESH_OVERLAY_PORT")]
    pub overlay_port: Option<u16>,

    /// IP other nodes can reach us at
    #[arg(long, env = "NODE_IP", default_value = "127.0.0.1")]
    pub node_ip: String,

    /// Bind all interfaces and advertise NODE_IP (NAT'd cloud hosts)
    #[arg(long, env = "IS_CLOUD", default_value_t = false)]
    pub is_cloud: bool,

    /// Overlay address of the bootstrap node (required for client/trainer)
    #[arg(long, env = "BOOTSTRAP_ADDR")]
    pub bootstrap_addr: Option<String>,

    /// Directory holding the persistent peer identity
    #[arg(long, env = "FEDMESH_CONFIG_DIR", default_value = ".fedmesh")]
    pub config_dir: PathBuf,

    /// Ledger signing account (e.g. 0.0.12345)
    #[arg(long, env = "OPERATOR_ID")]
    pub operator_id: Option<String>,

    /// ECDSA secp256k1 operator secret key, hex
    #[arg(long, env = "OPERATOR_KEY", hide_env_values = true)]
    pub operator_key: Option<String>,

    /// Training-reward contract id
    #[arg(long, env = "CONTRACT_ID")]
    pub contract_id: Option<String>,

    /// Consensus topic id for human-readable round logs
    #[arg(long, env = "TOPIC_ID")]
    pub topic_id: Option<String>,

    /// Transaction gateway base URL
    #[arg(long, env = "LEDGER_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Mirror REST base URL (read-only event source)
    #[arg(
        long,
        env = "LEDGER_MIRROR_URL",
        default_value = "https://testnet.mirrornode.hedera.com"
    )]
    pub mirror_url: String,

    #[arg(long, env = "OBJECT_STORE_ACCESS_KEY", hide_env_values = true)]
    pub store_access_key: Option<String>,

    #[arg(long, env = "OBJECT_STORE_SECRET_KEY", hide_env_values = true)]
    pub store_secret_key: Option<String>,

    #[arg(long, env = "OBJECT_STORE_ENDPOINT", default_value = "https://o3-rc2.akave.xyz")]
    pub store_endpoint: String,

    #[arg(long, env = "OBJECT_STORE_BUCKET", default_value = "fedmesh-bucket")]
    pub store_bucket: String,

    /// Optional wall-clock deadline for a whole round
    #[arg(long, env = "FEDMESH_ROUND_DEADLINE_SECS")]
    pub round_deadline_secs: Option<u64>,

    /// Dataset chunk size budget in bytes
    #[arg(long, default_value_t = 50 * 1024)]
    pub chunk_bytes: usize,

    /// Interpreter used to execute downloaded model artifacts
    #[arg(long, env = "FEDMESH_MODEL_RUNNER", default_value = "python3")]
    pub model_runner: String,

    /// Timeout for a single model execution
    #[arg(long, default_value_t = 3600)]
    pub train_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub operator_id: String,
    pub operator_key: String,
    pub contract_id: String,
    pub topic_id: Option<String>,
    pub gateway_url: String,
    pub mirror_url: String,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub bucket: String,
}

/// Immutable node configuration, built once at startup. All environment
/// reads happen in the clap layer; nothing else touches the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: NodeRole,
    pub http_port: u16,
    pub overlay_port: u16,
    pub node_ip: String,
    pub is_cloud: bool,
    pub bootstrap_addr: Option<String>,
    pub config_dir: PathBuf,
    pub ledger: Option<LedgerSettings>,
    pub store: Option<StoreSettings>,
    pub round_deadline_secs: Option<u64>,
    pub chunk_bytes: usize,
    pub model_runner: String,
    pub train_timeout_secs: u64,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let http_port = cli.http_port.unwrap_or(match cli.role {
            NodeRole::Bootstrap => BOOTSTRAP_HTTP_PORT,
            NodeRole::Client => CLIENT_HTTP_PORT,
            NodeRole::Trainer => TRAINER_HTTP_PORT,
        });
        let overlay_port = cli.overlay_port.unwrap_or(match cli.role {
            NodeRole::Bootstrap => BOOTSTRAP_OVERLAY_PORT,
            _ => 0,
        });

        if cli.role != NodeRole::Bootstrap && cli.bootstrap_addr.is_none() {
            return Err(ConfigError::Missing("BOOTSTRAP_ADDR"));
        }

        // Client and trainer talk to the ledger and the object store;
        // the bootstrap holds no training state and needs neither.
        let (ledger, store) = if cli.role == NodeRole::Bootstrap {
            (None, None)
        } else {
            let operator_id = cli.operator_id.ok_or(ConfigError::Missing("OPERATOR_ID"))?;
            let operator_key = cli.operator_key.ok_or(ConfigError::Missing("OPERATOR_KEY"))?;
            validate_operator_key(&operator_key)?;
            let ledger = LedgerSettings {
                operator_id,
                operator_key,
                contract_id: cli.contract_id.ok_or(ConfigError::Missing("CONTRACT_ID"))?,
                topic_id: cli.topic_id,
                gateway_url: cli.gateway_url.ok_or(ConfigError::Missing("LEDGER_GATEWAY_URL"))?,
                mirror_url: cli.mirror_url,
            };
            let store = StoreSettings {
                access_key: cli
                    .store_access_key
                    .ok_or(ConfigError::Missing("OBJECT_STORE_ACCESS_KEY"))?,
                secret_key: cli
                    .store_secret_key
                    .ok_or(ConfigError::Missing("OBJECT_STORE_SECRET_KEY"))?,
                endpoint: cli.store_endpoint,
                bucket: cli.store_bucket,
            };
            (Some(ledger), Some(store))
        };

        Ok(Config {
            role: cli.role,
            http_port,
            overlay_port,
            node_ip: cli.node_ip,
            is_cloud: cli.is_cloud,
            bootstrap_addr: cli.bootstrap_addr,
            config_dir: cli.config_dir,
            ledger,
            store,
            round_deadline_secs: cli.round_deadline_secs,
            chunk_bytes: cli.chunk_bytes,
            model_runner: cli.model_runner,
            train_timeout_secs: cli.train_timeout_secs,
        })
    }

    /// Address the overlay listener binds to. Cloud hosts bind every
    /// interface and advertise `node_ip`; local nodes bind `node_ip`.
    pub fn overlay_bind_addr(&self) -> String {
        let ip = if self.is_cloud { "0.0.0.0" } else { self.node_ip.as_str() };
        format!("{ip}:{}", self.overlay_port)
    }

    pub fn http_bind_addr(&self) -> String {
        let ip = if self.is_cloud { "0.0.0.0" } else { self.node_ip.as_str() };
        format!("{ip}:{}", self.http_port)
    }
}

fn validate_operator_key(key: &str) -> Result<(), ConfigError> {
    let stripped = key.strip_prefix("0x").unwrap_or(key);
    let bytes = hex::decode(stripped).map_err(|e| ConfigError::Invalid {
        field: "OPERATOR_KEY",
        reason: e.to_string(),
    })?;
    secp256k1::SecretKey::from_slice(&bytes).map_err(|e| ConfigError::Invalid {
        field: "OPERATOR_KEY",
        reason: e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli(role: NodeRole) -> Cli {
        Cli::parse_from([
            "fedmesh-node",
            "--role",
            match role {
                NodeRole::Bootstrap => "bootstrap",
                NodeRole::Client => "client",
                NodeRole::Trainer => "trainer",
            },
        ])
    }

    #[test]
    fn bootstrap_needs_no_external_adapters() {
        let cfg = Config::from_cli(base_cli(NodeRole::Bootstrap)).unwrap();
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.overlay_port, 7400);
        assert!(cfg.ledger.is_none());
        assert!(cfg.store.is_none());
    }

    #[test]
    fn trainer_without_bootstrap_addr_is_a_config_error() {
        let err = Config::from_cli(base_cli(NodeRole::Trainer)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BOOTSTRAP_ADDR")));
    }

    #[test]
    fn client_requires_complete_ledger_settings() {
        let mut cli = base_cli(NodeRole::Client);
        cli.bootstrap_addr = Some("127.0.0.1:7400".into());
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("OPERATOR_ID")));
    }

    #[test]
    fn operator_key_must_be_valid_secp256k1_hex() {
        let mut cli = base_cli(NodeRole::Client);
        cli.bootstrap_addr = Some("127.0.0.1:7400".into());
        cli.operator_id = Some("0.0.1001".into());
        cli.operator_key = Some("not-hex".into());
        cli.contract_id = Some("0.0.5005".into());
        cli.gateway_url = Some("https://gateway.example".into());
        cli.store_access_key = Some("ak".into());
        cli.store_secret_key = Some("sk".into());

        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "OPERATOR_KEY", .. }));
    }

    #[test]
    fn cloud_nodes_bind_all_interfaces() {
        let mut cli = base_cli(NodeRole::Bootstrap);
        cli.node_ip = "203.0.113.9".into();
        cli.is_cloud = true;
        let cfg = Config::from_cli(cli).unwrap();
        assert_eq!(cfg.overlay_bind_addr(), "0.0.0.0:7400");

        let mut cli = base_cli(NodeRole::Bootstrap);
        cli.node_ip = "203.0.113.9".into();
        let cfg = Config::from_cli(cli).unwrap();
        assert_eq!(cfg.overlay_bind_addr(), "203.0.113.9:7400");
    }
}
