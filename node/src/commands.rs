use fedmesh_protocol::TaskId;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("command '{cmd}' expects {expected}")]
    BadArgs { cmd: &'static str, expected: &'static str },
}

/// Request body of `POST /command`.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A control-surface command, parsed from `{cmd, args}`. Each role
/// matches exhaustively and rejects the commands it does not support.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Dial a peer by overlay address.
    Connect { addr: String },
    /// Client: open the round topic for a funded task and announce it.
    Advertize { task_id: TaskId },
    /// Client: freeze the trainer set and distribute assignments.
    Train {
        task_id: TaskId,
        model_hash: String,
        manifest_url: String,
        session_pub_key: String,
    },
    /// Trainer: subscribe to a round topic.
    Join { topic: String },
    /// Unsubscribe from a topic.
    Leave { topic: String },
    /// Raw publish of an opaque payload.
    Publish { topic: String, message: String },
    /// Local mesh snapshot.
    Mesh,
    /// The bootstrap's mesh view.
    BootMesh,
    /// Connected peer list.
    Peers,
    /// Local overlay addresses.
    Local,
    /// Locally subscribed topics.
    Topics,
    /// Role, uptime and round summary.
    Status,
    /// Manage the contract's trainer whitelist (client only).
    Whitelist { op: WhitelistOp, account: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WhitelistOp {
    Add,
    Remove,
    Check,
}

impl Command {
    pub fn parse(req: &CommandRequest) -> Result<Self, CommandError> {
        let args = &req.args;
        match req.cmd.as_str() {
            "connect" => match args.as_slice() {
                [addr] => Ok(Command::Connect { addr: addr.clone() }),
                _ => Err(CommandError::BadArgs { cmd: "connect", expected: "[multiaddr]" }),
            },
            "advertize" => match args.as_slice() {
                [task_id] => {
                    let task_id = parse_task_id("advertize", task_id)?;
                    Ok(Command::Advertize { task_id })
                }
                _ => Err(CommandError::BadArgs { cmd: "advertize", expected: "[taskId]" }),
            },
            "train" => match args.as_slice() {
                [task_id, rest] => {
                    let task_id = parse_task_id("train", task_id)?;
                    let mut parts = rest.split_whitespace();
                    match (parts.next(), parts.next(), parts.next(), parts.next()) {
                        (Some(model), Some(manifest), Some(pubkey), None) => {
                            Ok(Command::Train {
                                task_id,
                                model_hash: model.to_string(),
                                manifest_url: manifest.to_string(),
                                session_pub_key: pubkey.to_string(),
                            })
                        }
                        _ => Err(CommandError::BadArgs {
                            cmd: "train",
                            expected: "[taskId, \"<modelHash> <manifestURL> <pubKey>\"]",
                        }),
                    }
                }
                _ => Err(CommandError::BadArgs {
                    cmd: "train",
                    expected: "[taskId, \"<modelHash> <manifestURL> <pubKey>\"]",
                }),
            },
            "join" => match args.as_slice() {
                [topic] => Ok(Command::Join { topic: topic.clone() }),
                _ => Err(CommandError::BadArgs { cmd: "join", expected: "[topic]" }),
            },
            "leave" => match args.as_slice() {
                [topic] => Ok(Command::Leave { topic: topic.clone() }),
                _ => Err(CommandError::BadArgs { cmd: "leave", expected: "[topic]" }),
            },
            "publish" => match args.as_slice() {
                [topic, message] => Ok(Command::Publish {
                    topic: topic.clone(),
                    message: message.clone(),
                }),
                _ => Err(CommandError::BadArgs { cmd: "publish", expected: "[topic, message]" }),
            },
            "whitelist" => match args.as_slice() {
                [op, account] => {
                    let op = match op.as_str() {
                        "add" => WhitelistOp::Add,
                        "remove" => WhitelistOp::Remove,
                        "check" => WhitelistOp::Check,
                        _ => {
                            return Err(CommandError::BadArgs {
                                cmd: "whitelist",
                                expected: "[add|remove|check, account]",
                            })
                        }
                    };
                    Ok(Command::Whitelist { op, account: account.clone() })
                }
                _ => Err(CommandError::BadArgs {
                    cmd: "whitelist",
                    expected: "[add|remove|check, account]",
                }),
            },
            "mesh" => Ok(Command::Mesh),
            "bootmesh" => Ok(Command::BootMesh),
            "peers" => Ok(Command::Peers),
            "local" => Ok(Command::Local),
            "topics" => Ok(Command::Topics),
            "status" => Ok(Command::Status),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn parse_task_id(cmd: &'static str, raw: &str) -> Result<TaskId, CommandError> {
    raw.parse().map_err(|_| CommandError::BadArgs {
        cmd,
        expected: "a numeric taskId",
    })
}
