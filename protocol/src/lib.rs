//! fedmesh overlay protocol
//!
//! The coordination plane of the fedmesh network: authenticated peer
//! connections and topic-scoped publish/subscribe over a lightweight
//! HTTP-carried gossip scheme.
//!
//! # Architecture
//!
//! ```text
//!              ┌───────────┐
//!              │ Bootstrap │  directory of peers + meshes
//!              └─────┬─────┘
//!        dial at     │    directory refresh every heartbeat
//!        startup ┌───┴────────────────┐
//!           ┌────┴───┐          ┌────┴────┐
//!           │ Client │◄────────►│ Trainer │
//!           └────────┘  publish └─────────┘
//!                       on topic
//! ```
//!
//! ## Topics
//! - Every node joins the well-known discovery topic (`fed-learn`) at
//!   startup and announces its role there.
//! - Each training round gets its own topic named after the ledger task
//!   id; assignments and submission echoes flow on it.
//!
//! ## Delivery
//! - Publishing fans out directly to the known mesh members of a topic;
//!   delivery is best-effort and unacknowledged end to end.
//! - Per-sender FIFO only; receivers treat round messages as idempotent
//!   by key, so duplicates and retransmissions are harmless.
//!
//! ## Identity
//! - Every envelope is signed with the node's persistent Ed25519 key;
//!   the peer id is derived from the public key, so a receiver can
//!   verify both the signature and the claimed id.

pub mod identity;
pub mod overlay;
pub mod peer;
pub mod types;

pub use identity::PeerIdentity;
pub use overlay::{Overlay, OverlayError};
pub use peer::PeerInfo;
pub use types::*;
