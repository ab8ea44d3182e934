//! # Burrow - Kademlia overlay with NAT hole-punching
//!
//! Burrow is a peer-to-peer key/value overlay built on:
//!
//! - **Identity**: 160-bit node IDs with the Kademlia XOR distance metric
//! - **Routing**: 160 distance-indexed k-buckets with stale-head replacement
//! - **Protocol**: iterative parallel FIND_NODE / FIND_VALUE lookups, STORE
//!   replication, and republish/expire maintenance over plain UDP
//! - **NAT traversal**: STUN endpoint discovery, NAT classification, and a
//!   local/direct/STUN-assisted/TCP hole-punching cascade
//!
//! ## Architecture
//!
//! All state lives behind the [`Node`] facade. Two long-lived workers — a
//! socket receiver and a 10-minute maintenance timer — run as tokio tasks
//! watching a shutdown flag. Routing-table buckets carry their own locks so
//! concurrent traffic on different buckets does not serialize, and peers are
//! value types: the table owns the authoritative entries and every caller
//! gets snapshots.
//!
//! The protocol engine and the hole-puncher need each other at runtime; the
//! cycle is broken by injecting a narrow [`protocols::RpcSender`] capability
//! into the puncher instead of an engine handle.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `identity` | Node IDs, XOR distance, peers, DHT keys |
//! | `dht` | Routing table, record store, protocol engine |
//! | `messages` | Wire frame and payload codecs |
//! | `transport` | The node's UDP socket |
//! | `protocols` | RPC capability traits |
//! | `stun` | RFC 5389 Binding subset |
//! | `holepunch` | NAT classification and punch cascade |
//! | `error` | Crate error type |

pub mod dht;
pub mod error;
pub mod holepunch;
pub mod identity;
pub mod messages;
pub mod protocols;
pub mod stun;
pub mod transport;

mod node;

pub use error::{Error, Result};
pub use identity::{DhtKey, NodeId, Peer};
pub use node::Node;
