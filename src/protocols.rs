//! RPC capability traits.
//!
//! The protocol engine and the hole-puncher need each other: the engine
//! routes inbound HOLE_PUNCH_REQUESTs to the puncher, and the puncher must
//! send a HOLE_PUNCH_REQUEST before starting its packet cascade. The cycle is
//! broken by handing the puncher this narrow sending capability instead of a
//! reference to the engine.

use async_trait::async_trait;

use crate::identity::Peer;
use crate::messages::RpcKind;

/// Ability to send one RPC of the given kind to a peer.
#[async_trait]
pub trait RpcSender: Send + Sync {
    /// Returns whether the datagram was handed to the socket.
    async fn send_rpc(&self, to: &Peer, kind: RpcKind, payload: Vec<u8>) -> bool;
}
