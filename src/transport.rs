//! # UDP transport
//!
//! One socket per node carries every RPC. The transport is a thin wrapper:
//! framing lives in `messages`, dispatch in `dht`, and the receive loop in
//! `node` (which polls with a short timeout so shutdown stays bounded).
//!
//! [`RpcEndpoint`] pairs the socket with the local peer's wire identity and
//! is the [`RpcSender`] capability handed to components that must send RPCs
//! without holding the whole engine.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::warn;

use crate::error::Result;
use crate::identity::Peer;
use crate::messages::{RpcKind, RpcMessage, MAX_DATAGRAM};
use crate::protocols::RpcSender;

/// The node's bound UDP socket.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_port: u16,
}

impl Transport {
    /// Bind to `0.0.0.0:port`. Port 0 asks the OS for an ephemeral port; the
    /// actually bound port is reported by [`Transport::local_port`].
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_port = socket.local_addr()?.port();
        Ok(Self {
            socket: Arc::new(socket),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Send one encoded RPC frame. Returns whether the datagram left the
    /// socket; delivery is of course not acknowledged.
    pub async fn send_rpc(&self, msg: &RpcMessage, to: (Ipv4Addr, u16)) -> bool {
        let frame = msg.encode();
        if frame.len() > MAX_DATAGRAM {
            warn!(len = frame.len(), "dropping oversized outbound rpc");
            return false;
        }
        match self.socket.send_to(&frame, to).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, to = %format!("{}:{}", to.0, to.1), "rpc send failed");
                false
            }
        }
    }

    /// Receive one datagram into `buf`, returning the filled length and the
    /// source address. Cancellation-safe; the caller wraps this in a timeout.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    /// Send raw bytes outside the RPC framing. Used to answer hole-punch
    /// probe datagrams from the node's main socket.
    pub async fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> bool {
        self.socket.send_to(bytes, to).await.is_ok()
    }
}

// ============================================================================
// RpcEndpoint
// ============================================================================

/// The node's outbound RPC half: the socket plus the sender fields every
/// outgoing frame carries.
pub struct RpcEndpoint {
    transport: Transport,
    local: Peer,
}

impl RpcEndpoint {
    pub fn new(transport: Transport, local: Peer) -> Self {
        Self { transport, local }
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    /// Build an outgoing frame addressed to `to`.
    pub fn message(&self, to: &Peer, kind: RpcKind, payload: Vec<u8>) -> RpcMessage {
        RpcMessage::new(
            kind,
            self.local.id,
            to.id,
            self.local.ip,
            self.local.port,
            payload,
        )
    }

    pub async fn send(&self, to: &Peer, kind: RpcKind, payload: Vec<u8>) -> bool {
        let msg = self.message(to, kind, payload);
        self.transport.send_rpc(&msg, (to.ip, to.port)).await
    }
}

#[async_trait]
impl RpcSender for RpcEndpoint {
    async fn send_rpc(&self, to: &Peer, kind: RpcKind, payload: Vec<u8>) -> bool {
        self.send(to, kind, payload).await
    }
}
