//! # NAT traversal
//!
//! NAT-type classification and the layered hole-punching cascade that turns
//! two DHT peers behind address translators into a direct session.
//!
//! ## Strategy cascade
//!
//! | Stage | When | Mechanism |
//! |-------|------|-----------|
//! | Local | target is loopback or our own LAN address | UDP echo handshake on an ephemeral port |
//! | Direct | always tried first for remote peers | single probe, 2 s wait for a reply from the exact endpoint |
//! | STUN-assisted | direct failed | punch packets to open our mapping, then probe rounds advertising our public endpoint |
//! | TCP simultaneous open | UDP exhausted | race an ephemeral listener against repeated outbound connects |
//!
//! The initiator first sends a HOLE_PUNCH_REQUEST RPC through the injected
//! [`RpcSender`] so the far side starts its response routine; the cascade
//! then only has to meet packets in the middle.
//!
//! ## Probe datagrams
//!
//! Punch probes are plain-text datagrams, not RPC frames. The node's
//! receiver hands undecodable datagrams to [`probe_reply`], which answers
//! `LOCAL_CONNECT` / `DIRECT_CONNECT` / `STUN_CONNECT` probes so the echo
//! handshakes complete; bare `HOLE_PUNCH` packets are intentionally never
//! answered (they exist only to open translator state).

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::{now_ms, NodeId, Peer};
use crate::messages::RpcKind;
use crate::protocols::RpcSender;
use crate::stun::{self, PublicEndpoint};

/// Wait per direct/STUN/TCP round.
const ROUND_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait per local-connection attempt.
const LOCAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between packets in a punch burst.
const BURST_SPACING: Duration = Duration::from_millis(100);

/// Pause between retry rounds.
const ROUND_SPACING: Duration = Duration::from_millis(500);

/// Attempts for the local and TCP/STUN round loops.
const MAX_ROUNDS: usize = 5;

/// Packets per NAT-opening burst.
const PUNCH_BURST: usize = 10;

// ============================================================================
// NAT classification
// ============================================================================

/// What kind of translator (if any) sits in front of this node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NatType {
    #[default]
    Unknown,
    Open,
    FullCone,
    /// Never produced by the simplified classifier; distinguishing it from
    /// port-restricted needs a change-request round-trip we do not send.
    Restricted,
    PortRestricted,
    Symmetric,
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatType::Unknown => write!(f, "Unknown"),
            NatType::Open => write!(f, "Open (no NAT)"),
            NatType::FullCone => write!(f, "Full Cone NAT"),
            NatType::Restricted => write!(f, "Restricted NAT"),
            NatType::PortRestricted => write!(f, "Port Restricted NAT"),
            NatType::Symmetric => write!(f, "Symmetric NAT"),
        }
    }
}

/// Everything we know about how this node is reachable.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    pub nat_type: NatType,
    pub public: Option<PublicEndpoint>,
    pub local_ip: Option<Ipv4Addr>,
    /// Local port whose translator mapping produced `public`.
    pub local_port: u16,
    pub detected_at_ms: u64,
}

/// Detect the LAN-facing local address: route a UDP socket toward a public
/// destination and read back the chosen source address. No packet is sent.
pub async fn detect_local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect(("8.8.8.8", 53)).await.ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

/// Reply for an inbound punch probe, if the datagram is one.
///
/// The receiver calls this for datagrams that fail RPC decoding; answering
/// from the DHT socket is what lets an initiator's wait-for-reply-from-the-
/// exact-endpoint checks succeed.
pub fn probe_reply(datagram: &[u8]) -> Option<&'static [u8]> {
    if datagram.starts_with(b"LOCAL_CONNECT_RESPONSE") {
        return None;
    }
    if datagram.starts_with(b"LOCAL_CONNECT") {
        return Some(b"LOCAL_CONNECT_RESPONSE");
    }
    if datagram.starts_with(b"DIRECT_CONNECT") {
        return Some(b"DIRECT_CONNECT_OK");
    }
    if datagram.starts_with(b"STUN_CONNECT") {
        return Some(b"STUN_CONNECT_OK");
    }
    None
}

// ============================================================================
// Hole puncher
// ============================================================================

struct PunchState {
    info: ConnectionInfo,
    pending: HashSet<NodeId>,
}

/// Drives NAT classification and punch attempts. One lock guards both the
/// connection info and the set of in-flight punches.
pub struct HolePuncher {
    rpc: Arc<dyn RpcSender>,
    state: Mutex<PunchState>,
}

impl HolePuncher {
    pub fn new(rpc: Arc<dyn RpcSender>, local_ip: Option<Ipv4Addr>, local_port: u16) -> Self {
        Self {
            rpc,
            state: Mutex::new(PunchState {
                info: ConnectionInfo {
                    local_ip,
                    local_port,
                    detected_at_ms: now_ms(),
                    ..ConnectionInfo::default()
                },
                pending: HashSet::new(),
            }),
        }
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.lock_state().info.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PunchState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_local(&self, ip: Ipv4Addr) -> bool {
        ip.is_loopback() || Some(ip) == self.lock_state().info.local_ip
    }

    /// Discover and cache our public endpoint via STUN.
    pub async fn public_endpoint(&self) -> Result<PublicEndpoint> {
        let endpoint = stun::public_endpoint().await?;
        let mut state = self.lock_state();
        state.info.public = Some(endpoint);
        state.info.detected_at_ms = now_ms();
        Ok(endpoint)
    }

    /// Classify the NAT in front of us by comparing the mappings two STUN
    /// servers observe for the same local socket.
    pub async fn detect_nat_type(&self) -> NatType {
        let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await else {
            return self.record_nat(NatType::Unknown, None, 0);
        };
        let probe_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);

        let mut first = None;
        for (i, &server) in stun::STUN_SERVERS.iter().enumerate() {
            if let Ok(endpoint) = stun::query_via(&socket, server).await {
                first = Some((i, endpoint));
                break;
            }
        }
        let Some((first_idx, e1)) = first else {
            return self.record_nat(NatType::Unknown, None, probe_port);
        };

        let local_ip = self.lock_state().info.local_ip;
        if Some(e1.ip) == local_ip {
            return self.record_nat(NatType::Open, Some(e1), probe_port);
        }

        let second_server = stun::STUN_SERVERS[(first_idx + 1) % stun::STUN_SERVERS.len()];
        let nat = match stun::query_via(&socket, second_server).await {
            // conservative default when the second server is unreachable
            Err(_) => NatType::PortRestricted,
            Ok(e2) if e1 == e2 => NatType::FullCone,
            Ok(_) => NatType::Symmetric,
        };
        self.record_nat(nat, Some(e1), probe_port)
    }

    fn record_nat(
        &self,
        nat: NatType,
        public: Option<PublicEndpoint>,
        probe_port: u16,
    ) -> NatType {
        let mut state = self.lock_state();
        state.info.nat_type = nat;
        if public.is_some() {
            state.info.public = public;
        }
        if probe_port != 0 {
            state.info.local_port = probe_port;
        }
        state.info.detected_at_ms = now_ms();
        nat
    }

    // ------------------------------------------------------------------
    // Initiation
    // ------------------------------------------------------------------

    /// Establish a direct session with `target`. Returns the endpoint the
    /// session was confirmed against.
    pub async fn punch(&self, target: &Peer) -> Result<(Ipv4Addr, u16)> {
        if self.is_local(target.ip) {
            info!(target = %target, "target is local, using local connection");
            return if attempt_local(target.ip, target.port).await {
                Ok((target.ip, target.port))
            } else {
                Err(Error::HolePunchFailure)
            };
        }

        self.lock_state().pending.insert(target.id);
        let result = self.punch_remote(target).await;
        self.lock_state().pending.remove(&target.id);
        result
    }

    async fn punch_remote(&self, target: &Peer) -> Result<(Ipv4Addr, u16)> {
        // Wake the far side so its response routine runs while we punch.
        if !self
            .rpc
            .send_rpc(target, RpcKind::HolePunchRequest, Vec::new())
            .await
        {
            debug!(target = %target.id, "hole punch request send failed");
        }

        if attempt_direct(target.ip, target.port).await {
            info!(target = %target.id, "direct connection succeeded");
            return Ok((target.ip, target.port));
        }

        if self.attempt_stun_assisted(target).await {
            info!(target = %target.id, "stun-assisted connection succeeded");
            return Ok((target.ip, target.port));
        }

        if attempt_tcp_simultaneous_open(target).await {
            info!(target = %target.id, "tcp simultaneous open succeeded");
            return Ok((target.ip, target.port));
        }

        warn!(target = %target.id, "all hole punch strategies exhausted");
        Err(Error::HolePunchFailure)
    }

    /// STUN-assisted UDP: advertise our public endpoint while repeatedly
    /// probing the target's.
    async fn attempt_stun_assisted(&self, target: &Peer) -> bool {
        let Ok(public) = self.public_endpoint().await else {
            return false;
        };

        let socket = match self.bind_mapped_or_ephemeral().await {
            Some(socket) => socket,
            None => return false,
        };
        let dest = (target.ip, target.port);

        send_punch_burst(&target.ip, target.port, PUNCH_BURST).await;

        let probe = format!("STUN_CONNECT {}:{}", public.ip, public.port);
        for _ in 0..MAX_ROUNDS {
            if socket.send_to(probe.as_bytes(), dest).await.is_err() {
                return false;
            }

            let mut buf = [0u8; 1024];
            if let Ok(Ok((_, from))) = timeout(ROUND_TIMEOUT, socket.recv_from(&mut buf)).await {
                if from == SocketAddr::from(dest) {
                    return true;
                }
            }
            sleep(ROUND_SPACING).await;
        }
        false
    }

    /// Bind to the local port our translator already has a mapping for, or
    /// fall back to an ephemeral port when it is taken.
    async fn bind_mapped_or_ephemeral(&self) -> Option<UdpSocket> {
        let mapped_port = self.lock_state().info.local_port;
        if mapped_port != 0 {
            if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, mapped_port)).await {
                return Some(socket);
            }
        }
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()
    }

    // ------------------------------------------------------------------
    // Response side
    // ------------------------------------------------------------------

    /// Run the response half of a punch: burst our endpoint at the
    /// requester, then confirm if anything comes back.
    pub async fn respond(&self, requester: &Peer) {
        if self.is_local(requester.ip) {
            debug!(requester = %requester.id, "local hole punch request");
            let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await else {
                return;
            };
            for _ in 0..MAX_ROUNDS {
                let _ = socket
                    .send_to(b"LOCAL_CONNECT_RESPONSE", (requester.ip, requester.port))
                    .await;
                sleep(BURST_SPACING).await;
            }
            return;
        }

        let Ok(public) = self.public_endpoint().await else {
            return;
        };
        let Some(socket) = self.bind_mapped_or_ephemeral().await else {
            return;
        };
        let dest = (requester.ip, requester.port);

        let announce = format!("HOLE_PUNCH_RESPONSE {}:{}", public.ip, public.port);
        for _ in 0..PUNCH_BURST {
            let _ = socket.send_to(announce.as_bytes(), dest).await;
            sleep(BURST_SPACING).await;
        }

        let mut buf = [0u8; 1024];
        if let Ok(Ok((_, from))) = timeout(ROUND_TIMEOUT, socket.recv_from(&mut buf)).await {
            if from.ip() == std::net::IpAddr::from(requester.ip) {
                for _ in 0..3 {
                    let _ = socket.send_to(b"HOLE_PUNCH_CONFIRM", from).await;
                    sleep(BURST_SPACING).await;
                }
            }
        }
    }
}

// ============================================================================
// Connection attempts
// ============================================================================

/// UDP echo handshake for same-host targets: probe from a fresh ephemeral
/// port until anything answers.
async fn attempt_local(ip: Ipv4Addr, port: u16) -> bool {
    let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await else {
        return false;
    };
    let dest = (ip, port);

    for _ in 0..MAX_ROUNDS {
        if socket.send_to(b"LOCAL_CONNECT", dest).await.is_err() {
            return false;
        }
        let mut buf = [0u8; 1024];
        if timeout(LOCAL_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
        {
            return true;
        }
        sleep(BURST_SPACING).await;
    }
    false
}

/// Single direct probe; succeeds on any reply from exactly `ip:port`.
async fn attempt_direct(ip: Ipv4Addr, port: u16) -> bool {
    let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await else {
        return false;
    };
    let dest = (ip, port);
    if socket.send_to(b"DIRECT_CONNECT", dest).await.is_err() {
        return false;
    }

    let mut buf = [0u8; 1024];
    match timeout(ROUND_TIMEOUT, socket.recv_from(&mut buf)).await {
        Ok(Ok((_, from))) => from == SocketAddr::from(dest),
        _ => false,
    }
}

/// Fire a burst of packets at the target to open outbound translator state.
/// The packets themselves are never answered.
async fn send_punch_burst(ip: &Ipv4Addr, port: u16, count: usize) {
    let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await else {
        return;
    };
    for _ in 0..count {
        let _ = socket.send_to(b"HOLE_PUNCH", (*ip, port)).await;
        sleep(BURST_SPACING).await;
    }
}

/// TCP simultaneous open: race an ephemeral listener against repeated
/// outbound connects, recreating the connector each failed round.
async fn attempt_tcp_simultaneous_open(target: &Peer) -> bool {
    let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await else {
        return false;
    };
    let dest = SocketAddr::from((target.ip, target.port));

    for _ in 0..MAX_ROUNDS {
        let connect = TcpStream::connect(dest);
        let outcome = timeout(ROUND_TIMEOUT, async {
            tokio::select! {
                connected = connect => connected.is_ok(),
                accepted = listener.accept() => match accepted {
                    Ok((_, from)) => from.ip() == std::net::IpAddr::from(target.ip),
                    Err(_) => false,
                },
            }
        })
        .await;

        if let Ok(true) = outcome {
            return true;
        }
        sleep(ROUND_SPACING).await;
    }
    false
}
