//! # Node facade
//!
//! [`Node`] assembles the subsystems — transport, protocol engine, hole
//! puncher — wires them together through the `RpcSender` seam, and runs the
//! two long-lived workers:
//!
//! - **receiver**: drains the UDP socket, dispatching RPC frames to the
//!   engine in arrival order and answering hole-punch probe datagrams
//! - **maintenance**: every 10 minutes refreshes buckets, republishes
//!   records, and expires stale ones
//!
//! Both workers watch a shutdown flag; the receiver polls with a 100 ms
//! timeout so [`Node::shutdown`] completes promptly.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, trace, warn};

use crate::dht::{Dht, MAINTENANCE_INTERVAL};
use crate::error::{Error, Result};
use crate::holepunch::{self, ConnectionInfo, HolePuncher, NatType};
use crate::identity::{parse_endpoint, DhtKey, NodeId, Peer};
use crate::messages::{RpcMessage, MAX_DATAGRAM};
use crate::protocols::RpcSender;
use crate::stun::PublicEndpoint;
use crate::transport::{RpcEndpoint, Transport};

/// Receiver poll timeout; bounds shutdown latency.
const RECV_POLL: Duration = Duration::from_millis(100);

/// A running overlay node.
pub struct Node {
    dht: Arc<Dht>,
    puncher: Arc<HolePuncher>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind `0.0.0.0:port` (0 for an ephemeral port), pick a random node ID,
    /// and start the workers.
    pub async fn bind(port: u16) -> Result<Self> {
        let transport = Transport::bind(port).await?;
        let local_ip = holepunch::detect_local_ip().await;
        let ip = local_ip.unwrap_or(Ipv4Addr::LOCALHOST);
        let local = Peer::new(NodeId::random(), ip, transport.local_port());
        info!(id = %local.id, addr = %local.addr(), "node starting");

        let endpoint = Arc::new(RpcEndpoint::new(transport.clone(), local));
        let sender: Arc<dyn RpcSender> = Arc::clone(&endpoint) as Arc<dyn RpcSender>;
        let puncher = Arc::new(HolePuncher::new(
            sender,
            local_ip,
            transport.local_port(),
        ));
        let dht = Dht::new(endpoint, Arc::clone(&puncher));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let node = Self {
            dht,
            puncher,
            shutdown: shutdown_tx,
            workers: Mutex::new(Vec::new()),
        };
        node.spawn_receiver(transport, shutdown_rx.clone());
        node.spawn_maintenance(shutdown_rx);
        Ok(node)
    }

    fn spawn_receiver(&self, transport: Transport, shutdown: watch::Receiver<bool>) {
        let dht = Arc::clone(&self.dht);
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match timeout(RECV_POLL, transport.recv_from(&mut buf)).await {
                    Ok(Ok((len, src))) => {
                        let datagram = &buf[..len];
                        match RpcMessage::decode(datagram) {
                            Ok(msg) => dht.handle_rpc(msg, src).await,
                            Err(_) => {
                                // not an RPC frame; maybe a punch probe
                                if let Some(reply) = holepunch::probe_reply(datagram) {
                                    transport.send_raw(reply, src).await;
                                } else {
                                    trace!(len, %src, "dropping unrecognized datagram");
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "socket receive failed");
                        sleep(RECV_POLL).await;
                    }
                    // poll timeout: loop around and re-check the flag
                    Err(_) => {}
                }
            }
            debug!("receiver worker stopped");
        });
        self.push_worker(handle);
    }

    fn spawn_maintenance(&self, mut shutdown: watch::Receiver<bool>) {
        let dht = Arc::clone(&self.dht);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(MAINTENANCE_INTERVAL) => {
                        debug!("maintenance pass starting");
                        dht.maintenance_pass().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("maintenance worker stopped");
        });
        self.push_worker(handle);
    }

    fn push_worker(&self, handle: JoinHandle<()>) {
        match self.workers.lock() {
            Ok(mut workers) => workers.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    // ------------------------------------------------------------------
    // Identity and introspection
    // ------------------------------------------------------------------

    pub fn id(&self) -> NodeId {
        self.dht.local_id()
    }

    pub fn local_peer(&self) -> Peer {
        self.dht.local_peer()
    }

    pub fn table_len(&self) -> usize {
        self.dht.table().len()
    }

    pub fn table_snapshot(&self) -> Vec<Peer> {
        self.dht.table().all()
    }

    pub fn stored_records(&self) -> usize {
        self.dht.stored_records()
    }

    pub fn known_peer(&self, id: &NodeId) -> Option<Peer> {
        self.dht.table().get(id)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.puncher.connection_info()
    }

    // ------------------------------------------------------------------
    // Overlay operations
    // ------------------------------------------------------------------

    /// Join the overlay via a known `ip:port`.
    pub async fn bootstrap(&self, endpoint: &str) -> Result<()> {
        let (ip, port) = parse_endpoint(endpoint)?;
        self.dht.bootstrap(ip, port).await
    }

    /// Store a record on the peers closest to `SHA1(key)`. `Ok(true)` means
    /// every replica send succeeded.
    pub async fn store(&self, key: DhtKey, value: Vec<u8>) -> Result<bool> {
        self.dht.store(key, value).await
    }

    /// Resolve a key, checking the local store before the network.
    pub async fn get(&self, key: &DhtKey) -> Result<Vec<u8>> {
        self.dht.find_value(key).await
    }

    /// The K peers closest to `target`, found by iterative lookup.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Peer>> {
        self.dht.lookup_nodes(target).await
    }

    /// Ping a peer already in the routing table.
    pub async fn ping(&self, id: &NodeId) -> Result<bool> {
        let peer = self.known_peer(id).ok_or(Error::NotFound)?;
        Ok(self.dht.ping(&peer).await)
    }

    /// Hole-punch a direct session to a peer already in the routing table.
    pub async fn connect(&self, id: &NodeId) -> Result<(Ipv4Addr, u16)> {
        let peer = self.known_peer(id).ok_or(Error::NotFound)?;
        self.puncher.punch(&peer).await
    }

    /// Classify the NAT in front of this node.
    pub async fn detect_nat_type(&self) -> NatType {
        self.puncher.detect_nat_type().await
    }

    /// Discover this node's publicly visible endpoint.
    pub async fn public_endpoint(&self) -> Result<PublicEndpoint> {
        self.puncher.public_endpoint().await
    }

    /// Flip the shutdown flag and join both workers.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            match self.workers.lock() {
                Ok(mut workers) => workers.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            }
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!(id = %self.id(), "node stopped");
    }
}
