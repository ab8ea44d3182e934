//! # Kademlia protocol engine
//!
//! Routing table, local record store, and the protocol engine that ties them
//! to the wire.
//!
//! ## Key operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `store(key, value)` | Replicate a record to the K peers closest to `SHA1(key)` |
//! | `find_value(key)` | Local check, then iterative value lookup |
//! | `lookup_nodes(id)` | Iterative FIND_NODE lookup to termination |
//! | `ping(peer)` | Correlated PING/echo round-trip |
//! | `bootstrap(ip, port)` | Join the overlay via a known endpoint |
//!
//! ## Routing table
//!
//! A flat array of 160 k-buckets indexed by the position of the first bit at
//! which a peer's ID differs from ours. Buckets hold at most K peers ordered
//! least- to most-recently seen, with stale-head replacement when full. Each
//! bucket has its own lock so traffic touching different buckets does not
//! serialize; a table-level lock is taken only for whole-table sweeps.
//!
//! ## Reply correlation
//!
//! The wire frame has no transaction ID, so outstanding queries are keyed by
//! the endpoint they were sent to, with a FIFO queue per endpoint; a reply is
//! whatever next arrives from that socket address. An inbound FIND_NODE is a
//! request when its payload is a bare 40-hex target and a reply otherwise; an
//! inbound PING resolves a pending ping to that endpoint before it is echoed,
//! which also keeps two nodes from echoing each other forever.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::holepunch::HolePuncher;
use crate::identity::{distance_cmp, now_ms, DhtKey, NodeId, Peer, KEY_BITS};
use crate::messages::{
    decode_peer_list, decode_store_payload, encode_peer_list, encode_store_payload,
    is_find_node_request, RpcKind, RpcMessage,
};
use crate::transport::RpcEndpoint;

/// Bucket capacity, replication factor, and lookup result cardinality.
pub const K: usize = 20;

/// Lookup concurrency.
pub const ALPHA: usize = 3;

/// How long a stored record lives before expiry (24 hours).
pub const RECORD_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Maintenance cadence: bucket refresh, republish, expire (10 minutes).
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How long to wait for the reply to a single query.
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Backstop on lookup rounds; termination normally comes from the
/// no-closer-peer condition well before this.
const MAX_LOOKUP_ROUNDS: usize = 20;

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// K-bucket
// ============================================================================

/// Result of offering a peer to a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted, or already present and moved to the tail.
    Accepted,
    /// The bucket was full; a stale head was evicted for the newcomer.
    Replaced,
    /// The bucket is full of live peers; the newcomer was dropped.
    Rejected,
}

/// An ordered run of at most K peers: head is least-recently-seen, tail most.
#[derive(Debug, Default)]
pub struct KBucket {
    peers: VecDeque<Peer>,
}

impl KBucket {
    pub fn new() -> Self {
        Self {
            peers: VecDeque::new(),
        }
    }

    /// Offer a peer. Re-observation moves the peer to the tail and refreshes
    /// its endpoint; a full bucket only admits the newcomer over a head that
    /// has gone stale.
    pub fn add(&mut self, peer: Peer, now: u64) -> AddOutcome {
        if let Some(pos) = self.peers.iter().position(|p| p.id == peer.id) {
            let prior_last_seen = self.peers.remove(pos).map(|p| p.last_seen).unwrap_or(0);
            let mut refreshed = peer;
            refreshed.last_seen = refreshed.last_seen.max(prior_last_seen);
            self.peers.push_back(refreshed);
            return AddOutcome::Accepted;
        }

        if self.peers.len() < K {
            self.peers.push_back(peer);
            return AddOutcome::Accepted;
        }

        let head_is_live = self
            .peers
            .front()
            .map(|head| head.is_live(now))
            .unwrap_or(false);
        if head_is_live {
            AddOutcome::Rejected
        } else {
            self.peers.pop_front();
            self.peers.push_back(peer);
            AddOutcome::Replaced
        }
    }

    /// Remove by ID; idempotent.
    pub fn remove(&mut self, id: &NodeId) {
        if let Some(pos) = self.peers.iter().position(|p| &p.id == id) {
            self.peers.remove(pos);
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<Peer> {
        self.peers.iter().find(|p| &p.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.iter().cloned().collect()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= K
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ============================================================================
// Routing table
// ============================================================================

/// Index of the bucket where `id` belongs relative to `local`: the position
/// (MSB-first) of the first 1-bit in their XOR distance. A zero distance maps
/// to the last bucket, though the local ID itself is never inserted.
pub fn bucket_index(local: &NodeId, id: &NodeId) -> usize {
    let dist = local.distance(id);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    KEY_BITS - 1
}

/// 160 distance-indexed k-buckets.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Mutex<KBucket>>,
    // Held only while sweeping every bucket, so concurrent sweeps do not
    // interleave with each other; single-bucket operations skip it.
    sweep: Mutex<()>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let mut buckets = Vec::with_capacity(KEY_BITS);
        for _ in 0..KEY_BITS {
            buckets.push(Mutex::new(KBucket::new()));
        }
        Self {
            local_id,
            buckets,
            sweep: Mutex::new(()),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Offer a peer to its bucket. The local ID is never admitted.
    pub fn add(&self, peer: Peer) -> AddOutcome {
        if peer.id == self.local_id {
            return AddOutcome::Rejected;
        }
        let idx = bucket_index(&self.local_id, &peer.id);
        lock_or_recover(&self.buckets[idx]).add(peer, now_ms())
    }

    pub fn remove(&self, id: &NodeId) {
        let idx = bucket_index(&self.local_id, id);
        lock_or_recover(&self.buckets[idx]).remove(id);
    }

    pub fn get(&self, id: &NodeId) -> Option<Peer> {
        let idx = bucket_index(&self.local_id, id);
        lock_or_recover(&self.buckets[idx]).get(id)
    }

    /// The `n` peers closest to `target`, ascending by XOR distance with
    /// lexicographic ID order breaking ties.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<Peer> {
        let _sweep = lock_or_recover(&self.sweep);
        let mut peers: Vec<Peer> = Vec::new();
        for bucket in &self.buckets {
            peers.extend(lock_or_recover(bucket).snapshot());
        }
        peers.sort_by(|a, b| {
            distance_cmp(&a.id.distance(target), &b.id.distance(target))
                .then_with(|| a.id.cmp(&b.id))
        });
        peers.truncate(n);
        peers
    }

    /// Snapshot of every peer across all buckets.
    pub fn all(&self) -> Vec<Peer> {
        let _sweep = lock_or_recover(&self.sweep);
        let mut peers = Vec::new();
        for bucket in &self.buckets {
            peers.extend(lock_or_recover(bucket).snapshot());
        }
        peers
    }

    pub fn len(&self) -> usize {
        let _sweep = lock_or_recover(&self.sweep);
        self.buckets
            .iter()
            .map(|b| lock_or_recover(b).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Local record store
// ============================================================================

#[derive(Clone, Debug)]
struct StoredRecord {
    key: DhtKey,
    value: Vec<u8>,
    inserted_ms: u64,
}

/// In-memory record store keyed by the printable key form. The original key
/// bytes ride along with each record so republishing re-hashes the true key
/// rather than its printable rendering.
#[derive(Default)]
pub struct LocalStore {
    records: HashMap<String, StoredRecord>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: DhtKey, value: Vec<u8>) {
        self.insert_at(key, value, now_ms());
    }

    /// Insert with an explicit timestamp; the seam tests use to drive expiry.
    pub fn insert_at(&mut self, key: DhtKey, value: Vec<u8>, now: u64) {
        self.records.insert(
            key.printable(),
            StoredRecord {
                key,
                value,
                inserted_ms: now,
            },
        );
    }

    pub fn get(&self, key: &DhtKey) -> Option<Vec<u8>> {
        self.records.get(&key.printable()).map(|r| r.value.clone())
    }

    pub fn remove(&mut self, key: &DhtKey) -> bool {
        self.records.remove(&key.printable()).is_some()
    }

    /// Drop records older than the TTL. Returns how many were removed.
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_sub(r.inserted_ms) <= RECORD_TTL_MS);
        before - self.records.len()
    }

    pub fn snapshot(&self) -> Vec<(DhtKey, Vec<u8>)> {
        self.records
            .values()
            .map(|r| (r.key.clone(), r.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// Protocol engine
// ============================================================================

enum LookupOutcome {
    Peers(Vec<Peer>),
    Value(Vec<u8>),
}

type PendingQueue<T> = HashMap<SocketAddr, VecDeque<(u64, oneshot::Sender<T>)>>;

/// The protocol engine: inbound dispatch, iterative lookups, replication,
/// and the maintenance operations the node worker drives on a timer.
pub struct Dht {
    endpoint: Arc<RpcEndpoint>,
    table: RoutingTable,
    store: Mutex<LocalStore>,
    puncher: Arc<HolePuncher>,
    pending_queries: Mutex<PendingQueue<RpcMessage>>,
    pending_pings: Mutex<PendingQueue<()>>,
    next_token: AtomicU64,
}

impl Dht {
    pub fn new(endpoint: Arc<RpcEndpoint>, puncher: Arc<HolePuncher>) -> Arc<Self> {
        let local_id = endpoint.local().id;
        Arc::new(Self {
            endpoint,
            table: RoutingTable::new(local_id),
            store: Mutex::new(LocalStore::new()),
            puncher,
            pending_queries: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        })
    }

    pub fn local_peer(&self) -> Peer {
        self.endpoint.local().clone()
    }

    pub fn local_id(&self) -> NodeId {
        self.endpoint.local().id
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn stored_records(&self) -> usize {
        lock_or_recover(&self.store).len()
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Dispatch one decoded RPC received from `src`. The sender is upserted
    /// into the routing table first, refreshing its liveness.
    pub async fn handle_rpc(self: &Arc<Self>, msg: RpcMessage, src: SocketAddr) {
        let sender = msg.sender_peer();
        self.table.add(sender.clone());

        match msg.kind {
            RpcKind::Ping => {
                if self.resolve_pending_ping(&src) {
                    // The echo we were waiting for; do not echo back.
                    return;
                }
                self.endpoint.send(&sender, RpcKind::Ping, Vec::new()).await;
            }
            RpcKind::Store => match decode_store_payload(&msg.payload) {
                Ok((key_bytes, value)) => {
                    let key = DhtKey::new(key_bytes);
                    debug!(key = %key, from = %sender.id, len = value.len(), "storing record");
                    lock_or_recover(&self.store).insert(key, value);
                }
                Err(e) => debug!(error = %e, from = %sender.id, "dropping malformed store"),
            },
            RpcKind::FindNode => {
                if is_find_node_request(&msg.payload) {
                    let target = match std::str::from_utf8(&msg.payload)
                        .map_err(|_| ())
                        .and_then(|s| NodeId::from_hex(s).map_err(|_| ()))
                    {
                        Ok(target) => target,
                        Err(()) => return,
                    };
                    let closest = self.table.closest(&target, K);
                    self.endpoint
                        .send(&sender, RpcKind::FindNode, encode_peer_list(&closest))
                        .await;
                } else if !self.resolve_pending_query(&src, msg) {
                    trace!(from = %sender.id, "find_node reply with no pending query");
                }
            }
            RpcKind::FindValue => {
                if self.resolve_pending_query(&src, msg.clone()) {
                    return;
                }
                let key = DhtKey::new(msg.payload.clone());
                let local_hit = lock_or_recover(&self.store).get(&key);
                match local_hit {
                    Some(value) => {
                        self.endpoint.send(&sender, RpcKind::FindValue, value).await;
                    }
                    None => {
                        let closest = self.table.closest(&key.routing_id(), K);
                        self.endpoint
                            .send(&sender, RpcKind::FindNode, encode_peer_list(&closest))
                            .await;
                    }
                }
            }
            RpcKind::HolePunchRequest => {
                let puncher = Arc::clone(&self.puncher);
                let requester = sender.clone();
                // The responder sleeps between packet bursts; never on the
                // receive path.
                tokio::spawn(async move {
                    puncher.respond(&requester).await;
                });
                self.endpoint
                    .send(&sender, RpcKind::HolePunchResponse, Vec::new())
                    .await;
            }
            RpcKind::HolePunchResponse => {
                debug!(from = %sender.id, "hole punch response observed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Reply correlation
    // ------------------------------------------------------------------

    fn register<T>(&self, map: &Mutex<PendingQueue<T>>, at: SocketAddr) -> (u64, oneshot::Receiver<T>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_or_recover(map)
            .entry(at)
            .or_default()
            .push_back((token, tx));
        (token, rx)
    }

    fn unregister<T>(map: &Mutex<PendingQueue<T>>, at: &SocketAddr, token: u64) {
        let mut pending = lock_or_recover(map);
        if let Some(queue) = pending.get_mut(at) {
            queue.retain(|(t, _)| *t != token);
            if queue.is_empty() {
                pending.remove(at);
            }
        }
    }

    fn resolve_front<T>(map: &Mutex<PendingQueue<T>>, at: &SocketAddr, value: T) -> bool {
        let mut pending = lock_or_recover(map);
        if let Some(queue) = pending.get_mut(at) {
            if let Some((_, tx)) = queue.pop_front() {
                if queue.is_empty() {
                    pending.remove(at);
                }
                return tx.send(value).is_ok();
            }
        }
        false
    }

    fn resolve_pending_query(&self, from: &SocketAddr, msg: RpcMessage) -> bool {
        Self::resolve_front(&self.pending_queries, from, msg)
    }

    fn resolve_pending_ping(&self, from: &SocketAddr) -> bool {
        Self::resolve_front(&self.pending_pings, from, ())
    }

    /// Send a query and await the reply from the queried endpoint.
    async fn query(&self, to: &Peer, kind: RpcKind, payload: Vec<u8>) -> Result<RpcMessage> {
        let at = SocketAddr::from((to.ip, to.port));
        let (token, rx) = self.register(&self.pending_queries, at);
        if !self.endpoint.send(to, kind, payload).await {
            Self::unregister(&self.pending_queries, &at, token);
            return Err(Error::Transport(std::io::Error::other("send failed")));
        }
        match timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            _ => {
                Self::unregister(&self.pending_queries, &at, token);
                Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "query timed out",
                )))
            }
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Correlated ping: send PING, await the peer's echo.
    pub async fn ping(&self, peer: &Peer) -> bool {
        let at = SocketAddr::from((peer.ip, peer.port));
        let (token, rx) = self.register(&self.pending_pings, at);
        if !self.endpoint.send(peer, RpcKind::Ping, Vec::new()).await {
            Self::unregister(&self.pending_pings, &at, token);
            return false;
        }
        match timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(())) => true,
            _ => {
                Self::unregister(&self.pending_pings, &at, token);
                false
            }
        }
    }

    /// Join the overlay through a known endpoint. The seed's real ID is
    /// unknown until it answers, so it enters the table under a random
    /// placeholder that liveness eviction eventually clears.
    pub async fn bootstrap(self: &Arc<Self>, ip: std::net::Ipv4Addr, port: u16) -> Result<()> {
        let seed = Peer::new(NodeId::random(), ip, port);
        debug!(seed = %seed, "bootstrapping");
        self.table.add(seed);
        self.lookup_nodes(self.local_id()).await?;
        Ok(())
    }

    /// Iterative FIND_NODE lookup, run to termination. Returns up to K peers
    /// closest to `target`, ascending by distance.
    pub async fn lookup_nodes(self: &Arc<Self>, target: NodeId) -> Result<Vec<Peer>> {
        match self.lookup(target, None).await? {
            LookupOutcome::Peers(peers) => Ok(peers),
            LookupOutcome::Value(_) => unreachable!("node lookup cannot yield a value"),
        }
    }

    /// Iterative FIND_VALUE lookup. Halts as soon as any peer returns the
    /// value; otherwise `NotFound` after termination.
    async fn lookup_value(self: &Arc<Self>, key: &DhtKey) -> Result<Vec<u8>> {
        match self.lookup(key.routing_id(), Some(key)).await? {
            LookupOutcome::Value(value) => Ok(value),
            LookupOutcome::Peers(_) => Err(Error::NotFound),
        }
    }

    async fn lookup(
        self: &Arc<Self>,
        target: NodeId,
        value_key: Option<&DhtKey>,
    ) -> Result<LookupOutcome> {
        let mut shortlist = self.table.closest(&target, ALPHA);
        if shortlist.is_empty() {
            return Err(Error::RoutingEmpty);
        }

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|p| p.id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        // Peers that answered with a node list; the cache-write target pool
        // for value lookups.
        let mut node_responders: Vec<Peer> = Vec::new();
        let mut best = shortlist[0].id.distance(&target);

        for round in 0.. {
            if round >= MAX_LOOKUP_ROUNDS {
                warn!(target = %target, rounds = round, "lookup exceeded round backstop");
                break;
            }

            let candidates: Vec<Peer> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.id))
                .take(ALPHA)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }

            let mut join_set = JoinSet::new();
            for peer in candidates {
                let dht = Arc::clone(self);
                let payload = match value_key {
                    Some(key) => key.bytes().to_vec(),
                    None => target.to_hex().into_bytes(),
                };
                let kind = if value_key.is_some() {
                    RpcKind::FindValue
                } else {
                    RpcKind::FindNode
                };
                join_set.spawn(async move {
                    let reply = dht.query(&peer, kind, payload).await;
                    (peer, reply)
                });
            }

            let mut any_closer = false;
            while let Some(joined) = join_set.join_next().await {
                let Ok((peer, reply)) = joined else { continue };
                match reply {
                    Ok(msg) if msg.kind == RpcKind::FindValue && value_key.is_some() => {
                        let value = msg.payload;
                        self.cache_write(value_key, &node_responders, &target, &value)
                            .await;
                        return Ok(LookupOutcome::Value(value));
                    }
                    Ok(msg) => {
                        node_responders.push(peer);
                        for found in decode_peer_list(&msg.payload) {
                            if found.id == self.local_id() {
                                continue;
                            }
                            self.table.add(found.clone());
                            if seen.insert(found.id) {
                                if distance_cmp(&found.id.distance(&target), &best)
                                    == std::cmp::Ordering::Less
                                {
                                    any_closer = true;
                                }
                                shortlist.push(found);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %peer.id, error = %e, "lookup query failed");
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                distance_cmp(&a.id.distance(&target), &b.id.distance(&target))
                    .then_with(|| a.id.cmp(&b.id))
            });
            shortlist.truncate(K);

            if let Some(first) = shortlist.first() {
                let new_best = first.id.distance(&target);
                if distance_cmp(&new_best, &best) == std::cmp::Ordering::Less {
                    best = new_best;
                    any_closer = true;
                }
            }

            if !any_closer {
                break;
            }
        }

        debug!(
            target = %target,
            found = shortlist.len(),
            queried = queried.len(),
            "iterative lookup completed"
        );
        Ok(LookupOutcome::Peers(shortlist))
    }

    /// Cache-write: after a value hit, replicate the record to the closest
    /// peer that answered with nodes instead of the value.
    async fn cache_write(
        &self,
        value_key: Option<&DhtKey>,
        node_responders: &[Peer],
        target: &NodeId,
        value: &[u8],
    ) {
        let Some(key) = value_key else { return };
        let Some(nearest_miss) = node_responders.iter().min_by(|a, b| {
            distance_cmp(&a.id.distance(target), &b.id.distance(target))
        }) else {
            return;
        };
        debug!(key = %key, peer = %nearest_miss.id, "cache-writing value to nearest miss");
        self.endpoint
            .send(
                nearest_miss,
                RpcKind::Store,
                encode_store_payload(key.bytes(), value),
            )
            .await;
    }

    /// Store a record on the K peers closest to `SHA1(key)`, keeping a local
    /// copy. Returns `Ok(true)` only if every STORE left the socket; partial
    /// failure leaves the local copy in place and reports `Ok(false)`.
    pub async fn store(self: &Arc<Self>, key: DhtKey, value: Vec<u8>) -> Result<bool> {
        let target = key.routing_id();
        let peers = self.lookup_nodes(target).await?;

        lock_or_recover(&self.store).insert(key.clone(), value.clone());

        let payload = encode_store_payload(key.bytes(), &value);
        let mut all_ok = true;
        for peer in &peers {
            if !self
                .endpoint
                .send(peer, RpcKind::Store, payload.clone())
                .await
            {
                all_ok = false;
            }
        }
        debug!(key = %key, replicas = peers.len(), all_ok, "store complete");
        Ok(all_ok)
    }

    /// Resolve a key to its value: local store first, then the network.
    pub async fn find_value(self: &Arc<Self>, key: &DhtKey) -> Result<Vec<u8>> {
        if let Some(value) = lock_or_recover(&self.store).get(key) {
            return Ok(value);
        }
        self.lookup_value(key).await
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Refresh every bucket by looking up a target that differs from the
    /// local ID at exactly that bucket's bit. Best-effort; failures logged.
    pub async fn refresh_buckets(self: &Arc<Self>) {
        for i in 0..KEY_BITS {
            let target = self.local_id().flip_bit(i);
            if let Err(e) = self.lookup_nodes(target).await {
                trace!(bucket = i, error = %e, "bucket refresh lookup failed");
            }
        }
    }

    /// Re-replicate every locally held record. The store lock is released
    /// before any RPC goes out.
    pub async fn republish(self: &Arc<Self>) {
        let records = lock_or_recover(&self.store).snapshot();
        for (key, value) in records {
            if let Err(e) = self.store(key.clone(), value).await {
                debug!(key = %key, error = %e, "republish failed");
            }
        }
    }

    /// Drop records past their TTL.
    pub fn expire_records(&self) -> usize {
        let removed = lock_or_recover(&self.store).expire(now_ms());
        if removed > 0 {
            debug!(removed, "expired records");
        }
        removed
    }

    /// One maintenance pass: refresh, republish, expire, in that order.
    pub async fn maintenance_pass(self: &Arc<Self>) {
        self.refresh_buckets().await;
        self.republish().await;
        self.expire_records();
    }

    #[cfg(test)]
    pub(crate) fn store_handle(&self) -> MutexGuard<'_, LocalStore> {
        lock_or_recover(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::identity::KEY_BYTES;
    use crate::protocols::RpcSender;
    use crate::transport::Transport;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; KEY_BYTES];
        bytes[0] = b;
        NodeId::from_raw(bytes)
    }

    fn id_with_last_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; KEY_BYTES];
        bytes[19] = b;
        NodeId::from_raw(bytes)
    }

    fn peer(id: NodeId) -> Peer {
        Peer::new(id, Ipv4Addr::new(10, 0, 0, 1), 4000)
    }

    async fn test_dht() -> Arc<Dht> {
        let transport = Transport::bind(0).await.unwrap();
        let local = Peer::new(NodeId::random(), Ipv4Addr::LOCALHOST, transport.local_port());
        let endpoint = Arc::new(RpcEndpoint::new(transport, local));
        let sender: Arc<dyn RpcSender> = Arc::clone(&endpoint) as Arc<dyn RpcSender>;
        let puncher = Arc::new(HolePuncher::new(sender, Some(Ipv4Addr::LOCALHOST), endpoint.local().port));
        Dht::new(endpoint, puncher)
    }

    #[test]
    fn test_bucket_index_placement() {
        let local = NodeId::from_raw([0u8; KEY_BYTES]);

        assert_eq!(bucket_index(&local, &id_with_first_byte(0x80)), 0);
        assert_eq!(bucket_index(&local, &id_with_first_byte(0x40)), 1);
        assert_eq!(bucket_index(&local, &id_with_last_byte(0x01)), 159);
    }

    #[test]
    fn test_bucket_index_is_first_differing_bit() {
        let local = NodeId::random();
        for i in [0, 5, 8, 42, 159] {
            let other = local.flip_bit(i);
            assert_eq!(bucket_index(&local, &other), i);
        }
    }

    #[test]
    fn test_closest_sorted_by_distance() {
        let table = RoutingTable::new(NodeId::from_raw([0xAA; KEY_BYTES]));
        let a = id_with_last_byte(0x01);
        let b = id_with_last_byte(0x02);
        let c = id_with_last_byte(0x04);
        for id in [c, a, b] {
            table.add(peer(id));
        }

        let target = NodeId::from_raw([0u8; KEY_BYTES]);
        let closest = table.closest(&target, 3);
        assert_eq!(
            closest.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![a, b, c]
        );

        // result size is min(n, total peers)
        assert_eq!(table.closest(&target, 10).len(), 3);
        assert_eq!(table.closest(&target, 2).len(), 2);
    }

    #[test]
    fn test_table_never_admits_local_id() {
        let local = NodeId::random();
        let table = RoutingTable::new(local);
        assert_eq!(table.add(peer(local)), AddOutcome::Rejected);
        assert!(table.is_empty());
    }

    #[test]
    fn test_bucket_reobservation_moves_to_tail() {
        let mut bucket = KBucket::new();
        let now = now_ms();
        let first = peer(NodeId::random());
        let second = peer(NodeId::random());
        bucket.add(first.clone(), now);
        bucket.add(second.clone(), now);

        assert_eq!(bucket.add(first.clone(), now), AddOutcome::Accepted);
        let order = bucket.snapshot();
        assert_eq!(order[0].id, second.id);
        assert_eq!(order[1].id, first.id);
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_bucket_lru_replacement() {
        let mut bucket = KBucket::new();
        let now = now_ms();
        for _ in 0..K {
            bucket.add(peer(NodeId::random()), now);
        }
        assert!(bucket.is_full());
        let head = bucket.snapshot()[0].clone();

        // all peers live: newcomer rejected, contents unchanged
        let q = peer(NodeId::random());
        assert_eq!(bucket.add(q.clone(), now), AddOutcome::Rejected);
        assert!(bucket.get(&q.id).is_none());
        assert_eq!(bucket.len(), K);

        // stale head: newcomer replaces it
        bucket.peers[0].last_seen = now - 30 * 60 * 1000;
        assert_eq!(bucket.add(q.clone(), now), AddOutcome::Replaced);
        assert!(bucket.get(&head.id).is_none());
        assert_eq!(bucket.get(&q.id).unwrap().id, q.id);
        assert_eq!(bucket.len(), K);
    }

    #[test]
    fn test_bucket_remove_idempotent() {
        let mut bucket = KBucket::new();
        let p = peer(NodeId::random());
        bucket.add(p.clone(), now_ms());
        bucket.remove(&p.id);
        bucket.remove(&p.id);
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_store_expiry_boundary() {
        let mut store = LocalStore::new();
        let now = now_ms();
        store.insert_at(DhtKey::from_str_bytes("fresh"), b"v".to_vec(), now);
        store.insert_at(
            DhtKey::from_str_bytes("exactly"),
            b"v".to_vec(),
            now - RECORD_TTL_MS,
        );
        store.insert_at(
            DhtKey::from_str_bytes("stale"),
            b"v".to_vec(),
            now - RECORD_TTL_MS - 1000,
        );

        assert_eq!(store.expire(now), 1);
        assert!(store.get(&DhtKey::from_str_bytes("fresh")).is_some());
        assert!(store.get(&DhtKey::from_str_bytes("exactly")).is_some());
        assert!(store.get(&DhtKey::from_str_bytes("stale")).is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_store_remove_drops_record_and_timestamp() {
        let mut store = LocalStore::new();
        let key = DhtKey::from_str_bytes("k");
        store.insert(key.clone(), b"v".to_vec());
        assert!(store.remove(&key));
        assert!(!store.remove(&key));
        assert!(store.get(&key).is_none());
        // a re-inserted record starts a fresh TTL
        store.insert_at(key.clone(), b"v2".to_vec(), now_ms());
        assert_eq!(store.expire(now_ms()), 0);
    }

    fn src_of(peer: &Peer) -> SocketAddr {
        SocketAddr::from((peer.ip, peer.port))
    }

    #[tokio::test]
    async fn test_handle_store_inserts_record() {
        let dht = test_dht().await;
        let sender = Peer::new(NodeId::random(), Ipv4Addr::LOCALHOST, 45000);
        let msg = RpcMessage::new(
            RpcKind::Store,
            sender.id,
            dht.local_id(),
            sender.ip,
            sender.port,
            encode_store_payload(b"greeting", b"hello"),
        );

        dht.handle_rpc(msg, src_of(&sender)).await;

        let key = DhtKey::from_str_bytes("greeting");
        assert_eq!(dht.store_handle().get(&key).unwrap(), b"hello");
        // the sender was upserted into the routing table
        assert!(dht.table().get(&sender.id).is_some());
    }

    #[tokio::test]
    async fn test_handle_ping_echoes() {
        let dht = test_dht().await;

        // an auxiliary socket plays the remote peer
        let remote = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let remote_port = remote.local_addr().unwrap().port();
        let remote_id = NodeId::random();

        let msg = RpcMessage::new(
            RpcKind::Ping,
            remote_id,
            dht.local_id(),
            Ipv4Addr::LOCALHOST,
            remote_port,
            Vec::new(),
        );
        dht.handle_rpc(msg, SocketAddr::from((Ipv4Addr::LOCALHOST, remote_port)))
            .await;

        let mut buf = [0u8; 1024];
        let (len, _) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .expect("no echo received")
            .unwrap();
        let echo = RpcMessage::decode(&buf[..len]).unwrap();
        assert_eq!(echo.kind, RpcKind::Ping);
        assert_eq!(echo.receiver, remote_id);
    }

    #[tokio::test]
    async fn test_handle_find_value_miss_returns_peers() {
        let dht = test_dht().await;
        let known = Peer::new(NodeId::random(), Ipv4Addr::new(10, 0, 0, 9), 4009);
        dht.table().add(known.clone());

        let remote = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let remote_port = remote.local_addr().unwrap().port();

        let msg = RpcMessage::new(
            RpcKind::FindValue,
            NodeId::random(),
            dht.local_id(),
            Ipv4Addr::LOCALHOST,
            remote_port,
            b"missing-key".to_vec(),
        );
        dht.handle_rpc(msg, SocketAddr::from((Ipv4Addr::LOCALHOST, remote_port)))
            .await;

        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .expect("no reply received")
            .unwrap();
        let reply = RpcMessage::decode(&buf[..len]).unwrap();
        assert_eq!(reply.kind, RpcKind::FindNode);
        let peers = decode_peer_list(&reply.payload);
        assert!(peers.iter().any(|p| p.id == known.id));
    }

    #[tokio::test]
    async fn test_handle_find_value_hit_returns_value() {
        let dht = test_dht().await;
        let key = DhtKey::from_str_bytes("present");
        dht.store_handle().insert(key.clone(), b"payload".to_vec());

        let remote = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let remote_port = remote.local_addr().unwrap().port();

        let msg = RpcMessage::new(
            RpcKind::FindValue,
            NodeId::random(),
            dht.local_id(),
            Ipv4Addr::LOCALHOST,
            remote_port,
            key.bytes().to_vec(),
        );
        dht.handle_rpc(msg, SocketAddr::from((Ipv4Addr::LOCALHOST, remote_port)))
            .await;

        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .expect("no reply received")
            .unwrap();
        let reply = RpcMessage::decode(&buf[..len]).unwrap();
        assert_eq!(reply.kind, RpcKind::FindValue);
        assert_eq!(reply.payload, b"payload");
    }

    #[tokio::test]
    async fn test_lookup_with_empty_table_fails() {
        let dht = test_dht().await;
        match dht.lookup_nodes(NodeId::random()).await {
            Err(Error::RoutingEmpty) => {}
            other => panic!("expected RoutingEmpty, got {other:?}"),
        }
    }
}
