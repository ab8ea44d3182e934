//! # Node identifiers, peers, and DHT keys
//!
//! This module defines the core identity types used throughout Burrow:
//!
//! - [`NodeId`]: 160-bit identifier with the Kademlia XOR metric
//! - [`Peer`]: a known remote endpoint with a liveness timestamp
//! - [`DhtKey`]: an application key, routed by its SHA-1 digest
//!
//! ## Identity model
//!
//! A node's identifier is 20 random bytes drawn at startup. Identifiers are
//! totally ordered (lexicographic on the byte array) and compared for routing
//! purposes by XOR distance: `distance(a, b) = a ^ b`, which is symmetric,
//! zero only on equality, and satisfies `d(a, c) == d(a, b) ^ d(b, c)`.
//!
//! DHT keys are arbitrary byte strings; the identifier that decides which
//! peers hold a key is `SHA1(key bytes)`, so keys and node IDs share one
//! metric space.
//!
//! ## Invariants
//!
//! - `NodeId::from_hex(id.to_hex()) == id` for every ID
//! - `distance` is symmetric and `distance(a, a) == [0; 20]`
//! - bit 0 of an ID is the most significant bit of byte 0

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Number of bits in a node identifier.
pub const KEY_BITS: usize = 160;

/// Number of bytes in a node identifier.
pub const KEY_BYTES: usize = KEY_BITS / 8;

/// How long a peer stays live without being re-observed (15 minutes).
pub const PEER_LIVENESS_MS: u64 = 15 * 60 * 1000;

/// XOR distance between two identifiers.
pub type Distance = [u8; KEY_BYTES];

/// Returns current time as milliseconds since Unix epoch.
/// Used for peer liveness and stored-record timestamps.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// NodeId
// ============================================================================

/// A 160-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; KEY_BYTES]);

impl NodeId {
    #[inline]
    pub fn from_raw(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// Construct from a byte slice, rejecting anything but exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_BYTES {
            return Err(Error::InvalidInput(format!(
                "node id must be {KEY_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; KEY_BYTES];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Parse from 40 hex digits, case-insensitive.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != KEY_BYTES * 2 {
            return Err(Error::InvalidInput(format!(
                "node id must be {} hex digits, got {}",
                KEY_BYTES * 2,
                s.len()
            )));
        }
        let bytes =
            hex::decode(s).map_err(|e| Error::InvalidInput(format!("invalid hex id: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// XOR distance to another identifier.
    #[inline]
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; KEY_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bit `i`, MSB-first: bit 0 is the most significant bit of byte 0.
    #[inline]
    pub fn bit(&self, i: usize) -> bool {
        debug_assert!(i < KEY_BITS);
        (self.0[i / 8] >> (7 - (i % 8))) & 1 == 1
    }

    #[inline]
    pub fn byte(&self, i: usize) -> u8 {
        self.0[i]
    }

    /// A copy with bit `i` flipped. Used to build bucket-refresh targets that
    /// differ from the local ID at exactly one position.
    pub fn flip_bit(&self, i: usize) -> NodeId {
        debug_assert!(i < KEY_BITS);
        let mut bytes = self.0;
        bytes[i / 8] ^= 1 << (7 - (i % 8));
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compare two XOR distances lexicographically.
///
/// Used to decide which of two identifiers is closer to a target in the
/// Kademlia metric space.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> std::cmp::Ordering {
    a.cmp(b)
}

/// The routing identifier for arbitrary key bytes.
pub fn sha1_id(bytes: &[u8]) -> NodeId {
    let digest = Sha1::digest(bytes);
    let mut arr = [0u8; KEY_BYTES];
    arr.copy_from_slice(&digest);
    NodeId(arr)
}

// ============================================================================
// Peer
// ============================================================================

/// A known remote node: identifier, IPv4 endpoint, and when we last heard
/// from it. Equality and hashing are by `id` alone; the endpoint fields are
/// advisory and refreshed whenever the peer is re-observed.
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: NodeId,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub last_seen: u64,
}

impl Peer {
    pub fn new(id: NodeId, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            id,
            ip,
            port,
            last_seen: now_ms(),
        }
    }

    /// Refresh the liveness timestamp. Monotonic: a stale observer can never
    /// move `last_seen` backwards.
    pub fn touch(&mut self) {
        self.last_seen = self.last_seen.max(now_ms());
    }

    /// A peer is live while it has been observed within the last 15 minutes.
    #[inline]
    pub fn is_live(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) < PEER_LIVENESS_MS
    }

    /// Socket address string for UDP sends.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.ip, self.port)
    }
}

/// Parse an `ip:port` endpoint. Rejects non-IPv4 hosts and reserved ports.
pub fn parse_endpoint(s: &str) -> Result<(Ipv4Addr, u16)> {
    let (host, port_str) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidInput(format!("expected ip:port, got {s:?}")))?;
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| Error::InvalidInput(format!("invalid IPv4 address {host:?}")))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| Error::InvalidInput(format!("invalid port {port_str:?}")))?;
    if port <= 1023 {
        return Err(Error::InvalidInput(format!(
            "port {port} is reserved (must be > 1023)"
        )));
    }
    Ok((ip, port))
}

// ============================================================================
// DhtKey
// ============================================================================

/// An application-supplied key: an arbitrary byte string.
///
/// The printable form is the ASCII characters when every byte is printable
/// (`0x20..=0x7E`) and the key is non-empty, otherwise `0x` followed by
/// lower-case hex. The identifier that routes the key is `SHA1(bytes)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DhtKey {
    bytes: Vec<u8>,
}

impl DhtKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_str_bytes(s: &str) -> Self {
        Self {
            bytes: s.as_bytes().to_vec(),
        }
    }

    /// Parse a printable form back to key bytes: a `0x`-prefixed even-length
    /// hex string decodes to the raw bytes, anything else is taken as ASCII.
    pub fn from_printable(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix("0x") {
            if !rest.is_empty() && rest.len() % 2 == 0 {
                if let Ok(bytes) = hex::decode(rest) {
                    return Self { bytes };
                }
            }
        }
        Self::from_str_bytes(s)
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The identifier that decides which peers hold this key.
    pub fn routing_id(&self) -> NodeId {
        sha1_id(&self.bytes)
    }

    pub fn printable(&self) -> String {
        let all_printable =
            !self.bytes.is_empty() && self.bytes.iter().all(|&b| (0x20..=0x7E).contains(&b));
        if all_printable {
            self.bytes.iter().map(|&b| b as char).collect()
        } else {
            format!("0x{}", hex::encode(&self.bytes))
        }
    }
}

impl std::fmt::Display for DhtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.printable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_symmetric_and_zero_on_self() {
        let a = NodeId::random();
        let b = NodeId::random();

        assert_eq!(a.distance(&a), [0u8; KEY_BYTES]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_xor_identity() {
        // d(a, c) == d(a, b) ^ d(b, c), which implies the XOR triangle bound.
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();

        let ab = a.distance(&b);
        let bc = b.distance(&c);
        let ac = a.distance(&c);

        let mut combined = [0u8; KEY_BYTES];
        for i in 0..KEY_BYTES {
            combined[i] = ab[i] ^ bc[i];
        }
        assert_eq!(ac, combined);
    }

    #[test]
    fn test_distance_nonzero_for_distinct() {
        let a = NodeId::from_raw([0u8; KEY_BYTES]);
        let mut bytes = [0u8; KEY_BYTES];
        bytes[19] = 1;
        let b = NodeId::from_raw(bytes);

        assert_ne!(a.distance(&b), [0u8; KEY_BYTES]);
    }

    #[test]
    fn test_hex_round_trip() {
        for _ in 0..16 {
            let id = NodeId::random();
            let hexed = id.to_hex();
            assert_eq!(hexed.len(), 40);
            assert_eq!(NodeId::from_hex(&hexed).unwrap(), id);
        }
    }

    #[test]
    fn test_from_hex_case_insensitive() {
        let lower = "00112233445566778899aabbccddeeff00112233";
        let upper = "00112233445566778899AABBCCDDEEFF00112233";
        assert_eq!(
            NodeId::from_hex(lower).unwrap(),
            NodeId::from_hex(upper).unwrap()
        );
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex(&"z".repeat(40)).is_err());
        assert!(NodeId::from_hex(&"0".repeat(41)).is_err());
        assert!(NodeId::from_bytes(&[0u8; 19]).is_err());
        assert!(NodeId::from_bytes(&[0u8; 21]).is_err());
    }

    #[test]
    fn test_bit_indexing_msb_first() {
        let mut bytes = [0u8; KEY_BYTES];
        bytes[0] = 0x80;
        bytes[1] = 0x01;
        let id = NodeId::from_raw(bytes);

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(!id.bit(8));
        assert!(id.bit(15));
    }

    #[test]
    fn test_flip_bit_differs_at_exactly_one_position() {
        let id = NodeId::random();
        for i in [0, 7, 8, 63, 159] {
            let flipped = id.flip_bit(i);
            assert_ne!(flipped, id);
            assert_eq!(flipped.bit(i), !id.bit(i));
            assert_eq!(flipped.flip_bit(i), id);
        }
    }

    #[test]
    fn test_sha1_known_vector() {
        // SHA1("hello")
        let id = sha1_id(b"hello");
        assert_eq!(id.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[test]
    fn test_peer_liveness_threshold() {
        let mut peer = Peer::new(NodeId::random(), Ipv4Addr::LOCALHOST, 4000);
        let now = peer.last_seen;

        assert!(peer.is_live(now));
        assert!(peer.is_live(now + PEER_LIVENESS_MS - 1));
        assert!(!peer.is_live(now + PEER_LIVENESS_MS));

        // touch never moves last_seen backwards
        peer.last_seen = u64::MAX;
        peer.touch();
        assert_eq!(peer.last_seen, u64::MAX);
    }

    #[test]
    fn test_parse_endpoint() {
        let (ip, port) = parse_endpoint("192.0.2.7:4000").unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 0, 2, 7));
        assert_eq!(port, 4000);

        assert!(parse_endpoint("192.0.2.7").is_err());
        assert!(parse_endpoint("not-an-ip:4000").is_err());
        assert!(parse_endpoint("192.0.2.7:notaport").is_err());
        assert!(parse_endpoint("192.0.2.7:80").is_err());
        assert!(parse_endpoint("::1:4000").is_err());
    }

    #[test]
    fn test_dht_key_printable_ascii() {
        let key = DhtKey::from_str_bytes("hello world");
        assert_eq!(key.printable(), "hello world");
        assert_eq!(DhtKey::from_printable("hello world"), key);
    }

    #[test]
    fn test_dht_key_printable_binary() {
        let key = DhtKey::new(vec![0x00, 0x1f, 0xff]);
        assert_eq!(key.printable(), "0x001fff");
        assert_eq!(DhtKey::from_printable("0x001fff"), key);
    }

    #[test]
    fn test_dht_key_empty_is_hex_form() {
        let key = DhtKey::new(Vec::new());
        assert_eq!(key.printable(), "0x");
    }

    #[test]
    fn test_dht_key_routing_id_is_sha1() {
        let key = DhtKey::from_str_bytes("hello");
        assert_eq!(key.routing_id(), sha1_id(b"hello"));
    }
}
