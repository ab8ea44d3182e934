//! # Wire protocol messages
//!
//! Every RPC travels as a single UDP datagram with a text header and an
//! opaque trailing payload:
//!
//! ```text
//! <type-int>:<sender-id-hex>:<receiver-id-hex>:<sender-ip>:<sender-port>:<payload>
//! ```
//!
//! The first five fields are `:`-separated ASCII; the sixth extends to the
//! end of the datagram so payloads may contain arbitrary bytes (including
//! `:`). Payloads are type-specific:
//!
//! | Type | Request payload | Response payload |
//! |------|-----------------|------------------|
//! | `Ping` | empty | empty (echo) |
//! | `Store` | `u32-be key-len ++ key ++ value` | — |
//! | `FindNode` | 40-hex target id | newline-separated peer list |
//! | `FindValue` | raw key bytes | value bytes, or a peer list as `FindNode` |
//! | `HolePunchRequest` / `HolePunchResponse` | empty | empty |
//!
//! The frame carries no transaction ID; replies are correlated to queries by
//! sender ID (see the pending-query queues in `dht`). Undecodable datagrams
//! are dropped by the receiver.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::identity::{NodeId, Peer};

/// Maximum datagram size accepted or produced.
/// Large enough for a full K-peer list or a multi-kilobyte value.
pub const MAX_DATAGRAM: usize = 8192;

/// RPC message types. The wire value is the discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcKind {
    Ping = 0,
    Store = 1,
    FindNode = 2,
    FindValue = 3,
    HolePunchRequest = 4,
    HolePunchResponse = 5,
}

impl RpcKind {
    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(RpcKind::Ping),
            1 => Some(RpcKind::Store),
            2 => Some(RpcKind::FindNode),
            3 => Some(RpcKind::FindValue),
            4 => Some(RpcKind::HolePunchRequest),
            5 => Some(RpcKind::HolePunchResponse),
            _ => None,
        }
    }
}

/// A decoded RPC datagram.
#[derive(Clone, Debug)]
pub struct RpcMessage {
    pub kind: RpcKind,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub sender_ip: Ipv4Addr,
    pub sender_port: u16,
    pub payload: Vec<u8>,
}

impl RpcMessage {
    pub fn new(
        kind: RpcKind,
        sender: NodeId,
        receiver: NodeId,
        sender_ip: Ipv4Addr,
        sender_port: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            sender,
            receiver,
            sender_ip,
            sender_port,
            payload,
        }
    }

    /// Serialize to the wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!(
            "{}:{}:{}:{}:{}:",
            self.kind as u8,
            self.sender.to_hex(),
            self.receiver.to_hex(),
            self.sender_ip,
            self.sender_port,
        );
        let mut out = Vec::with_capacity(header.len() + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a wire frame. The payload keeps every byte after the fifth `:`.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let mut fields: Vec<&[u8]> = Vec::with_capacity(5);
        let mut rest = datagram;
        for _ in 0..5 {
            let sep = rest
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| Error::InvalidInput("truncated rpc frame".into()))?;
            fields.push(&rest[..sep]);
            rest = &rest[sep + 1..];
        }

        let ascii = |bytes: &[u8]| -> Result<String> {
            std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| Error::InvalidInput("non-ascii rpc header field".into()))
        };

        let kind_raw: u8 = ascii(fields[0])?
            .parse()
            .map_err(|_| Error::InvalidInput("bad rpc type field".into()))?;
        let kind = RpcKind::from_wire(kind_raw)
            .ok_or_else(|| Error::InvalidInput(format!("unknown rpc type {kind_raw}")))?;
        let sender = NodeId::from_hex(&ascii(fields[1])?)?;
        let receiver = NodeId::from_hex(&ascii(fields[2])?)?;
        let sender_ip: Ipv4Addr = ascii(fields[3])?
            .parse()
            .map_err(|_| Error::InvalidInput("bad sender ip".into()))?;
        let sender_port: u16 = ascii(fields[4])?
            .parse()
            .map_err(|_| Error::InvalidInput("bad sender port".into()))?;

        Ok(Self {
            kind,
            sender,
            receiver,
            sender_ip,
            sender_port,
            payload: rest.to_vec(),
        })
    }

    /// The sender's claimed endpoint as a [`Peer`].
    pub fn sender_peer(&self) -> Peer {
        Peer::new(self.sender, self.sender_ip, self.sender_port)
    }
}

// ============================================================================
// Payload codecs
// ============================================================================

/// Encode a STORE payload: 4-byte big-endian key length, key bytes, value
/// bytes. The length prefix lets key and value differ in size.
pub fn encode_store_payload(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

/// Split a STORE payload into `(key, value)`.
pub fn decode_store_payload(payload: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if payload.len() < 4 {
        return Err(Error::InvalidInput("store payload shorter than prefix".into()));
    }
    let key_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let body = &payload[4..];
    if key_len > body.len() {
        return Err(Error::InvalidInput(format!(
            "store key length {key_len} exceeds payload ({} bytes)",
            body.len()
        )));
    }
    Ok((body[..key_len].to_vec(), body[key_len..].to_vec()))
}

/// Encode a peer list as newline-separated `<id-hex>:<ip>:<port>` entries.
pub fn encode_peer_list(peers: &[Peer]) -> Vec<u8> {
    let mut out = String::new();
    for peer in peers {
        out.push_str(&peer.id.to_hex());
        out.push(':');
        out.push_str(&peer.ip.to_string());
        out.push(':');
        out.push_str(&peer.port.to_string());
        out.push('\n');
    }
    out.into_bytes()
}

/// Parse a peer list. Malformed lines are skipped rather than failing the
/// whole list; a reply that names one bad peer should not discard the rest.
pub fn decode_peer_list(payload: &[u8]) -> Vec<Peer> {
    let Ok(text) = std::str::from_utf8(payload) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let id = NodeId::from_hex(parts.next()?).ok()?;
            let ip: Ipv4Addr = parts.next()?.parse().ok()?;
            let port: u16 = parts.next()?.parse().ok()?;
            Some(Peer::new(id, ip, port))
        })
        .collect()
}

/// True when a FIND_NODE payload is a lookup request (a bare 40-hex target)
/// rather than a peer-list reply. The frame has no request/response flag, so
/// the payload shape is the discriminator.
pub fn is_find_node_request(payload: &[u8]) -> bool {
    payload.len() == 40
        && payload.iter().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(kind: RpcKind, payload: Vec<u8>) -> RpcMessage {
        RpcMessage::new(
            kind,
            NodeId::from_hex("00112233445566778899aabbccddeeff00112233").unwrap(),
            NodeId::from_hex("ffeeddccbbaa99887766554433221100ffeeddcc").unwrap(),
            Ipv4Addr::new(192, 0, 2, 1),
            4001,
            payload,
        )
    }

    #[test]
    fn test_frame_round_trip() {
        let msg = sample_message(RpcKind::FindNode, b"00112233445566778899aabbccddeeff00112233".to_vec());
        let decoded = RpcMessage::decode(&msg.encode()).unwrap();

        assert_eq!(decoded.kind, msg.kind);
        assert_eq!(decoded.sender, msg.sender);
        assert_eq!(decoded.receiver, msg.receiver);
        assert_eq!(decoded.sender_ip, msg.sender_ip);
        assert_eq!(decoded.sender_port, msg.sender_port);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_frame_payload_may_contain_separators() {
        let msg = sample_message(RpcKind::Store, b"key:with:colons\nand newlines\x00\xff".to_vec());
        let decoded = RpcMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_frame_rejects_malformed() {
        assert!(RpcMessage::decode(b"").is_err());
        assert!(RpcMessage::decode(b"9:aa:bb:cc:1:").is_err());
        assert!(RpcMessage::decode(b"0:zz:bb").is_err());
        // valid header shape but bad hex ids
        assert!(RpcMessage::decode(b"0:short:short:1.2.3.4:4000:").is_err());
        // port out of range
        let frame = format!(
            "0:{}:{}:1.2.3.4:99999:",
            "0".repeat(40),
            "1".repeat(40)
        );
        assert!(RpcMessage::decode(frame.as_bytes()).is_err());
    }

    #[test]
    fn test_store_payload_uneven_lengths() {
        let (key, value) = (b"k".as_slice(), b"a much longer value".as_slice());
        let payload = encode_store_payload(key, value);
        let (k, v) = decode_store_payload(&payload).unwrap();
        assert_eq!(k, key);
        assert_eq!(v, value);

        let payload = encode_store_payload(b"long key bytes here", b"v");
        let (k, v) = decode_store_payload(&payload).unwrap();
        assert_eq!(k, b"long key bytes here");
        assert_eq!(v, b"v");
    }

    #[test]
    fn test_store_payload_rejects_truncation() {
        assert!(decode_store_payload(b"").is_err());
        assert!(decode_store_payload(&[0, 0]).is_err());
        // prefix claims more key bytes than exist
        let mut payload = encode_store_payload(b"key", b"value");
        payload[3] = 200;
        assert!(decode_store_payload(&payload).is_err());
    }

    #[test]
    fn test_peer_list_round_trip() {
        let peers = vec![
            Peer::new(NodeId::random(), Ipv4Addr::new(10, 0, 0, 1), 4001),
            Peer::new(NodeId::random(), Ipv4Addr::new(10, 0, 0, 2), 4002),
        ];
        let decoded = decode_peer_list(&encode_peer_list(&peers));
        assert_eq!(decoded, peers);
        assert_eq!(decoded[0].ip, peers[0].ip);
        assert_eq!(decoded[1].port, peers[1].port);
    }

    #[test]
    fn test_peer_list_skips_malformed_lines() {
        let mut bytes = encode_peer_list(&[Peer::new(
            NodeId::random(),
            Ipv4Addr::new(10, 0, 0, 1),
            4001,
        )]);
        bytes.extend_from_slice(b"garbage line\n");
        bytes.extend_from_slice(b"deadbeef:1.2.3.4:not-a-port\n");
        assert_eq!(decode_peer_list(&bytes).len(), 1);
    }

    #[test]
    fn test_find_node_request_discriminator() {
        assert!(is_find_node_request(b"00112233445566778899aabbccddeeff00112233"));
        assert!(!is_find_node_request(b""));
        assert!(!is_find_node_request(b"0011"));
        // a one-entry peer list is longer than 40 bytes and contains ':'
        let list = encode_peer_list(&[Peer::new(
            NodeId::random(),
            Ipv4Addr::new(10, 0, 0, 1),
            4001,
        )]);
        assert!(!is_find_node_request(&list));
    }
}
