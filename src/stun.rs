//! # STUN binding client
//!
//! A minimal subset of RFC 5389: fire a Binding request at a public STUN
//! server and read back the publicly visible endpoint from the response's
//! XOR-MAPPED-ADDRESS (or legacy MAPPED-ADDRESS) attribute.
//!
//! Wire layout, network byte order throughout:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Magic Cookie 0x2112A442                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Transaction ID (96 bits)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Attributes are TLVs padded to 4-byte boundaries. XOR-MAPPED-ADDRESS
//! encodes `port ^ (cookie >> 16)` and `addr ^ cookie`.

use std::net::Ipv4Addr;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::error::{Error, Result};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112_A442;

const HEADER_LEN: usize = 20;
const FAMILY_IPV4: u8 = 0x01;

/// Per-server response timeout.
const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Well-known public STUN servers, tried in order.
pub const STUN_SERVERS: &[(&str, u16)] = &[
    ("stun.l.google.com", 19302),
    ("stun1.l.google.com", 19302),
    ("stun2.l.google.com", 19302),
    ("stun.ekiga.net", 3478),
    ("stun.ideasip.com", 3478),
    ("stun.schlund.de", 3478),
];

/// A publicly visible `ip:port` as reported by a STUN server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl std::fmt::Display for PublicEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Build a Binding request with the given transaction ID.
pub fn encode_binding_request(transaction_id: &[u8; 12]) -> [u8; HEADER_LEN] {
    let mut req = [0u8; HEADER_LEN];
    req[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length 0: no attributes
    req[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    req[8..].copy_from_slice(transaction_id);
    req
}

/// Parse a Binding response, returning the mapped endpoint.
///
/// Requires the success-response type, the magic cookie, and a matching
/// transaction ID. XOR-MAPPED-ADDRESS is preferred over MAPPED-ADDRESS
/// wherever both appear; only the IPv4 family is understood.
pub fn parse_binding_response(
    response: &[u8],
    transaction_id: &[u8; 12],
) -> Option<PublicEndpoint> {
    if response.len() < HEADER_LEN {
        return None;
    }
    let msg_type = u16::from_be_bytes([response[0], response[1]]);
    if msg_type != BINDING_RESPONSE {
        return None;
    }
    let cookie = u32::from_be_bytes([response[4], response[5], response[6], response[7]]);
    if cookie != MAGIC_COOKIE {
        return None;
    }
    if &response[8..20] != transaction_id {
        return None;
    }
    let msg_len = u16::from_be_bytes([response[2], response[3]]) as usize;

    let mut xor_mapped = None;
    let mut mapped = None;

    let mut pos = HEADER_LEN;
    while pos + 4 <= response.len() && pos - HEADER_LEN < msg_len {
        let attr_type = u16::from_be_bytes([response[pos], response[pos + 1]]);
        let attr_len = u16::from_be_bytes([response[pos + 2], response[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > response.len() {
            break;
        }
        let attr = &response[pos..pos + attr_len];

        if attr_len >= 8 && attr[1] == FAMILY_IPV4 {
            let raw_port = u16::from_be_bytes([attr[2], attr[3]]);
            let raw_addr = u32::from_be_bytes([attr[4], attr[5], attr[6], attr[7]]);
            match attr_type {
                ATTR_XOR_MAPPED_ADDRESS => {
                    xor_mapped = Some(PublicEndpoint {
                        ip: Ipv4Addr::from(raw_addr ^ MAGIC_COOKIE),
                        port: raw_port ^ (MAGIC_COOKIE >> 16) as u16,
                    });
                }
                ATTR_MAPPED_ADDRESS => {
                    mapped = Some(PublicEndpoint {
                        ip: Ipv4Addr::from(raw_addr),
                        port: raw_port,
                    });
                }
                _ => {}
            }
        }

        pos += attr_len;
        // attributes are padded to 4-byte boundaries
        if attr_len % 4 != 0 {
            pos += 4 - attr_len % 4;
        }
    }

    xor_mapped.or(mapped)
}

/// Query one server through the given socket.
pub async fn query_via(socket: &UdpSocket, server: (&str, u16)) -> Result<PublicEndpoint> {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill(&mut transaction_id[..]);
    let request = encode_binding_request(&transaction_id);

    socket.send_to(&request, server).await?;

    let mut buf = [0u8; 1024];
    let (len, _) = timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::StunFailure)??;

    parse_binding_response(&buf[..len], &transaction_id).ok_or(Error::StunFailure)
}

/// Query one server from a fresh ephemeral socket.
pub async fn query_server(server: (&str, u16)) -> Result<PublicEndpoint> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    query_via(&socket, server).await
}

/// Discover our public endpoint: first server that answers wins.
pub async fn public_endpoint() -> Result<PublicEndpoint> {
    for &server in STUN_SERVERS {
        match query_server(server).await {
            Ok(endpoint) => {
                debug!(server = server.0, %endpoint, "public endpoint discovered");
                return Ok(endpoint);
            }
            Err(e) => {
                debug!(server = server.0, error = %e, "stun query failed");
            }
        }
    }
    Err(Error::StunFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXN: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    fn response_header(len: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&TXN);
        out
    }

    fn xor_mapped_attr(ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.push(0); // reserved
        out.push(FAMILY_IPV4);
        out.extend_from_slice(&(port ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        out.extend_from_slice(&(u32::from(ip) ^ MAGIC_COOKIE).to_be_bytes());
        out
    }

    fn mapped_attr(ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.push(0);
        out.push(FAMILY_IPV4);
        out.extend_from_slice(&port.to_be_bytes());
        out.extend_from_slice(&u32::from(ip).to_be_bytes());
        out
    }

    #[test]
    fn test_binding_request_layout() {
        let req = encode_binding_request(&TXN);
        assert_eq!(req.len(), 20);
        assert_eq!(&req[0..2], &[0x00, 0x01]);
        assert_eq!(&req[2..4], &[0x00, 0x00]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&req[8..], &TXN);
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let ip = Ipv4Addr::new(203, 0, 113, 45);
        let attr = xor_mapped_attr(ip, 54321);
        let mut response = response_header(attr.len() as u16);
        response.extend_from_slice(&attr);

        let endpoint = parse_binding_response(&response, &TXN).unwrap();
        assert_eq!(endpoint.ip, ip);
        assert_eq!(endpoint.port, 54321);
    }

    #[test]
    fn test_parse_mapped_address_fallback() {
        let ip = Ipv4Addr::new(198, 51, 100, 7);
        let attr = mapped_attr(ip, 8080);
        let mut response = response_header(attr.len() as u16);
        response.extend_from_slice(&attr);

        let endpoint = parse_binding_response(&response, &TXN).unwrap();
        assert_eq!(endpoint, PublicEndpoint { ip, port: 8080 });
    }

    #[test]
    fn test_xor_mapped_preferred_over_mapped() {
        let xor_ip = Ipv4Addr::new(203, 0, 113, 45);
        let mapped_ip = Ipv4Addr::new(198, 51, 100, 7);
        // MAPPED first on the wire; XOR form must still win
        let mut attrs = mapped_attr(mapped_ip, 1111);
        attrs.extend_from_slice(&xor_mapped_attr(xor_ip, 2222));
        let mut response = response_header(attrs.len() as u16);
        response.extend_from_slice(&attrs);

        let endpoint = parse_binding_response(&response, &TXN).unwrap();
        assert_eq!(endpoint.ip, xor_ip);
        assert_eq!(endpoint.port, 2222);
    }

    #[test]
    fn test_parser_skips_padded_unknown_attributes() {
        // SOFTWARE attribute with a 5-byte value, padded to 8
        let mut attrs = Vec::new();
        attrs.extend_from_slice(&0x8022u16.to_be_bytes());
        attrs.extend_from_slice(&5u16.to_be_bytes());
        attrs.extend_from_slice(b"burro");
        attrs.extend_from_slice(&[0, 0, 0]); // padding
        let ip = Ipv4Addr::new(203, 0, 113, 45);
        attrs.extend_from_slice(&xor_mapped_attr(ip, 54321));

        let mut response = response_header(attrs.len() as u16);
        response.extend_from_slice(&attrs);

        let endpoint = parse_binding_response(&response, &TXN).unwrap();
        assert_eq!(endpoint.ip, ip);
    }

    #[test]
    fn test_parser_rejects_bad_responses() {
        let ip = Ipv4Addr::new(203, 0, 113, 45);
        let attr = xor_mapped_attr(ip, 54321);

        // wrong message type
        let mut response = response_header(attr.len() as u16);
        response[0] = 0x00;
        response[1] = 0x11;
        response.extend_from_slice(&attr);
        assert!(parse_binding_response(&response, &TXN).is_none());

        // wrong cookie
        let mut response = response_header(attr.len() as u16);
        response[4] = 0;
        response.extend_from_slice(&attr);
        assert!(parse_binding_response(&response, &TXN).is_none());

        // mismatched transaction id
        let mut other_txn = TXN;
        other_txn[0] ^= 0xFF;
        let mut response = response_header(attr.len() as u16);
        response.extend_from_slice(&attr);
        assert!(parse_binding_response(&response, &other_txn).is_none());

        // truncated
        assert!(parse_binding_response(&[0u8; 10], &TXN).is_none());
    }
}
