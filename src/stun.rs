//! Minimal STUN binding codec (RFC 5389)
//!
//! Just enough of the protocol to learn our reflexive UDP address from a
//! public STUN server: binding requests out, XOR-MAPPED-ADDRESS parsing
//! in. The response encoder exists so a loopback STUN responder can be
//! stood up against the same codec.

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Binding request message type
const BINDING_REQUEST: u16 = 0x0001;

/// Binding success response message type
const BINDING_RESPONSE: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Fixed STUN header length
const HEADER_LEN: usize = 20;

/// Build a binding request, returning the packet and its transaction id
pub fn binding_request() -> ([u8; HEADER_LEN], [u8; 12]) {
    let mut txid = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut txid);

    let mut pkt = [0u8; HEADER_LEN];
    pkt[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Message length: no attributes
    pkt[2..4].copy_from_slice(&0u16.to_be_bytes());
    pkt[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    pkt[8..20].copy_from_slice(&txid);
    (pkt, txid)
}

/// Quick check distinguishing STUN packets from overlay datagrams sharing
/// the same socket. The first two bits of a STUN message are zero and the
/// magic cookie is fixed; sealed overlay envelopes start with a random
/// public key byte and carry no cookie at that offset.
pub fn is_stun_message(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN
        && buf[0] & 0xc0 == 0
        && buf[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Parse a binding request, returning its transaction id
pub fn parse_binding_request(buf: &[u8]) -> Result<[u8; 12]> {
    if !is_stun_message(buf) {
        return Err(Error::Stun("not a STUN message".into()));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_REQUEST {
        return Err(Error::Stun(format!("unexpected message type {msg_type:#06x}")));
    }
    let mut txid = [0u8; 12];
    txid.copy_from_slice(&buf[8..20]);
    Ok(txid)
}

/// Encode a binding success response carrying `addr` as the
/// XOR-MAPPED-ADDRESS
pub fn binding_response(txid: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let (family, xaddr): (u8, Vec<u8>) = match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            for (b, k) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                *b ^= k;
            }
            (0x01, octets.to_vec())
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(txid);
            for (b, k) in octets.iter_mut().zip(mask) {
                *b ^= k;
            }
            (0x02, octets.to_vec())
        }
    };

    let attr_len = 4 + xaddr.len();
    let mut pkt = Vec::with_capacity(HEADER_LEN + 4 + attr_len);
    pkt.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    pkt.extend_from_slice(&((4 + attr_len) as u16).to_be_bytes());
    pkt.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    pkt.extend_from_slice(txid);

    pkt.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    pkt.extend_from_slice(&(attr_len as u16).to_be_bytes());
    pkt.push(0);
    pkt.push(family);
    pkt.extend_from_slice(&xport.to_be_bytes());
    pkt.extend_from_slice(&xaddr);
    pkt
}

/// Parse a binding response and extract the reflexive address
pub fn parse_binding_response(buf: &[u8]) -> Result<SocketAddr> {
    if !is_stun_message(buf) {
        return Err(Error::Stun("not a STUN message".into()));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(Error::Stun(format!("unexpected message type {msg_type:#06x}")));
    }
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < HEADER_LEN + msg_len {
        return Err(Error::Stun("truncated response".into()));
    }
    let txid = &buf[8..20];

    // Walk attributes looking for XOR-MAPPED-ADDRESS
    let mut off = HEADER_LEN;
    let end = HEADER_LEN + msg_len;
    while off + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[off], buf[off + 1]]);
        let attr_len = u16::from_be_bytes([buf[off + 2], buf[off + 3]]) as usize;
        let value_end = off + 4 + attr_len;
        if value_end > end {
            return Err(Error::Stun("attribute overruns message".into()));
        }
        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return decode_xor_mapped(&buf[off + 4..value_end], txid);
        }
        // Attributes are padded to 4-byte boundaries
        off = value_end + (4 - attr_len % 4) % 4;
    }

    Err(Error::Stun("no XOR-MAPPED-ADDRESS attribute".into()))
}

fn decode_xor_mapped(value: &[u8], txid: &[u8]) -> Result<SocketAddr> {
    if value.len() < 8 {
        return Err(Error::Stun("short XOR-MAPPED-ADDRESS".into()));
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

    match family {
        0x01 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            for (b, k) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                *b ^= k;
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(Error::Stun("short IPv6 XOR-MAPPED-ADDRESS".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(txid);
            for (b, k) in octets.iter_mut().zip(mask) {
                *b ^= k;
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(Error::Stun(format!("unknown address family {other:#04x}"))),
    }
}
