//! Minimal STUN binding support
//!
//! The media socket answers STUN binding requests with a success response
//! carrying XOR-MAPPED-ADDRESS, and sends periodic binding requests as
//! keepalive. This is the only STUN processing in the fabric.

use std::net::{IpAddr, SocketAddr};

use rand::RngCore;

use crate::error::{Error, Result};

/// STUN magic cookie (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Message type: binding request
pub const BINDING_REQUEST: u16 = 0x0001;

/// Message type: binding success response
pub const BINDING_SUCCESS: u16 = 0x0101;

/// Attribute type: XOR-MAPPED-ADDRESS
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// True when `buf` is a well-formed STUN binding request.
pub fn is_binding_request(buf: &[u8]) -> bool {
    buf.len() >= HEADER_SIZE
        && u16::from_be_bytes([buf[0], buf[1]]) == BINDING_REQUEST
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

/// True when `buf` is a STUN binding success response.
pub fn is_binding_success(buf: &[u8]) -> bool {
    buf.len() >= HEADER_SIZE
        && u16::from_be_bytes([buf[0], buf[1]]) == BINDING_SUCCESS
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

/// Transaction id of a STUN message.
pub fn transaction_id(buf: &[u8]) -> Option<[u8; 12]> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let mut id = [0u8; 12];
    id.copy_from_slice(&buf[8..20]);
    Some(id)
}

/// Build a binding request with a random transaction id (the keepalive probe).
pub fn binding_request() -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length stays 0, no attributes
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut buf[8..20]);
    buf
}

/// Build the binding success response for `request`, reflecting `source`
/// as XOR-MAPPED-ADDRESS.
pub fn binding_success_response(request: &[u8], source: SocketAddr) -> Result<Vec<u8>> {
    if !is_binding_request(request) {
        return Err(Error::Stun("not a binding request".to_string()));
    }
    let txid = &request[8..20];

    let xport = source.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let (family, xaddr): (u8, Vec<u8>) = match source.ip() {
        IpAddr::V4(ip) => {
            let raw = u32::from_be_bytes(ip.octets());
            (FAMILY_IPV4, (raw ^ MAGIC_COOKIE).to_be_bytes().to_vec())
        }
        IpAddr::V6(ip) => {
            // v6 addresses XOR against magic cookie followed by the
            // transaction id
            let mut mask = [0u8; 16];
            mask[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..16].copy_from_slice(txid);
            let mut raw = ip.octets();
            for (b, m) in raw.iter_mut().zip(mask.iter()) {
                *b ^= m;
            }
            (FAMILY_IPV6, raw.to_vec())
        }
    };

    let value_len = 4 + xaddr.len();
    let attr_len = 4 + value_len;

    let mut buf = Vec::with_capacity(HEADER_SIZE + attr_len);
    buf.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    buf.extend_from_slice(&(attr_len as u16).to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(txid);

    buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    buf.extend_from_slice(&(value_len as u16).to_be_bytes());
    buf.push(0); // reserved
    buf.push(family);
    buf.extend_from_slice(&xport.to_be_bytes());
    buf.extend_from_slice(&xaddr);

    Ok(buf)
}

/// Decode the XOR-MAPPED-ADDRESS of a binding success response.
pub fn xor_mapped_address(buf: &[u8]) -> Option<SocketAddr> {
    if !is_binding_success(buf) {
        return None;
    }
    let txid = &buf[8..20];
    let mut rest = &buf[HEADER_SIZE..];

    while rest.len() >= 4 {
        let attr_type = u16::from_be_bytes([rest[0], rest[1]]);
        let attr_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let padded = (attr_len + 3) / 4 * 4;
        if rest.len() < 4 + attr_len {
            return None;
        }
        let value = &rest[4..4 + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 {
            let family = value[1];
            let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
            match family {
                FAMILY_IPV4 if attr_len == 8 => {
                    let raw =
                        u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
                    return Some(SocketAddr::new(IpAddr::from(raw.to_be_bytes()), port));
                }
                FAMILY_IPV6 if attr_len == 20 => {
                    let mut mask = [0u8; 16];
                    mask[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                    mask[4..16].copy_from_slice(txid);
                    let mut raw = [0u8; 16];
                    raw.copy_from_slice(&value[4..20]);
                    for (b, m) in raw.iter_mut().zip(mask.iter()) {
                        *b ^= m;
                    }
                    return Some(SocketAddr::new(IpAddr::from(raw), port));
                }
                _ => return None,
            }
        }

        rest = &rest[4 + padded..];
    }

    None
}
