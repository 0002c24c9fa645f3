//! Target address payload of CONNECT frames
//!
//! SOCKS5-style address encoding: a one-byte address type followed by the
//! address bytes and a big-endian port.

use super::ProtocolError;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

const ATYPE_IPV4: u8 = 0x01;
const ATYPE_DOMAIN: u8 = 0x03;
const ATYPE_IPV6: u8 = 0x04;

/// A dial target parsed from a CONNECT payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// Domain name and port
    Domain(String, u16),
    /// IPv6 address and port
    Ipv6(Ipv6Addr, u16),
}

impl TargetAddr {
    /// Parse a CONNECT payload.
    ///
    /// Lengths are validated before any slice is taken; a truncated payload
    /// or an out-of-range address type is a malformed address. Domain bytes
    /// are taken as-is (lossy UTF-8, no IDN normalization) — a hostname the
    /// resolver cannot handle simply fails resolution later.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (&atype, rest) = payload
            .split_first()
            .ok_or_else(|| ProtocolError::MalformedAddress("empty payload".to_string()))?;

        match atype {
            ATYPE_IPV4 => {
                if rest.len() < 6 {
                    return Err(ProtocolError::MalformedAddress(
                        "truncated IPv4 address".to_string(),
                    ));
                }
                let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
                let port = u16::from_be_bytes([rest[4], rest[5]]);
                Ok(TargetAddr::Ipv4(ip, port))
            }
            ATYPE_DOMAIN => {
                if rest.is_empty() {
                    return Err(ProtocolError::MalformedAddress(
                        "missing domain length".to_string(),
                    ));
                }
                let len = rest[0] as usize;
                if rest.len() < 1 + len + 2 {
                    return Err(ProtocolError::MalformedAddress(
                        "truncated domain address".to_string(),
                    ));
                }
                let domain = String::from_utf8_lossy(&rest[1..1 + len]).to_string();
                let port = u16::from_be_bytes([rest[1 + len], rest[1 + len + 1]]);
                Ok(TargetAddr::Domain(domain, port))
            }
            ATYPE_IPV6 => {
                if rest.len() < 18 {
                    return Err(ProtocolError::MalformedAddress(
                        "truncated IPv6 address".to_string(),
                    ));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                let port = u16::from_be_bytes([rest[16], rest[17]]);
                Ok(TargetAddr::Ipv6(Ipv6Addr::from(octets), port))
            }
            _ => Err(ProtocolError::MalformedAddress(format!(
                "unsupported address type 0x{:02x}",
                atype
            ))),
        }
    }

    /// Encode to the wire representation used in CONNECT payloads
    pub fn encode(&self) -> Vec<u8> {
        match self {
            TargetAddr::Ipv4(ip, port) => {
                let mut buf = Vec::with_capacity(7);
                buf.push(ATYPE_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            TargetAddr::Domain(domain, port) => {
                let mut buf = Vec::with_capacity(4 + domain.len());
                buf.push(ATYPE_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            TargetAddr::Ipv6(ip, port) => {
                let mut buf = Vec::with_capacity(19);
                buf.push(ATYPE_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) => *port,
            TargetAddr::Domain(_, port) => *port,
            TargetAddr::Ipv6(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
        }
    }
}
