//! Wire-level codec: fixed big-endian integer packing and IPv4 parsing
//!
//! All conversions here are pure and independent of host byte order; the
//! protocol is big-endian on the wire regardless of the machine it runs on.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use crate::tunnel::TunnelError;

/// Encode a u16 as big-endian bytes
pub fn encode_u16(v: u16) -> [u8; 2] {
    v.to_be_bytes()
}

/// Encode a u32 as big-endian bytes
pub fn encode_u32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

/// Decode a big-endian u16 at `offset` without consuming the buffer
pub fn decode_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Decode a big-endian u32 at `offset` without consuming the buffer
pub fn decode_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parse a textual IPv4 address ("a.b.c.d") into its 32-bit value.
///
/// Rejects anything that is not exactly four dot-separated decimal octets
/// in the 0-255 range. Octets are plain digit runs: no sign, no leading
/// zeros beyond `"0"` itself (`u8::parse` alone would accept both).
pub fn parse_ipv4(text: &str) -> Result<u32, TunnelError> {
    let mut octets = [0u8; 4];
    let mut count = 0;

    for part in text.split('.') {
        if count == 4 {
            return Err(TunnelError::MalformedAddress(text.to_string()));
        }
        let plain_decimal = !part.is_empty()
            && part.len() <= 3
            && part.bytes().all(|b| b.is_ascii_digit())
            && (part.len() == 1 || !part.starts_with('0'));
        if !plain_decimal {
            return Err(TunnelError::MalformedAddress(text.to_string()));
        }
        octets[count] = part
            .parse::<u8>()
            .map_err(|_| TunnelError::MalformedAddress(text.to_string()))?;
        count += 1;
    }

    if count != 4 {
        return Err(TunnelError::MalformedAddress(text.to_string()));
    }

    Ok(u32::from_be_bytes(octets))
}

/// Hexadecimal rendering of a buffer, for frame-level tracing
pub fn hex_dump(buf: &[u8]) -> String {
    buf.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identity of one tunneled connection: the remote IPv4 address and port.
///
/// Two endpoints are equal iff both fields match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// IPv4 address as a 32-bit value (network order semantics)
    pub addr: u32,
    /// Remote TCP port
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: u32, port: u16) -> Self {
        Self { addr, port }
    }

    /// Build an endpoint from a textual IPv4 address and port
    pub fn from_text(ip: &str, port: u16) -> Result<Self, TunnelError> {
        Ok(Self::new(parse_ipv4(ip)?, port))
    }

    /// The address as an [`Ipv4Addr`]
    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }
}

impl TryFrom<SocketAddr> for Endpoint {
    type Error = TunnelError;

    /// Only IPv4 peers can be addressed by the wire format.
    fn try_from(addr: SocketAddr) -> Result<Self, TunnelError> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self::new(u32::from(*v4.ip()), v4.port())),
            SocketAddr::V6(v6) => Err(TunnelError::MalformedAddress(v6.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_roundtrip() {
        let encoded = encode_u16(0x115c);
        assert_eq!(encoded, [0x11, 0x5c]);
        assert_eq!(decode_u16(&encoded, 0), Some(0x115c));
    }

    #[test]
    fn test_u32_roundtrip() {
        let encoded = encode_u32(0xc0a8010a);
        assert_eq!(encoded, [0xc0, 0xa8, 0x01, 0x0a]);
        assert_eq!(decode_u32(&encoded, 0), Some(0xc0a8010a));
    }

    #[test]
    fn test_decode_at_offset() {
        let buf = [0xff, 0x12, 0x34, 0x56, 0x78];
        assert_eq!(decode_u16(&buf, 1), Some(0x1234));
        assert_eq!(decode_u32(&buf, 1), Some(0x12345678));
        // unchanged source
        assert_eq!(buf[0], 0xff);
    }

    #[test]
    fn test_decode_out_of_bounds() {
        let buf = [0x12, 0x34];
        assert_eq!(decode_u16(&buf, 1), None);
        assert_eq!(decode_u32(&buf, 0), None);
    }

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4("192.168.1.10").unwrap(), 0xc0a8010a);
        assert_eq!(parse_ipv4("0.0.0.0").unwrap(), 0);
        assert_eq!(parse_ipv4("255.255.255.255").unwrap(), u32::MAX);
    }

    #[test]
    fn test_parse_ipv4_rejects_malformed() {
        for bad in [
            "",
            "1.2.3",
            "1.2.3.4.5",
            "1.2.3.256",
            "a.b.c.d",
            "1..2.3",
            "1.2.3.-4",
            "1.2.3.+4",
            "01.2.3.4",
            "1.2.3.0004",
            " 1.2.3.4",
        ] {
            assert!(parse_ipv4(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_endpoint_display() {
        let ep = Endpoint::from_text("10.0.0.1", 1000).unwrap();
        assert_eq!(ep.to_string(), "10.0.0.1:1000");
    }

    #[test]
    fn test_endpoint_rejects_ipv6() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(Endpoint::try_from(addr).is_err());
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0xc0, 0xa8, 0x01]), "c0 a8 01");
    }
}
