use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::AddrError;

/// A destination address, numeric only — the SOCKS5 request this proxy
/// emits never carries a domain name (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::V4(_, p) | Address::V6(_, p) => *p,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::V4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Address::V6(*v6.ip(), v6.port()),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        match addr {
            Address::V4(ip, port) => SocketAddr::V4(SocketAddrV4::new(ip, port)),
            Address::V6(ip, port) => SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip, port) => write!(f, "{ip}:{port}"),
            Address::V6(ip, port) => write!(f, "[{ip}]:{port}"),
        }
    }
}

/// Parses `a.b.c.d:port`, `[v6]:port`, or `v6:port` when the v6 form
/// contains at least two `:` occurrences.
///
/// Heuristic: if the first and last `:` in `input` coincide, this is a
/// single port separator and the host is IPv4; otherwise the host is IPv6,
/// with brackets stripped if present.
pub fn decode(input: &str) -> Result<Address, AddrError> {
    let first = input.find(':').ok_or(AddrError::Malformed)?;
    let last = input.rfind(':').ok_or(AddrError::Malformed)?;

    if first == last {
        let (host, port) = input.split_at(first);
        let port = parse_port(&port[1..])?;
        let ip: Ipv4Addr = host.parse().map_err(|_| AddrError::Malformed)?;
        return Ok(Address::V4(ip, port));
    }

    let (host, port) = input.split_at(last);
    let port = parse_port(&port[1..])?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    let ip: Ipv6Addr = host.parse().map_err(|_| AddrError::Malformed)?;
    Ok(Address::V6(ip, port))
}

fn parse_port(s: &str) -> Result<u16, AddrError> {
    s.parse::<u32>().ok().filter(|p| *p <= 65535).map(|p| p as u16).ok_or(AddrError::PortOutOfRange)
}

/// Renders IPv4 as `a.b.c.d:p` and IPv6 as `[x:...:x]:p`.
pub fn format(addr: &Address) -> String {
    addr.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ipv4() {
        assert_eq!(decode("127.0.0.1:1080").unwrap(), Address::V4(Ipv4Addr::new(127, 0, 0, 1), 1080));
    }

    #[test]
    fn decode_ipv6_bracketed() {
        assert_eq!(
            decode("[2001:db8::1]:443").unwrap(),
            Address::V6("2001:db8::1".parse().unwrap(), 443)
        );
    }

    #[test]
    fn decode_ipv6_unbracketed() {
        assert_eq!(decode("::1:8080").unwrap(), Address::V6(Ipv6Addr::LOCALHOST, 8080));
    }

    #[test]
    fn decode_rejects_bad_port() {
        assert_eq!(decode("127.0.0.1:99999"), Err(AddrError::PortOutOfRange));
    }

    #[test]
    fn decode_rejects_missing_colon() {
        assert_eq!(decode("127.0.0.1"), Err(AddrError::Malformed));
    }

    #[test]
    fn roundtrip_v4() {
        let addr = Address::V4(Ipv4Addr::new(10, 0, 0, 5), 7777);
        assert_eq!(decode(&format(&addr)).unwrap(), addr);
    }

    #[test]
    fn roundtrip_v6() {
        let addr = Address::V6("fe80::1".parse().unwrap(), 53);
        assert_eq!(decode(&format(&addr)).unwrap(), addr);
    }
}
