//! PROXY protocol v2 header for remote endpoint propagation
//!
//! When a relay asks to include the remote endpoint, this header is written to
//! the backend before any client byte so the backend learns who the TLS
//! client really was. Binary format per HAProxy's PROXY protocol:
//!
//! - 12 byte signature
//! - version/command byte, family/transport byte, 2 byte address length
//! - source address, destination address, source port, destination port

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2, PROXY command
const VERSION_PROXY: u8 = 0x21;

const FAMILY_TCP4: u8 = 0x11;
const FAMILY_TCP6: u8 = 0x21;

const ADDR_LEN_V4: u16 = 12;
const ADDR_LEN_V6: u16 = 36;

/// The original connection as seen by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteEndpoint {
    /// The TLS client
    pub source: SocketAddr,
    /// The listener address the client connected to
    pub destination: SocketAddr,
}

impl RemoteEndpoint {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Encode as a PROXY v2 header
    ///
    /// Mixed families are normalized: IPv4-mapped IPv6 addresses are unmapped
    /// so both ends share a family, otherwise both are carried as IPv6.
    pub fn to_proxy_v2(&self) -> Vec<u8> {
        let src = unmap(self.source.ip());
        let dst = unmap(self.destination.ip());

        let mut header = Vec::with_capacity(16 + ADDR_LEN_V6 as usize);
        header.extend_from_slice(&SIGNATURE);
        header.push(VERSION_PROXY);

        match (src, dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                header.push(FAMILY_TCP4);
                header.extend_from_slice(&ADDR_LEN_V4.to_be_bytes());
                header.extend_from_slice(&src.octets());
                header.extend_from_slice(&dst.octets());
            }
            (src, dst) => {
                header.push(FAMILY_TCP6);
                header.extend_from_slice(&ADDR_LEN_V6.to_be_bytes());
                header.extend_from_slice(&to_v6(src).octets());
                header.extend_from_slice(&to_v6(dst).octets());
            }
        }

        header.extend_from_slice(&self.source.port().to_be_bytes());
        header.extend_from_slice(&self.destination.port().to_be_bytes());
        header
    }
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Decode a PROXY v2 header, returning the endpoint and bytes consumed
pub fn parse_proxy_v2(data: &[u8]) -> Option<(RemoteEndpoint, usize)> {
    if data.len() < 16 || data[..12] != SIGNATURE || data[12] != VERSION_PROXY {
        return None;
    }

    let len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let body = data.get(16..16 + len)?;

    let (src_ip, dst_ip, ports): (IpAddr, IpAddr, &[u8]) = match (data[13], len) {
        (FAMILY_TCP4, 12) => {
            let src: [u8; 4] = body[0..4].try_into().ok()?;
            let dst: [u8; 4] = body[4..8].try_into().ok()?;
            (Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into(), &body[8..12])
        }
        (FAMILY_TCP6, 36) => {
            let src: [u8; 16] = body[0..16].try_into().ok()?;
            let dst: [u8; 16] = body[16..32].try_into().ok()?;
            (Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into(), &body[32..36])
        }
        _ => return None,
    };

    let src_port = u16::from_be_bytes([ports[0], ports[1]]);
    let dst_port = u16::from_be_bytes([ports[2], ports[3]]);

    Some((
        RemoteEndpoint::new(
            SocketAddr::new(src_ip, src_port),
            SocketAddr::new(dst_ip, dst_port),
        ),
        16 + len,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_header_layout() {
        let endpoint = RemoteEndpoint::new(
            "192.168.1.1:12345".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        );
        let header = endpoint.to_proxy_v2();

        assert_eq!(header.len(), 28);
        assert_eq!(&header[..12], &SIGNATURE);
        assert_eq!(header[12], VERSION_PROXY);
        assert_eq!(header[13], FAMILY_TCP4);
        assert_eq!(&header[16..20], &[192, 168, 1, 1]);
        assert_eq!(&header[24..26], &12345u16.to_be_bytes());

        assert_eq!(parse_proxy_v2(&header), Some((endpoint, 28)));
    }

    #[test]
    fn test_ipv6_header() {
        let endpoint = RemoteEndpoint::new(
            "[2001:db8::1]:40000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        let header = endpoint.to_proxy_v2();

        assert_eq!(header.len(), 52);
        assert_eq!(header[13], FAMILY_TCP6);
        assert_eq!(parse_proxy_v2(&header), Some((endpoint, 52)));
    }

    #[test]
    fn test_mapped_addresses_are_unmapped() {
        // Dual-stack listeners report IPv4 clients as ::ffff:a.b.c.d
        let endpoint = RemoteEndpoint::new(
            "[::ffff:203.0.113.7]:5000".parse().unwrap(),
            "[::ffff:10.0.0.1]:443".parse().unwrap(),
        );
        let header = endpoint.to_proxy_v2();
        assert_eq!(header[13], FAMILY_TCP4);

        let (parsed, _) = parse_proxy_v2(&header).unwrap();
        assert_eq!(parsed.source, "203.0.113.7:5000".parse().unwrap());
    }

    #[test]
    fn test_mixed_families_use_ipv6() {
        let endpoint = RemoteEndpoint::new(
            "203.0.113.7:5000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        let header = endpoint.to_proxy_v2();
        assert_eq!(header[13], FAMILY_TCP6);
        assert_eq!(header.len(), 52);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_proxy_v2(&[0u8; 10]).is_none());
        assert!(parse_proxy_v2(&[0u8; 28]).is_none());

        let mut truncated = RemoteEndpoint::new(
            "192.168.1.1:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
        )
        .to_proxy_v2();
        truncated.truncate(20);
        assert!(parse_proxy_v2(&truncated).is_none());
    }
}
