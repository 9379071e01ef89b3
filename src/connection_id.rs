// connection_id.rs
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

// ==========================================
// Connection identity seen from the sending host
// ==========================================
/// Identity of one transport connection, oriented from the local host: for an
/// outbound packet the source is `local` and the destination is `remote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId {
    pub local: IpAddr,
    pub local_port: u16,
    pub remote: IpAddr,
    pub remote_port: u16,
    pub protocol: u8,
}

impl ConnectionId {
    pub fn tcp(local: impl Into<IpAddr>, local_port: u16, remote: impl Into<IpAddr>, remote_port: u16) -> Self {
        Self {
            local: local.into(),
            local_port,
            remote: remote.into(),
            remote_port,
            protocol: IPPROTO_TCP,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == IPPROTO_TCP
    }

    /// Reads the identity out of the network-layer bytes of an outbound packet.
    ///
    /// Returns `None` for truncated headers, unknown IP versions and anything
    /// whose transport header is not directly after the IP header. Ports are
    /// only filled in for TCP and UDP.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        // 1. Version nibble decides the header layout
        let version = payload.first()? >> 4;
        let (local, remote, protocol, l4_offset) = match version {
            4 => parse_ipv4(payload)?,
            6 => parse_ipv6(payload)?,
            _ => return None,
        };

        // 2. Transport ports (source port + destination port = 4 bytes)
        let (local_port, remote_port) = if protocol == IPPROTO_TCP || protocol == IPPROTO_UDP {
            let ports = payload.get(l4_offset..l4_offset + 4)?;
            (
                u16::from_be_bytes([ports[0], ports[1]]),
                u16::from_be_bytes([ports[2], ports[3]]),
            )
        } else {
            (0, 0)
        };

        Some(Self {
            local,
            local_port,
            remote,
            remote_port,
            protocol,
        })
    }
}

fn parse_ipv4(payload: &[u8]) -> Option<(IpAddr, IpAddr, u8, usize)> {
    if payload.len() < IPV4_MIN_HEADER {
        return None;
    }

    // IHL is counted in 32-bit words
    let ihl = (payload[0] & 0x0F) as usize * 4;
    if ihl < IPV4_MIN_HEADER || payload.len() < ihl {
        return None;
    }

    // Non-first fragments carry no transport header
    let frag_offset = u16::from_be_bytes([payload[6], payload[7]]) & 0x1FFF;
    if frag_offset != 0 {
        return None;
    }

    let src = Ipv4Addr::from_bits(u32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]));
    let dst = Ipv4Addr::from_bits(u32::from_be_bytes([payload[16], payload[17], payload[18], payload[19]]));

    Some((src.into(), dst.into(), payload[9], ihl))
}

fn parse_ipv6(payload: &[u8]) -> Option<(IpAddr, IpAddr, u8, usize)> {
    if payload.len() < IPV6_HEADER {
        return None;
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&payload[8..24]);
    dst.copy_from_slice(&payload[24..40]);

    // Extension headers are not walked; only a transport header right after
    // the fixed header is recognised.
    Some((Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into(), payload[6], IPV6_HEADER))
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn endpoint(f: &mut fmt::Formatter<'_>, addr: &IpAddr, port: u16) -> fmt::Result {
            match addr {
                IpAddr::V4(v4) => write!(f, "{v4}:{port}"),
                IpAddr::V6(v6) => write!(f, "[{v6}]:{port}"),
            }
        }
        endpoint(f, &self.local, self.local_port)?;
        f.write_str("->")?;
        endpoint(f, &self.remote, self.remote_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_header(proto: u8, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut p = vec![0u8; 20];
        p[0] = 0x45;
        p[9] = proto;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        p
    }

    #[test]
    fn parses_ipv4_tcp_ports() {
        let mut p = ipv4_header(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2]);
        p.extend_from_slice(&[0x13, 0x88, 0x00, 0x50]);
        p.resize(40, 0);

        let id = ConnectionId::parse(&p).unwrap();
        assert_eq!(id, ConnectionId::tcp(Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(10, 0, 0, 2), 80));
        assert_eq!(id.to_string(), "10.0.0.1:5000->10.0.0.2:80");
    }

    #[test]
    fn icmp_has_no_ports() {
        let mut p = ipv4_header(1, [10, 0, 0, 1], [10, 0, 0, 2]);
        p.resize(28, 0);

        let id = ConnectionId::parse(&p).unwrap();
        assert!(!id.is_tcp());
        assert_eq!((id.local_port, id.remote_port), (0, 0));
    }

    #[test]
    fn rejects_truncated_and_unknown_versions() {
        assert!(ConnectionId::parse(&[]).is_none());
        assert!(ConnectionId::parse(&[0x45; 12]).is_none());

        let mut p = ipv4_header(IPPROTO_TCP, [1, 1, 1, 1], [2, 2, 2, 2]);
        p[0] = 0x55;
        assert!(ConnectionId::parse(&p).is_none());

        // header claims options that are not there
        let mut p = ipv4_header(IPPROTO_TCP, [1, 1, 1, 1], [2, 2, 2, 2]);
        p[0] = 0x4F;
        assert!(ConnectionId::parse(&p).is_none());

        // TCP without room for the ports
        let p = ipv4_header(IPPROTO_TCP, [1, 1, 1, 1], [2, 2, 2, 2]);
        assert!(ConnectionId::parse(&p).is_none());
    }

    #[test]
    fn skips_non_first_fragments() {
        let mut p = ipv4_header(IPPROTO_TCP, [1, 1, 1, 1], [2, 2, 2, 2]);
        p.resize(40, 0);
        p[7] = 0x10;
        assert!(ConnectionId::parse(&p).is_none());
    }

    #[test]
    fn parses_ipv6_tcp() {
        let mut p = vec![0u8; 60];
        p[0] = 0x60;
        p[6] = IPPROTO_TCP;
        p[23] = 1; // ::1
        p[39] = 2; // ::2
        p[40..44].copy_from_slice(&[0xC3, 0x50, 0x01, 0xBB]);

        let id = ConnectionId::parse(&p).unwrap();
        assert!(id.is_tcp());
        assert_eq!(id.local_port, 50000);
        assert_eq!(id.remote_port, 443);
        assert_eq!(id.to_string(), "[::1]:50000->[::2]:443");
    }
}
