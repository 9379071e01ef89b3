#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};

use tcp_metrics_tap::connection_id::{IPPROTO_TCP, IPPROTO_UDP};
use tcp_metrics_tap::{ConnectionId, LocalInterceptor, MemoryTable, RingSink, Tap, TcpStateView};

pub type TestTap = Tap<LocalInterceptor, MemoryTable, RingSink>;

pub fn conn(local_port: u16, remote_port: u16) -> ConnectionId {
    ConnectionId::tcp(Ipv4Addr::new(10, 0, 0, 1), local_port, Ipv4Addr::new(10, 0, 0, 2), remote_port)
}

/// Minimal IPv4 packet: 20 byte header plus a 20 byte transport header.
pub fn ipv4_packet(protocol: u8, id: &ConnectionId) -> Vec<u8> {
    let (IpAddr::V4(src), IpAddr::V4(dst)) = (id.local, id.remote) else {
        panic!("ipv4 only");
    };
    let mut p = vec![0u8; 40];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&40u16.to_be_bytes());
    p[8] = 64;
    p[9] = protocol;
    p[12..16].copy_from_slice(&src.octets());
    p[16..20].copy_from_slice(&dst.octets());
    p[20..22].copy_from_slice(&id.local_port.to_be_bytes());
    p[22..24].copy_from_slice(&id.remote_port.to_be_bytes());
    if protocol == IPPROTO_TCP {
        p[32] = 5 << 4;
        p[33] = 0x18; // PSH|ACK
    }
    p
}

pub fn tcp_packet(id: &ConnectionId) -> Vec<u8> {
    ipv4_packet(IPPROTO_TCP, id)
}

pub fn udp_packet(id: &ConnectionId) -> Vec<u8> {
    ipv4_packet(IPPROTO_UDP, id)
}

pub fn icmp_packet(id: &ConnectionId) -> Vec<u8> {
    ipv4_packet(1, id)
}

pub fn idle(cwnd: u32) -> TcpStateView {
    TcpStateView {
        snd_cwnd: cwnd,
        mss: 1448,
        ..Default::default()
    }
}

pub fn tap_with_ring(capacity: usize) -> (TestTap, LocalInterceptor, MemoryTable, RingSink) {
    let hook = LocalInterceptor::new();
    let table = MemoryTable::new();
    let ring = RingSink::new(capacity);
    let tap = Tap::new(hook.clone(), table.clone(), ring.clone());
    (tap, hook, table, ring)
}
