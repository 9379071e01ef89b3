//! Kernel TCP socket table queried over netlink `NETLINK_SOCK_DIAG`.
//!
//! Each lookup is one exact `SOCK_DIAG_BY_FAMILY` request for the connection's
//! 4-tuple asking for `INET_DIAG_INFO`. The kernel fills `struct tcp_info`
//! while holding the socket lock, so the reply is a consistent copy of the
//! connection state at the time of the request.

use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crossbeam::queue::ArrayQueue;
use tracing::trace;

use crate::connection_id::{ConnectionId, IPPROTO_TCP};
use crate::extractor::ExtractError;
use crate::table::{ConnectionTable, ProtocolState, TcpStateView};

const SOCK_DIAG_BY_FAMILY: u16 = 20;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 1;
const INET_DIAG_INFO: u16 = 2;
const INET_DIAG_NOCOOKIE: u32 = !0;
const TCP_CLOSE: u8 = 7;

const NLMSG_HDRLEN: usize = 16;
const INET_DIAG_SOCKID_LEN: usize = 48;
const INET_DIAG_REQ_V2_LEN: usize = 8 + INET_DIAG_SOCKID_LEN;
const INET_DIAG_MSG_LEN: usize = 24 + INET_DIAG_SOCKID_LEN;
const RTA_HDRLEN: usize = 4;
/// Size of `struct tcp_info` up to and including `tcpi_total_retrans`.
pub const TCP_INFO_MIN_LEN: usize = 104;

const RECV_BUF_LEN: usize = 8192;
const DEFAULT_POOL_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DiagError {
    #[error("netlink i/o: {0}")]
    Io(#[from] io::Error),
    #[error("no such socket")]
    NotFound,
    #[error("kernel returned error {0}")]
    Kernel(i32),
    #[error("malformed sock_diag reply")]
    Malformed,
    #[error("reply carried no tcp_info")]
    MissingInfo,
}

// ==========================================
// Parsed tcp_info (the fields the tap reads)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpInfo {
    pub state: u8,
    pub snd_mss: u32,
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub rtt: u32,
    pub snd_cwnd: u32,
    pub total_retrans: u32,
}

impl TcpInfo {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < TCP_INFO_MIN_LEN {
            return None;
        }
        let u32_at = |off: usize| u32::from_ne_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        Some(Self {
            state: raw[0],
            snd_mss: u32_at(16),
            unacked: u32_at(24),
            sacked: u32_at(28),
            lost: u32_at(32),
            retrans: u32_at(36),
            rtt: u32_at(68),
            snd_cwnd: u32_at(80),
            total_retrans: u32_at(100),
        })
    }
}

impl ProtocolState for TcpInfo {
    fn read(&self) -> Result<TcpStateView, ExtractError> {
        if self.state == TCP_CLOSE {
            return Err(ExtractError::ConnectionClosed);
        }
        Ok(TcpStateView {
            snd_cwnd: self.snd_cwnd,
            srtt_us: self.rtt,
            mss: self.snd_mss,
            packets_out: self.unacked,
            sacked_out: self.sacked,
            lost_out: self.lost,
            retrans_out: self.retrans,
            total_retrans: self.total_retrans,
        })
    }
}

// ==========================================
// Request encoding / reply decoding
// ==========================================
pub(crate) fn encode_request(id: &ConnectionId, seq: u32) -> Option<Vec<u8>> {
    let (family, src, dst) = match (id.local, id.remote) {
        (IpAddr::V4(l), IpAddr::V4(r)) => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src[..4].copy_from_slice(&l.octets());
            dst[..4].copy_from_slice(&r.octets());
            (libc::AF_INET as u8, src, dst)
        }
        (IpAddr::V6(l), IpAddr::V6(r)) => (libc::AF_INET6 as u8, l.octets(), r.octets()),
        _ => return None,
    };

    let total = NLMSG_HDRLEN + INET_DIAG_REQ_V2_LEN;
    let mut buf = Vec::with_capacity(total);

    // 1. nlmsghdr
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
    buf.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());

    // 2. inet_diag_req_v2
    buf.push(family);
    buf.push(IPPROTO_TCP);
    buf.push(1 << (INET_DIAG_INFO - 1));
    buf.push(0);
    buf.extend_from_slice(&u32::MAX.to_ne_bytes());

    // 3. inet_diag_sockid: ports are big endian, source is the local end
    buf.extend_from_slice(&id.local_port.to_be_bytes());
    buf.extend_from_slice(&id.remote_port.to_be_bytes());
    buf.extend_from_slice(&src);
    buf.extend_from_slice(&dst);
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&INET_DIAG_NOCOOKIE.to_ne_bytes());
    buf.extend_from_slice(&INET_DIAG_NOCOOKIE.to_ne_bytes());

    Some(buf)
}

/// Walks the netlink messages in `buf`. `Ok(None)` means nothing in the
/// datagram answered request `seq`.
pub(crate) fn decode_reply(buf: &[u8], seq: u32) -> Result<Option<TcpInfo>, DiagError> {
    let mut off = 0;
    while off + NLMSG_HDRLEN <= buf.len() {
        let hdr = &buf[off..];
        let len = u32::from_ne_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
        let kind = u16::from_ne_bytes([hdr[4], hdr[5]]);
        let msg_seq = u32::from_ne_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]);
        if len < NLMSG_HDRLEN || off + len > buf.len() {
            return Err(DiagError::Malformed);
        }
        let body = &buf[off + NLMSG_HDRLEN..off + len];
        off += align4(len);

        if msg_seq != seq {
            continue;
        }
        match kind {
            NLMSG_ERROR => {
                let code = body.get(..4).ok_or(DiagError::Malformed)?;
                let code = i32::from_ne_bytes([code[0], code[1], code[2], code[3]]);
                return match -code {
                    0 => Ok(None),
                    libc::ENOENT => Err(DiagError::NotFound),
                    errno => Err(DiagError::Kernel(errno)),
                };
            }
            NLMSG_DONE => return Err(DiagError::NotFound),
            SOCK_DIAG_BY_FAMILY => return decode_diag_msg(body).map(Some),
            _ => continue,
        }
    }
    Ok(None)
}

fn decode_diag_msg(body: &[u8]) -> Result<TcpInfo, DiagError> {
    if body.len() < INET_DIAG_MSG_LEN {
        return Err(DiagError::Malformed);
    }
    let mut off = INET_DIAG_MSG_LEN;
    while off + RTA_HDRLEN <= body.len() {
        let rta_len = u16::from_ne_bytes([body[off], body[off + 1]]) as usize;
        let rta_type = u16::from_ne_bytes([body[off + 2], body[off + 3]]);
        if rta_len < RTA_HDRLEN || off + rta_len > body.len() {
            return Err(DiagError::Malformed);
        }
        if rta_type == INET_DIAG_INFO {
            return TcpInfo::parse(&body[off + RTA_HDRLEN..off + rta_len]).ok_or(DiagError::Malformed);
        }
        off += align4(rta_len);
    }
    Err(DiagError::MissingInfo)
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

// ==========================================
// Netlink socket
// ==========================================
struct DiagSocket {
    fd: OwnedFd,
    seq: u32,
    buf: Vec<u8>,
}

impl DiagSocket {
    fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_SOCK_DIAG,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            fd,
            seq: 0,
            buf: vec![0; RECV_BUF_LEN],
        })
    }

    fn query(&mut self, id: &ConnectionId) -> Result<TcpInfo, DiagError> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let request = encode_request(id, seq).ok_or(DiagError::NotFound)?;

        // SAFETY: zeroed sockaddr_nl addresses the kernel (pid 0)
        let mut kernel: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        kernel.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                request.as_ptr().cast(),
                request.len(),
                0,
                (&kernel as *const libc::sockaddr_nl).cast(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // The kernel answers inside sendto(), so the reply is already queued;
        // never wait for it.
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr().cast(),
                    self.buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error().into());
            }
            if let Some(info) = decode_reply(&self.buf[..n as usize], seq)? {
                return Ok(info);
            }
        }
    }
}

// ==========================================
// Kernel connection table
// ==========================================
/// Looks connections up in the running kernel. Netlink sockets are pooled in
/// a lock-free queue so concurrent callers each work on their own socket.
pub struct SockDiagTable {
    pool: ArrayQueue<DiagSocket>,
}

impl SockDiagTable {
    pub fn new() -> Self {
        Self::with_pool_size(DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(size: usize) -> Self {
        Self {
            pool: ArrayQueue::new(size.max(1)),
        }
    }

    /// Opens one socket up front so a missing `NETLINK_SOCK_DIAG` shows up at
    /// startup instead of as silently skipped packets.
    pub fn probe(&self) -> io::Result<()> {
        let sock = DiagSocket::open()?;
        let _ = self.pool.push(sock);
        Ok(())
    }

    pub fn query(&self, id: &ConnectionId) -> Result<TcpInfo, DiagError> {
        let mut sock = match self.pool.pop() {
            Some(sock) => sock,
            None => DiagSocket::open()?,
        };
        let result = sock.query(id);
        // A socket that failed may hold a stale reply; let it close.
        if !matches!(result, Err(DiagError::Io(_))) {
            let _ = self.pool.push(sock);
        }
        result
    }
}

impl Default for SockDiagTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable for SockDiagTable {
    type State = TcpInfo;

    fn lookup(&self, id: &ConnectionId) -> Option<TcpInfo> {
        match self.query(id) {
            Ok(info) => Some(info),
            Err(DiagError::NotFound) => None,
            Err(err) => {
                trace!(conn = %id, %err, "sock_diag lookup failed");
                None
            }
        }
    }
}
